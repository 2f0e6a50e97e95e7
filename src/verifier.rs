//! Challenge-response verification of a seller's vectors.
//!
//! A challenge moves from issued to exactly one terminal state: passed,
//! failed, or expired. Consumption is a single `DashMap::remove`, so of any
//! number of concurrent `verify` calls for one id exactly one sees the
//! challenge. Protocol violations (expired, wrong nonce, wrong count) also
//! consume it.

use crate::anchors::{AnchorCategory, SemanticAnchorIndex};
use crate::clock::{Clock, SystemClock};
use crate::config::VerificationConfig;
use crate::error::{ProtocolError, Result};
use crate::scoring::{self, Anomaly, PromptRef, ScoreBreakdown};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

const NONCE_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestPrompt {
    pub anchor_id: u32,
    pub category: AnchorCategory,
    pub prompt: String,
}

/// An issued challenge, as returned to the party that requested it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub id: String,
    pub test_prompts: Vec<TestPrompt>,
    pub nonce: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Read-only view of a pending challenge; the nonce is withheld.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeView {
    pub id: String,
    pub test_prompts: Vec<TestPrompt>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub challenge_id: String,
    pub passed: bool,
    pub fidelity_score: f32,
    pub confidence: f32,
    pub anomalies: Vec<Anomaly>,
    pub details: ScoreBreakdown,
}

pub struct AntiPoisoningVerifier {
    challenges: DashMap<String, Challenge>,
    anchors: Arc<SemanticAnchorIndex>,
    clock: Arc<dyn Clock>,
    config: VerificationConfig,
}

impl AntiPoisoningVerifier {
    pub fn new(anchors: Arc<SemanticAnchorIndex>, config: VerificationConfig) -> Self {
        Self::with_clock(anchors, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        anchors: Arc<SemanticAnchorIndex>,
        config: VerificationConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            challenges: DashMap::new(),
            anchors,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    pub fn generate_challenge(&self) -> Result<Challenge> {
        self.generate_challenge_with(&self.config)
    }

    pub fn generate_challenge_with(&self, config: &VerificationConfig) -> Result<Challenge> {
        config.validate()?;
        let mut rng = rand::thread_rng();
        let test_prompts = self
            .anchors
            .sample_spread(config.challenge_size, &mut rng)
            .into_iter()
            .map(|id| {
                let anchor = self.anchors.get(id)?;
                Ok(TestPrompt {
                    anchor_id: anchor.anchor_id,
                    category: anchor.category,
                    prompt: anchor.prompt,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut nonce = [0u8; NONCE_BYTES];
        rng.fill_bytes(&mut nonce);

        let issued_at = self.clock.now();
        let expires_at = i64::try_from(config.timeout_ms)
            .ok()
            .and_then(Duration::try_milliseconds)
            .and_then(|timeout| issued_at.checked_add_signed(timeout))
            .ok_or_else(|| ProtocolError::InvalidConfig(format!("timeout_ms {} is out of range", config.timeout_ms)))?;
        let challenge = Challenge {
            id: uuid::Uuid::new_v4().to_string(),
            test_prompts,
            nonce: hex::encode(nonce),
            issued_at,
            expires_at,
        };
        self.challenges.insert(challenge.id.clone(), challenge.clone());

        info!(
            challenge_id = %challenge.id,
            prompts = challenge.test_prompts.len(),
            expires_at = %challenge.expires_at,
            "challenge issued"
        );
        Ok(challenge)
    }

    /// Valid up to and including `expires_at`.
    fn is_expired(&self, challenge: &Challenge) -> bool {
        self.clock.now() > challenge.expires_at
    }

    pub fn get_challenge(&self, challenge_id: &str) -> Result<ChallengeView> {
        let entry = self
            .challenges
            .get(challenge_id)
            .ok_or_else(|| ProtocolError::ChallengeNotFound(challenge_id.to_string()))?;
        let challenge = entry.value();
        if self.is_expired(challenge) {
            return Err(ProtocolError::ChallengeNotFound(challenge_id.to_string()));
        }
        Ok(ChallengeView {
            id: challenge.id.clone(),
            test_prompts: challenge.test_prompts.clone(),
            expires_at: challenge.expires_at,
        })
    }

    pub fn verify(&self, challenge_id: &str, vector_outputs: &[Vec<f32>], nonce: &str) -> Result<VerificationResult> {
        self.verify_with(challenge_id, vector_outputs, nonce, &self.config)
    }

    /// Consume the challenge and score the responses. Scoring thresholds come
    /// from `config`; the prompt count is fixed by the challenge itself.
    pub fn verify_with(
        &self,
        challenge_id: &str,
        vector_outputs: &[Vec<f32>],
        nonce: &str,
        config: &VerificationConfig,
    ) -> Result<VerificationResult> {
        let (_, challenge) = self
            .challenges
            .remove(challenge_id)
            .ok_or_else(|| ProtocolError::ChallengeNotFound(challenge_id.to_string()))?;

        if self.is_expired(&challenge) {
            warn!(challenge_id, "challenge expired before verification");
            return Err(ProtocolError::ChallengeExpired(challenge_id.to_string()));
        }
        if challenge.nonce != nonce {
            warn!(challenge_id, "nonce mismatch; challenge discarded");
            return Err(ProtocolError::NonceMismatch(challenge_id.to_string()));
        }
        if vector_outputs.len() != challenge.test_prompts.len() {
            return Err(ProtocolError::CountMismatch {
                challenge_id: challenge_id.to_string(),
                expected: challenge.test_prompts.len(),
                actual: vector_outputs.len(),
            });
        }

        let prompts: Vec<PromptRef> = challenge
            .test_prompts
            .iter()
            .map(|p| PromptRef {
                anchor_id: p.anchor_id,
                category: p.category,
            })
            .collect();
        let assessment = scoring::assess(&prompts, vector_outputs, &self.anchors, config);

        let worst = assessment
            .anomalies
            .iter()
            .map(|a| a.severity)
            .fold(0.0_f32, f32::max);
        let passed = assessment.reference_sufficient
            && assessment.fidelity_score >= config.fidelity_threshold
            && worst <= config.anomaly_threshold;

        info!(
            challenge_id,
            passed,
            fidelity = assessment.fidelity_score,
            anomalies = assessment.anomalies.len(),
            "challenge verified"
        );
        Ok(VerificationResult {
            challenge_id: challenge.id,
            passed,
            fidelity_score: assessment.fidelity_score,
            confidence: assessment.confidence,
            anomalies: assessment.anomalies,
            details: assessment.details,
        })
    }

    /// Drop every expired challenge; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.challenges.len();
        self.challenges.retain(|_, c| now <= c.expires_at);
        let purged = before.saturating_sub(self.challenges.len());
        if purged > 0 {
            debug!(purged, "expired challenges purged");
        }
        purged
    }

    pub fn active_challenges(&self) -> usize {
        self.challenges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn verifier() -> (AntiPoisoningVerifier, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let v = AntiPoisoningVerifier::with_clock(
            Arc::new(SemanticAnchorIndex::default()),
            VerificationConfig::default(),
            clock.clone(),
        );
        (v, clock)
    }

    fn responses(n: usize, dim: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| {
                (0..dim)
                    .map(|j| {
                        let t = ((i * 31 + j * 17) % 101) as f32 / 101.0 - 0.5;
                        t * t.abs() * 4.0 + t * 0.2
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_challenge_shape() {
        let (v, _) = verifier();
        let c = v.generate_challenge().unwrap();
        assert_eq!(c.test_prompts.len(), 10);
        assert_eq!(c.nonce.len(), 64);
        assert_eq!(c.expires_at - c.issued_at, Duration::minutes(5));
        let categories: std::collections::HashSet<_> = c.test_prompts.iter().map(|p| p.category).collect();
        assert_eq!(categories.len(), 10);

        let view = v.get_challenge(&c.id).unwrap();
        assert_eq!(view.test_prompts, c.test_prompts);
        assert_eq!(v.active_challenges(), 1);
    }

    #[test]
    fn test_single_use() {
        let (v, _) = verifier();
        let c = v.generate_challenge().unwrap();
        let outputs = responses(10, 32);

        v.verify(&c.id, &outputs, &c.nonce).unwrap();
        assert!(matches!(
            v.verify(&c.id, &outputs, &c.nonce),
            Err(ProtocolError::ChallengeNotFound(_))
        ));
        assert!(matches!(v.get_challenge(&c.id), Err(ProtocolError::ChallengeNotFound(_))));
    }

    #[test]
    fn test_expiry() {
        let (v, clock) = verifier();
        let c = v.generate_challenge().unwrap();
        clock.advance(Duration::minutes(5) + Duration::seconds(1));

        assert!(matches!(v.get_challenge(&c.id), Err(ProtocolError::ChallengeNotFound(_))));
        assert!(matches!(
            v.verify(&c.id, &responses(10, 8), &c.nonce),
            Err(ProtocolError::ChallengeExpired(_))
        ));
        assert!(matches!(
            v.verify(&c.id, &responses(10, 8), &c.nonce),
            Err(ProtocolError::ChallengeNotFound(_))
        ));
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let (v, clock) = verifier();
        let c = v.generate_challenge().unwrap();
        clock.set(c.expires_at);
        assert!(v.get_challenge(&c.id).is_ok());
        assert_eq!(v.purge_expired(), 0);
        assert!(v.verify(&c.id, &responses(10, 8), &c.nonce).is_ok());

        let late = v.generate_challenge().unwrap();
        clock.set(late.expires_at + Duration::milliseconds(1));
        assert!(matches!(
            v.verify(&late.id, &responses(10, 8), &late.nonce),
            Err(ProtocolError::ChallengeExpired(_))
        ));
    }

    #[test]
    fn test_no_cached_anchors_cannot_pass() {
        let (v, _) = verifier();
        let c = v.generate_challenge().unwrap();
        let result = v.verify(&c.id, &responses(10, 32), &c.nonce).unwrap();
        assert!(!result.passed);
        assert!(result
            .anomalies
            .iter()
            .any(|a| a.kind == crate::scoring::AnomalyKind::InsufficientReference));
    }

    #[test]
    fn test_protocol_violations_consume() {
        let (v, _) = verifier();
        let c = v.generate_challenge().unwrap();
        assert!(matches!(
            v.verify(&c.id, &responses(10, 8), "deadbeef"),
            Err(ProtocolError::NonceMismatch(_))
        ));
        assert_eq!(v.active_challenges(), 0);

        let c = v.generate_challenge().unwrap();
        assert!(matches!(
            v.verify(&c.id, &responses(9, 8), &c.nonce),
            Err(ProtocolError::CountMismatch { expected: 10, actual: 9, .. })
        ));
        assert!(matches!(
            v.verify(&c.id, &responses(10, 8), &c.nonce),
            Err(ProtocolError::ChallengeNotFound(_))
        ));
    }

    #[test]
    fn test_purge_expired() {
        let (v, clock) = verifier();
        v.generate_challenge().unwrap();
        v.generate_challenge().unwrap();
        clock.advance(Duration::minutes(3));
        let fresh = v.generate_challenge().unwrap();
        clock.advance(Duration::minutes(3));

        assert_eq!(v.purge_expired(), 2);
        assert_eq!(v.active_challenges(), 1);
        assert!(v.get_challenge(&fresh.id).is_ok());
    }

    #[test]
    fn test_custom_challenge_size() {
        let (v, _) = verifier();
        let config = VerificationConfig {
            challenge_size: 4,
            ..Default::default()
        };
        assert_eq!(v.generate_challenge_with(&config).unwrap().test_prompts.len(), 4);

        let bad = VerificationConfig {
            challenge_size: 0,
            ..Default::default()
        };
        assert!(matches!(v.generate_challenge_with(&bad), Err(ProtocolError::InvalidConfig(_))));
    }
}
