//! Policy constants and tuning knobs for every protocol component.
//!
//! Every struct loads from JSON and `ProtocolConfig` can be overridden from
//! the environment.

use crate::activation::Activation;
use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Top-level configuration for a [`crate::MemoryExchange`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProtocolConfig {
    pub alignment: AlignmentConfig,
    pub compression: CompressionConfig,
    pub verification: VerificationConfig,
    pub calibration: CalibrationConfig,
}

impl ProtocolConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: ProtocolConfig = serde_json::from_str(raw)
            .map_err(|e| ProtocolError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `LATENT_EXCHANGE_*` environment variables.
    /// Unparseable values are ignored.
    pub fn from_env() -> Result<Self> {
        let mut config = ProtocolConfig::default();

        overlay("LATENT_EXCHANGE_FIDELITY_THRESHOLD", &mut config.verification.fidelity_threshold);
        overlay("LATENT_EXCHANGE_ANOMALY_THRESHOLD", &mut config.verification.anomaly_threshold);
        overlay("LATENT_EXCHANGE_MIN_REFERENCE_WEIGHT", &mut config.verification.min_reference_weight);
        overlay("LATENT_EXCHANGE_CHALLENGE_SIZE", &mut config.verification.challenge_size);
        overlay("LATENT_EXCHANGE_CHALLENGE_TIMEOUT_MS", &mut config.verification.timeout_ms);
        overlay("LATENT_EXCHANGE_ATTENTION_THRESHOLD", &mut config.compression.attention_threshold);
        overlay("LATENT_EXCHANGE_MIN_TOKENS", &mut config.compression.min_tokens);
        overlay("LATENT_EXCHANGE_MAX_TOKENS", &mut config.compression.max_tokens);
        overlay("LATENT_EXCHANGE_LEARNING_RATE", &mut config.alignment.learning_rate);
        overlay("LATENT_EXCHANGE_MAX_ITERATIONS", &mut config.alignment.max_iterations);

        if let Ok(name) = std::env::var("LATENT_EXCHANGE_ACTIVATION") {
            if let Some(act) = Activation::parse(&name) {
                config.alignment.default_activation = act;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.alignment.validate()?;
        self.compression.validate()?;
        self.verification.validate()?;
        self.calibration.validate()
    }
}

fn overlay<T: FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        if let Ok(v) = raw.parse() {
            *slot = v;
        }
    }
}

fn check_unit(name: &str, v: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&v) || v.is_nan() {
        return Err(ProtocolError::InvalidConfig(format!(
            "{} must be within [0, 1], got {}",
            name, v
        )));
    }
    Ok(())
}

/// W-matrix construction and training parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlignmentConfig {
    /// Activation used when `create` is called without one.
    pub default_activation: Activation,
    /// Largest width ratio bridged by a single layer.
    pub max_layer_ratio: f32,
    /// Upper bound on the number of layers in a generated stack.
    pub max_layers: usize,
    /// Hidden widths are rounded to a multiple of this value.
    pub width_multiple: usize,
    pub learning_rate: f32,
    pub max_iterations: usize,
    /// Training stops once the mean squared error falls below this value.
    pub tolerance: f32,
    /// Blend factor of the orthogonal projection applied after each update.
    /// 1.0 projects fully onto the nearest scaled orthogonal matrix.
    pub orthogonality: f32,
    /// Leading fraction of iterations run without the projection. A projected
    /// iterate cannot change orientation (sign of det), so the warm-up lets
    /// descent settle on the target's orientation first.
    pub warmup_fraction: f32,
    /// Fraction of training pairs held out to measure epsilon.
    pub holdout_fraction: f32,
    /// Fixed seed for weight initialization. `None` draws from the OS.
    pub seed: Option<u64>,
    /// Largest weight count (`input × output`) allowed in a single layer.
    pub max_layer_params: usize,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            default_activation: Activation::Tanh,
            max_layer_ratio: 1.3,
            max_layers: 4,
            width_multiple: 64,
            learning_rate: 0.1,
            max_iterations: 500,
            tolerance: 1e-6,
            orthogonality: 1.0,
            warmup_fraction: 0.5,
            holdout_fraction: 0.2,
            seed: None,
            max_layer_params: 1 << 26,
        }
    }
}

impl AlignmentConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0) {
            return Err(ProtocolError::InvalidConfig(
                "learning_rate must be positive".into(),
            ));
        }
        if self.max_layer_ratio <= 1.0 {
            return Err(ProtocolError::InvalidConfig(
                "max_layer_ratio must be greater than 1".into(),
            ));
        }
        if self.max_layers == 0 || self.width_multiple == 0 || self.max_layer_params == 0 {
            return Err(ProtocolError::InvalidConfig(
                "max_layers, width_multiple and max_layer_params must be positive".into(),
            ));
        }
        check_unit("orthogonality", self.orthogonality)?;
        check_unit("warmup_fraction", self.warmup_fraction)?;
        if !(0.0..1.0).contains(&self.holdout_fraction) {
            return Err(ProtocolError::InvalidConfig(
                "holdout_fraction must be within [0, 1)".into(),
            ));
        }
        Ok(())
    }
}

/// KV-cache compression policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompressionConfig {
    /// Fraction of total attention mass the retained tokens must cover.
    pub attention_threshold: f32,
    pub min_tokens: usize,
    pub max_tokens: usize,
    /// Bytes per element used for bandwidth estimates (4 for f32).
    pub element_size: usize,
    /// Longest sequence `decompress` will materialize.
    pub max_original_length: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            attention_threshold: 0.90,
            min_tokens: 10,
            max_tokens: 2048,
            element_size: 4,
            max_original_length: 131_072,
        }
    }
}

impl CompressionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.attention_threshold > 0.0 && self.attention_threshold <= 1.0) {
            return Err(ProtocolError::InvalidConfig(format!(
                "attention_threshold must be within (0, 1], got {}",
                self.attention_threshold
            )));
        }
        if self.max_tokens == 0 || self.max_original_length == 0 {
            return Err(ProtocolError::InvalidConfig(
                "max_tokens and max_original_length must be positive".into(),
            ));
        }
        if self.min_tokens > self.max_tokens {
            return Err(ProtocolError::InvalidConfig(format!(
                "min_tokens ({}) exceeds max_tokens ({})",
                self.min_tokens, self.max_tokens
            )));
        }
        Ok(())
    }
}

/// Challenge issuance and scoring policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VerificationConfig {
    pub challenge_size: usize,
    pub timeout_ms: u64,
    pub fidelity_threshold: f32,
    pub anomaly_threshold: f32,
    pub pattern_weight: f32,
    pub distribution_weight: f32,
    pub consistency_weight: f32,
    /// Nearest anchors consulted per response vector when matching categories.
    pub pattern_top_k: usize,
    /// Largest tolerated gap between observed and expected pair similarity.
    pub pair_tolerance: f32,
    /// Cosine similarity above which two responses count as duplicates.
    pub duplicate_similarity: f32,
    /// Share of the total scoring weight that must have reference data
    /// before a challenge can pass.
    pub min_reference_weight: f32,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            challenge_size: 10,
            timeout_ms: 5 * 60 * 1000,
            fidelity_threshold: 0.85,
            anomaly_threshold: 0.15,
            pattern_weight: 0.4,
            distribution_weight: 0.3,
            consistency_weight: 0.3,
            pattern_top_k: 3,
            pair_tolerance: 0.25,
            duplicate_similarity: 0.9999,
            min_reference_weight: 0.5,
        }
    }
}

impl VerificationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.challenge_size == 0 {
            return Err(ProtocolError::InvalidConfig("challenge_size must be positive".into()));
        }
        if self.timeout_ms == 0 {
            return Err(ProtocolError::InvalidConfig("timeout_ms must be positive".into()));
        }
        check_unit("fidelity_threshold", self.fidelity_threshold)?;
        check_unit("anomaly_threshold", self.anomaly_threshold)?;
        check_unit("min_reference_weight", self.min_reference_weight)?;
        let weights = [
            self.pattern_weight,
            self.distribution_weight,
            self.consistency_weight,
        ];
        if weights.iter().any(|w| *w < 0.0) || weights.iter().sum::<f32>() <= 0.0 {
            return Err(ProtocolError::InvalidConfig(
                "scoring weights must be non-negative with a positive sum".into(),
            ));
        }
        if self.pattern_top_k == 0 {
            return Err(ProtocolError::InvalidConfig("pattern_top_k must be positive".into()));
        }
        Ok(())
    }
}

/// Thresholds behind `calibrate` recommendations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CalibrationConfig {
    pub top_anchors: usize,
    pub min_score: f32,
    pub min_coverage: f32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            top_anchors: 20,
            min_score: 0.5,
            min_coverage: 0.2,
        }
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.top_anchors == 0 {
            return Err(ProtocolError::InvalidConfig("top_anchors must be positive".into()));
        }
        check_unit("min_coverage", self.min_coverage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ProtocolConfig::default();
        config.validate().unwrap();
        assert_eq!(config.verification.challenge_size, 10);
        assert_eq!(config.verification.timeout_ms, 300_000);
        assert_eq!(config.compression.max_tokens, 2048);
        assert_eq!(config.verification.min_reference_weight, 0.5);
        assert_eq!(config.calibration.top_anchors, 20);
    }

    #[test]
    fn test_rejects_inverted_token_bounds() {
        let config = CompressionConfig {
            min_tokens: 50,
            max_tokens: 10,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ProtocolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = ProtocolConfig::from_json_str(
            r#"{"verification": {"fidelityThreshold": 0.9}, "compression": {"minTokens": 4}}"#,
        )
        .unwrap();
        assert_eq!(config.verification.fidelity_threshold, 0.9);
        assert_eq!(config.verification.anomaly_threshold, 0.15);
        assert_eq!(config.compression.min_tokens, 4);
        assert_eq!(config.compression.attention_threshold, 0.90);
    }

    #[test]
    fn test_json_out_of_range_rejected() {
        let err = ProtocolConfig::from_json_str(r#"{"verification": {"anomalyThreshold": 2.0}}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidConfig(_)));
    }
}
