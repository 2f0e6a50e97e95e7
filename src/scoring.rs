//! Fidelity scoring of challenge responses.
//!
//! Three independent signals, each in [0, 1]:
//!
//! * pattern: does the response land near cached anchors of the prompt's
//!   own category?
//! * distribution: do the element statistics of each response (standardized
//!   mean, spread, excess kurtosis) fall inside the envelope of genuine
//!   model outputs?
//! * consistency: do pairwise similarities between responses reproduce the
//!   similarities between the corresponding anchors?
//!
//! A signal without reference data is excluded and the remaining weights
//! are renormalized. Distribution always has a reference: cached anchors
//! when enough exist, otherwise a dimension-aware default profile. When the
//! signals that remain carry less than `min_reference_weight` of the total
//! weight, the assessment is marked insufficient and cannot pass.

use crate::anchors::{AnchorCategory, SemanticAnchorIndex};
use crate::config::VerificationConfig;
use crate::math::{cosine_similarity, pearson, Moments};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Cached anchors needed before the distribution profile is learned from them.
const MIN_PROFILE_ANCHORS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    DistributionOutlier,
    ConsistencyViolation,
    PatternMismatch,
    NonFiniteValues,
    DimensionInconsistent,
    DuplicateVectors,
    InsufficientReference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub kind: AnomalyKind,
    /// Fraction of responses (or response pairs) affected.
    pub severity: f32,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub pattern_matches: usize,
    /// Prompts whose category had cached anchors to compare against.
    pub total_patterns: usize,
    pub distribution_score: f32,
    /// `None` when no prompt pair had reference anchors.
    pub consistency_score: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Assessment {
    pub fidelity_score: f32,
    pub confidence: f32,
    pub anomalies: Vec<Anomaly>,
    pub details: ScoreBreakdown,
    /// Enough reference data backed the score for a verdict.
    pub reference_sufficient: bool,
}

/// One challenge prompt as seen by the scorer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PromptRef {
    pub anchor_id: u32,
    pub category: AnchorCategory,
}

#[derive(Debug, Clone, Copy)]
struct Range {
    lo: f32,
    hi: f32,
}

impl Range {
    fn contains(&self, v: f32) -> bool {
        v >= self.lo && v <= self.hi
    }

    /// Observed span widened by a quarter on each side plus a fixed tolerance.
    fn widened(values: impl Iterator<Item = f32>, tol: f32) -> Self {
        let (mut lo, mut hi) = (f32::INFINITY, f32::NEG_INFINITY);
        for v in values {
            lo = lo.min(v);
            hi = hi.max(v);
        }
        let pad = 0.25 * (hi - lo) + tol;
        Self {
            lo: lo - pad,
            hi: hi + pad,
        }
    }
}

/// Acceptable element statistics for responses of one dimension.
#[derive(Debug, Clone, Copy)]
struct Profile {
    z: Range,
    /// Natural log of the standard deviation.
    log_std: Range,
    kurtosis: Range,
}

impl Profile {
    fn default_for(dim: usize) -> Self {
        let d = dim.max(1) as f32;
        let z = (4.0 / d.sqrt()).max(0.25);
        Self {
            z: Range { lo: -z, hi: z },
            log_std: Range {
                lo: 1e-4_f32.ln(),
                hi: 1e4_f32.ln(),
            },
            kurtosis: Range {
                lo: -0.6 - 3.0 * (24.0 / d).sqrt(),
                hi: 100.0,
            },
        }
    }

    fn from_anchors(moments: &[Moments]) -> Self {
        Self {
            z: Range::widened(moments.iter().map(|m| m.standardized_mean()), 0.1),
            log_std: Range::widened(moments.iter().map(|m| m.std.max(f32::MIN_POSITIVE).ln()), 2f32.ln()),
            kurtosis: Range::widened(moments.iter().map(|m| m.kurtosis), 0.5),
        }
    }

    fn accepts(&self, m: &Moments) -> bool {
        m.std > 0.0
            && self.z.contains(m.standardized_mean())
            && self.log_std.contains(m.std.ln())
            && self.kurtosis.contains(m.kurtosis)
    }
}

fn modal_dimension(vectors: &[Vec<f32>]) -> usize {
    let mut counts: HashMap<usize, usize> = HashMap::new();
    for v in vectors {
        *counts.entry(v.len()).or_insert(0) += 1;
    }
    // Highest count wins; ties go to the larger dimension.
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
        .map_or(0, |(dim, _)| dim)
}

fn fraction(count: usize, total: usize) -> f32 {
    if total == 0 {
        0.0
    } else {
        count as f32 / total as f32
    }
}

pub(crate) fn assess(
    prompts: &[PromptRef],
    vectors: &[Vec<f32>],
    index: &SemanticAnchorIndex,
    config: &VerificationConfig,
) -> Assessment {
    let n = vectors.len();
    let mut anomalies = Vec::new();
    let mut push = |kind: AnomalyKind, severity: f32, description: String| {
        if severity > 0.0 {
            anomalies.push(Anomaly {
                kind,
                severity,
                description,
            });
        }
    };

    let dim = modal_dimension(vectors);
    let finite: Vec<bool> = vectors.iter().map(|v| v.iter().all(|x| x.is_finite())).collect();
    let valid: Vec<bool> = vectors
        .iter()
        .zip(finite.iter())
        .map(|(v, &ok)| ok && dim > 0 && v.len() == dim)
        .collect();

    let non_finite = finite.iter().filter(|ok| !**ok).count();
    push(
        AnomalyKind::NonFiniteValues,
        fraction(non_finite, n),
        format!("{} of {} responses contain NaN or infinite values", non_finite, n),
    );
    let off_dim = vectors.iter().filter(|v| dim == 0 || v.len() != dim).count();
    push(
        AnomalyKind::DimensionInconsistent,
        fraction(off_dim, n),
        format!("{} of {} responses differ from the common dimension {}", off_dim, n, dim),
    );

    // Anchor references with the response dimension.
    let cached: Vec<(u32, Arc<Vec<f32>>)> = index
        .cached_vectors()
        .into_iter()
        .filter(|(_, v)| v.len() == dim && v.iter().all(|x| x.is_finite()))
        .collect();
    let mut by_category: HashMap<AnchorCategory, Vec<&[f32]>> = HashMap::new();
    let mut by_id: HashMap<u32, &[f32]> = HashMap::new();
    for (id, v) in &cached {
        if let Ok(category) = index.category_of(*id) {
            by_category.entry(category).or_default().push(v.as_slice());
        }
        by_id.insert(*id, v.as_slice());
    }

    // Pattern
    let mut pattern_matches = 0;
    let mut total_patterns = 0;
    for ((p, v), &ok) in prompts.iter().zip(vectors.iter()).zip(valid.iter()) {
        if !by_category.contains_key(&p.category) {
            continue;
        }
        total_patterns += 1;
        if !ok {
            continue;
        }
        let nearest = index.find_nearest(v, config.pattern_top_k);
        if nearest.iter().any(|a| a.category == p.category) {
            pattern_matches += 1;
        }
    }
    let pattern_score = (total_patterns > 0).then(|| fraction(pattern_matches, total_patterns));
    if let Some(score) = pattern_score {
        push(
            AnomalyKind::PatternMismatch,
            1.0 - score,
            format!(
                "{} of {} responses are not near anchors of their prompt's category",
                total_patterns - pattern_matches,
                total_patterns
            ),
        );
    }

    // Distribution
    let profile = if cached.len() >= MIN_PROFILE_ANCHORS {
        let moments: Vec<Moments> = cached.iter().map(|(_, v)| Moments::of(v)).collect();
        Profile::from_anchors(&moments)
    } else {
        Profile::default_for(dim)
    };
    let outliers = vectors
        .iter()
        .zip(valid.iter())
        .filter(|(v, &ok)| ok && !profile.accepts(&Moments::of(v)))
        .count();
    let invalid = valid.iter().filter(|ok| !**ok).count();
    let distribution_score = 1.0 - fraction(outliers + invalid, n);
    push(
        AnomalyKind::DistributionOutlier,
        fraction(outliers, n),
        format!("{} of {} responses have atypical value statistics", outliers, n),
    );

    // Consistency
    let reference = |p: &PromptRef| -> Option<Vec<f32>> {
        if let Some(v) = by_id.get(&p.anchor_id) {
            return Some(v.to_vec());
        }
        let members = by_category.get(&p.category)?;
        let mut centroid = vec![0.0_f32; dim];
        for m in members {
            for (c, x) in centroid.iter_mut().zip(m.iter()) {
                *c += x;
            }
        }
        let k = members.len() as f32;
        centroid.iter_mut().for_each(|c| *c /= k);
        Some(centroid)
    };
    let refs: Vec<Option<Vec<f32>>> = prompts.iter().map(|p| reference(p)).collect();

    let (mut observed, mut expected) = (Vec::new(), Vec::new());
    let mut violations = 0;
    let mut duplicates = vec![false; n];
    for i in 0..n {
        for j in (i + 1)..n {
            if !(valid[i] && valid[j]) {
                continue;
            }
            let obs = cosine_similarity(&vectors[i], &vectors[j]);
            if obs > config.duplicate_similarity {
                duplicates[i] = true;
                duplicates[j] = true;
            }
            if let (Some(Some(a)), Some(Some(b))) = (refs.get(i), refs.get(j)) {
                let exp = cosine_similarity(a, b);
                if (obs - exp).abs() > config.pair_tolerance {
                    violations += 1;
                }
                observed.push(obs);
                expected.push(exp);
            }
        }
    }
    let consistency_score = if observed.is_empty() {
        None
    } else {
        let agreement = 1.0 - fraction(violations, observed.len());
        Some(match pearson(&observed, &expected) {
            Some(r) => 0.5 * agreement + 0.5 * r.max(0.0),
            None => agreement,
        })
    };
    push(
        AnomalyKind::ConsistencyViolation,
        fraction(violations, observed.len()),
        format!(
            "{} of {} response pairs deviate from anchor similarity by more than {}",
            violations,
            observed.len(),
            config.pair_tolerance
        ),
    );
    let duplicated = duplicates.iter().filter(|d| **d).count();
    push(
        AnomalyKind::DuplicateVectors,
        fraction(duplicated, n),
        format!("{} of {} responses are near-identical copies", duplicated, n),
    );

    // Weighted fidelity over the available signals.
    let mut weighted = config.distribution_weight * distribution_score;
    let mut weight = config.distribution_weight;
    if let Some(s) = pattern_score {
        weighted += config.pattern_weight * s;
        weight += config.pattern_weight;
    }
    if let Some(s) = consistency_score {
        weighted += config.consistency_weight * s;
        weight += config.consistency_weight;
    }
    let fidelity_score = if weight > 0.0 {
        (weighted / weight).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let total_weight = config.pattern_weight + config.distribution_weight + config.consistency_weight;
    let referenced = (weight / total_weight).clamp(0.0, 1.0);
    let confidence = (fraction(n - invalid, n) * referenced).clamp(0.0, 1.0);
    let reference_sufficient = referenced + 1e-6 >= config.min_reference_weight;
    if !reference_sufficient {
        push(
            AnomalyKind::InsufficientReference,
            1.0 - referenced,
            format!(
                "only {:.0}% of the scoring weight had reference anchors (minimum {:.0}%)",
                referenced * 100.0,
                config.min_reference_weight * 100.0
            ),
        );
    }

    Assessment {
        fidelity_score,
        confidence,
        anomalies,
        details: ScoreBreakdown {
            pattern_matches,
            total_patterns,
            distribution_score,
            consistency_score,
        },
        reference_sufficient,
    }
}
