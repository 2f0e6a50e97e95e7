//! Attention-ranked KV-cache compression.
//!
//! Every token is weighted by the attention it receives from the query set
//! (softmax of `q·k/√d`, averaged over queries). Tokens are kept greedily in
//! descending weight order, ties broken by position, until the retained mass
//! reaches the threshold or the token cap is hit; short selections are then
//! topped up to the token floor. Positions are returned ascending.

use crate::adapters::ModelAdapter;
use crate::config::CompressionConfig;
use crate::envelope::{self, ArtifactKind, EncodeOptions, Envelope};
use crate::crypto::SealKey;
use crate::error::{ProtocolError, Result};
use crate::math::{dot, softmax};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use tracing::debug;

/// A compressed cache. Built only by [`compress`] or by validated decoding,
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawCache")]
pub struct CompressedKvCache {
    keys: Vec<Vec<f32>>,
    values: Vec<Vec<f32>>,
    selected_indices: Vec<usize>,
    cumulative_attention: f32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCache {
    keys: Vec<Vec<f32>>,
    values: Vec<Vec<f32>>,
    selected_indices: Vec<usize>,
    cumulative_attention: f32,
}

impl TryFrom<RawCache> for CompressedKvCache {
    type Error = ProtocolError;

    fn try_from(raw: RawCache) -> Result<Self> {
        CompressedKvCache::new(raw.keys, raw.values, raw.selected_indices, raw.cumulative_attention)
    }
}

impl CompressedKvCache {
    /// Checks equal lengths, uniform widths and strictly ascending positions.
    pub fn new(
        keys: Vec<Vec<f32>>,
        values: Vec<Vec<f32>>,
        selected_indices: Vec<usize>,
        cumulative_attention: f32,
    ) -> Result<Self> {
        if keys.len() != values.len() || keys.len() != selected_indices.len() {
            return Err(ProtocolError::LengthMismatch(format!(
                "{} keys, {} values, {} indices",
                keys.len(),
                values.len(),
                selected_indices.len()
            )));
        }
        uniform_width(&keys)?;
        uniform_width(&values)?;
        if selected_indices.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ProtocolError::LengthMismatch(
                "selected indices must be strictly ascending".into(),
            ));
        }
        if !(0.0..=1.0 + 1e-4).contains(&cumulative_attention) {
            return Err(ProtocolError::LengthMismatch(format!(
                "cumulative attention {} outside [0, 1]",
                cumulative_attention
            )));
        }
        Ok(Self {
            keys,
            values,
            selected_indices,
            cumulative_attention: cumulative_attention.min(1.0),
        })
    }

    pub fn keys(&self) -> &[Vec<f32>] {
        &self.keys
    }

    pub fn values(&self) -> &[Vec<f32>] {
        &self.values
    }

    pub fn selected_indices(&self) -> &[usize] {
        &self.selected_indices
    }

    pub fn cumulative_attention(&self) -> f32 {
        self.cumulative_attention
    }

    pub fn len(&self) -> usize {
        self.selected_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected_indices.is_empty()
    }

    fn key_dim(&self) -> usize {
        self.keys.first().map_or(0, Vec::len)
    }

    fn value_dim(&self) -> usize {
        self.values.first().map_or(0, Vec::len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionStats {
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    /// `compressed_tokens / original_tokens`
    pub compression_ratio: f32,
    pub cumulative_attention: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionResult {
    pub compressed: CompressedKvCache,
    pub stats: CompressionStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecompressedKvCache {
    pub keys: Vec<Vec<f32>>,
    pub values: Vec<Vec<f32>>,
}

/// Byte sizes saturate at `u64::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthEstimate {
    pub original_size: u64,
    pub compressed_size: u64,
    pub savings_percent: f32,
}

/// Projected outcome of compressing `num_tokens` tokens before any cache
/// exists. See [`estimate_savings`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavingsEstimate {
    /// Adapter family matched by the model name, if any.
    pub model_family: Option<String>,
    pub attention_threshold: f32,
    pub estimated_tokens: usize,
    pub token_savings: usize,
    pub compression_ratio: f32,
    pub bandwidth_savings_bytes: u64,
    pub bandwidth_savings_percent: f32,
    pub estimated_attention_coverage: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityReport {
    pub passed: bool,
    pub attention_coverage: f32,
    pub information_loss: f32,
    pub recommendations: Vec<String>,
    pub warnings: Vec<String>,
}

fn uniform_width(rows: &[Vec<f32>]) -> Result<usize> {
    let width = rows.first().map_or(0, Vec::len);
    match rows.iter().find(|r| r.len() != width) {
        Some(bad) => Err(ProtocolError::mismatch(width, bad.len())),
        None => Ok(width),
    }
}

/// Average attention each token receives across all queries.
fn attention_weights(keys: &[Vec<f32>], queries: &[Vec<f32>], dim: usize) -> Vec<f32> {
    let scale = 1.0 / (dim as f32).sqrt();
    let per_query: Vec<Vec<f32>> = queries
        .par_iter()
        .map(|q| {
            let scores: Vec<f32> = keys.iter().map(|k| dot(q, k) * scale).collect();
            softmax(&scores)
        })
        .collect();

    let mut weights = vec![0.0_f32; keys.len()];
    for row in &per_query {
        for (w, a) in weights.iter_mut().zip(row.iter()) {
            *w += a;
        }
    }
    let n = queries.len() as f32;
    weights.iter_mut().for_each(|w| *w /= n);
    weights
}

pub fn compress(
    keys: &[Vec<f32>],
    values: &[Vec<f32>],
    queries: &[Vec<f32>],
    config: &CompressionConfig,
) -> Result<CompressionResult> {
    config.validate()?;
    if keys.is_empty() {
        return Err(ProtocolError::EmptySequence("no keys".into()));
    }
    if queries.is_empty() {
        return Err(ProtocolError::EmptySequence("no queries".into()));
    }
    if keys.len() != values.len() {
        return Err(ProtocolError::EmptySequence(format!(
            "{} keys but {} values",
            keys.len(),
            values.len()
        )));
    }
    let dim = uniform_width(keys)?;
    if dim == 0 {
        return Err(ProtocolError::InvalidDimension {
            field: "keyDim",
            value: 0,
        });
    }
    uniform_width(values)?;
    if let Some(q) = queries.iter().find(|q| q.len() != dim) {
        return Err(ProtocolError::mismatch(dim, q.len()));
    }
    for (name, rows) in [("keys", keys), ("values", values), ("queries", queries)] {
        if rows.iter().flatten().any(|x| !x.is_finite()) {
            return Err(ProtocolError::NonFiniteValue(name.into()));
        }
    }

    let n = keys.len();
    let weights = attention_weights(keys, queries, dim);
    // Finite inputs can still overflow `q·k`.
    if weights.iter().any(|w| !w.is_finite()) {
        return Err(ProtocolError::NonFiniteValue("attention scores".into()));
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| weights[b].total_cmp(&weights[a]).then(a.cmp(&b)));

    let cap = config.max_tokens.min(n);
    let floor = config.min_tokens.min(n);
    let mut taken = 0;
    let mut mass = 0.0_f32;
    while taken < cap && mass < config.attention_threshold {
        mass += weights[order[taken]];
        taken += 1;
    }
    while taken < floor {
        mass += weights[order[taken]];
        taken += 1;
    }

    let mut selected = order[..taken].to_vec();
    selected.sort_unstable();
    let cumulative_attention = mass.clamp(0.0, 1.0);

    let compressed = CompressedKvCache {
        keys: selected.iter().map(|&i| keys[i].clone()).collect(),
        values: selected.iter().map(|&i| values[i].clone()).collect(),
        selected_indices: selected,
        cumulative_attention,
    };
    let stats = CompressionStats {
        original_tokens: n,
        compressed_tokens: taken,
        compression_ratio: taken as f32 / n as f32,
        cumulative_attention,
    };
    debug!(
        original_tokens = n,
        compressed_tokens = taken,
        cumulative_attention,
        "KV-cache compressed"
    );
    Ok(CompressionResult { compressed, stats })
}

/// Restore the full sequence shape; unselected positions are zero vectors.
pub fn decompress(compressed: &CompressedKvCache, original_length: usize) -> Result<DecompressedKvCache> {
    decompress_with(compressed, original_length, &CompressionConfig::default())
}

/// [`decompress`] bounded by `config.max_original_length`.
pub fn decompress_with(
    compressed: &CompressedKvCache,
    original_length: usize,
    config: &CompressionConfig,
) -> Result<DecompressedKvCache> {
    if original_length > config.max_original_length {
        return Err(ProtocolError::LengthMismatch(format!(
            "original length {} exceeds the limit of {}",
            original_length, config.max_original_length
        )));
    }
    if let Some(&bad) = compressed.selected_indices.iter().find(|&&i| i >= original_length) {
        return Err(ProtocolError::LengthMismatch(format!(
            "index {} outside original length {}",
            bad, original_length
        )));
    }
    let mut keys = vec![vec![0.0; compressed.key_dim()]; original_length];
    let mut values = vec![vec![0.0; compressed.value_dim()]; original_length];
    for (slot, &i) in compressed.selected_indices.iter().enumerate() {
        keys[i].clone_from(&compressed.keys[slot]);
        values[i].clone_from(&compressed.values[slot]);
    }
    Ok(DecompressedKvCache { keys, values })
}

/// Transfer size with and without compression, for f32 elements.
pub fn estimate_bandwidth(
    compressed: &CompressedKvCache,
    original_length: usize,
    vector_dimension: usize,
) -> BandwidthEstimate {
    estimate_bandwidth_with(compressed, original_length, vector_dimension, 4)
}

/// `N × D × 2 × element_size` bytes before, the same for the kept tokens after.
pub fn estimate_bandwidth_with(
    compressed: &CompressedKvCache,
    original_length: usize,
    vector_dimension: usize,
    element_size: usize,
) -> BandwidthEstimate {
    let per_token = token_bytes(vector_dimension, element_size);
    let original_size = (original_length as u64).saturating_mul(per_token);
    let compressed_size = (compressed.len() as u64).saturating_mul(per_token);
    let savings_percent = if original_length == 0 || per_token == 0 {
        0.0
    } else {
        ((1.0 - compressed.len() as f64 / original_length as f64) * 100.0) as f32
    };
    BandwidthEstimate {
        original_size,
        compressed_size,
        savings_percent,
    }
}

/// Key plus value bytes for one token.
fn token_bytes(vector_dimension: usize, element_size: usize) -> u64 {
    (vector_dimension as u64)
        .saturating_mul(2)
        .saturating_mul(element_size as u64)
}

/// `H(n) = 1 + 1/2 + … + 1/n`, asymptotic beyond a few thousand terms.
fn harmonic(n: usize) -> f64 {
    const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;
    if n <= 4096 {
        (1..=n).rev().map(|k| 1.0 / k as f64).sum()
    } else {
        let x = n as f64;
        x.ln() + EULER_GAMMA + 1.0 / (2.0 * x) - 1.0 / (12.0 * x * x)
    }
}

/// Estimate compression of `num_tokens` f32 tokens of `dimension` for a model
/// family without running it.
///
/// Attention is assumed to follow a Zipf law over tokens (the k-th strongest
/// token receives mass ∝ 1/k). The estimate keeps the shortest prefix of that
/// ranking reaching the threshold, bounded by the family's token limits the
/// same way [`compress`] is. `attention_threshold` overrides the family's
/// recommended threshold.
pub fn estimate_savings(
    model_name: &str,
    num_tokens: usize,
    dimension: usize,
    attention_threshold: Option<f32>,
) -> Result<SavingsEstimate> {
    let mut config = CompressionConfig::for_model(model_name);
    if let Some(threshold) = attention_threshold {
        config.attention_threshold = threshold;
    }
    config.validate()?;
    let model_family = ModelAdapter::for_model(model_name).map(|a| a.family.to_string());

    if num_tokens == 0 {
        return Ok(SavingsEstimate {
            model_family,
            attention_threshold: config.attention_threshold,
            estimated_tokens: 0,
            token_savings: 0,
            compression_ratio: 1.0,
            bandwidth_savings_bytes: 0,
            bandwidth_savings_percent: 0.0,
            estimated_attention_coverage: 1.0,
        });
    }

    let total = harmonic(num_tokens);
    let target = config.attention_threshold as f64 * total;
    let (mut lo, mut hi) = (1, num_tokens);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if harmonic(mid) >= target {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    let kept = lo
        .min(config.max_tokens.min(num_tokens))
        .max(config.min_tokens.min(num_tokens));
    let saved = num_tokens - kept;

    Ok(SavingsEstimate {
        model_family,
        attention_threshold: config.attention_threshold,
        estimated_tokens: kept,
        token_savings: saved,
        compression_ratio: (kept as f64 / num_tokens as f64) as f32,
        bandwidth_savings_bytes: (saved as u64).saturating_mul(token_bytes(dimension, config.element_size)),
        bandwidth_savings_percent: (saved as f64 / num_tokens as f64 * 100.0) as f32,
        estimated_attention_coverage: (harmonic(kept) / total).min(1.0) as f32,
    })
}

/// Judge whether a compressed cache kept enough attention mass.
pub fn validate_quality(
    compressed: &CompressedKvCache,
    original_length: usize,
    config: &CompressionConfig,
) -> QualityReport {
    let coverage = compressed.cumulative_attention;
    let kept = compressed.len();
    let mut warnings = Vec::new();
    let mut recommendations = Vec::new();

    if compressed.selected_indices.iter().any(|&i| i >= original_length) {
        warnings.push(format!(
            "selected positions exceed the original length {}",
            original_length
        ));
    }
    // Small tolerance for f32 accumulation.
    let short = coverage + 1e-4 < config.attention_threshold;
    if short {
        warnings.push(format!(
            "attention coverage {:.3} is below the {:.2} threshold",
            coverage, config.attention_threshold
        ));
        if kept >= config.max_tokens {
            recommendations.push(format!(
                "raise max_tokens above {} to reach the attention threshold",
                config.max_tokens
            ));
        }
    }
    if original_length > 0 && kept < config.min_tokens.min(original_length) {
        warnings.push(format!(
            "only {} tokens kept, fewer than the minimum of {}",
            kept, config.min_tokens
        ));
    }
    if original_length > 0 {
        let ratio = kept as f32 / original_length as f32;
        if ratio > 0.8 && original_length > config.min_tokens {
            recommendations.push(
                "attention is spread evenly; a lower threshold would save more bandwidth".into(),
            );
        } else if ratio < 0.05 && coverage < 0.95 {
            recommendations.push(
                "aggressive compression; consider a higher threshold for long-range recall".into(),
            );
        }
    }

    QualityReport {
        passed: warnings.is_empty(),
        attention_coverage: coverage,
        information_loss: (1.0 - coverage).clamp(0.0, 1.0),
        recommendations,
        warnings,
    }
}

/// Wrap a compressed cache into a transport string.
pub fn encode_cache(cache: &CompressedKvCache, opts: &EncodeOptions) -> Result<String> {
    let mut body = Vec::new();
    body.write_u32::<LittleEndian>(to_u32(cache.len())?)?;
    body.write_u32::<LittleEndian>(to_u32(cache.key_dim())?)?;
    body.write_u32::<LittleEndian>(to_u32(cache.value_dim())?)?;
    body.write_f32::<LittleEndian>(cache.cumulative_attention)?;
    for &i in &cache.selected_indices {
        body.write_u32::<LittleEndian>(to_u32(i)?)?;
    }
    for row in cache.keys.iter().chain(cache.values.iter()) {
        envelope::write_f32s(&mut body, row)?;
    }
    Envelope::new(ArtifactKind::KvCache, body).to_transport_string(opts)
}

pub fn decode_cache(payload: &str, key: Option<&SealKey>) -> Result<CompressedKvCache> {
    let envelope = Envelope::from_transport_string(payload, key)?.expect_kind(ArtifactKind::KvCache)?;
    let mut cursor = Cursor::new(envelope.body.as_slice());
    let count = cursor.read_u32::<LittleEndian>()? as usize;
    let key_dim = cursor.read_u32::<LittleEndian>()? as usize;
    let value_dim = cursor.read_u32::<LittleEndian>()? as usize;
    let cumulative_attention = cursor.read_f32::<LittleEndian>()?;

    let mut indices = Vec::new();
    for _ in 0..count {
        indices.push(cursor.read_u32::<LittleEndian>()? as usize);
    }
    let keys = (0..count)
        .map(|_| envelope::read_f32s(&mut cursor, key_dim))
        .collect::<Result<Vec<_>>>()?;
    let values = (0..count)
        .map(|_| envelope::read_f32s(&mut cursor, value_dim))
        .collect::<Result<Vec<_>>>()?;
    envelope::expect_end(&cursor)?;

    CompressedKvCache::new(keys, values, indices, cumulative_attention)
        .map_err(|e| ProtocolError::serialization(e.to_string()))
}

fn to_u32(v: usize) -> Result<u32> {
    u32::try_from(v).map_err(|_| ProtocolError::serialization(format!("{} exceeds u32", v)))
}
