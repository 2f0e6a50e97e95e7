//! The W-matrix: a small feed-forward stack mapping one model's latent space
//! into another's.

use crate::activation::Activation;
use crate::config::AlignmentConfig;
use crate::envelope::{self, ArtifactKind, Envelope};
use crate::error::{ProtocolError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Opaque identifier of a registered W-matrix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatrixId(String);

impl MatrixId {
    pub fn generate() -> Self {
        MatrixId(format!("wm_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MatrixId {
    fn from(s: String) -> Self {
        MatrixId(s)
    }
}

impl From<&str> for MatrixId {
    fn from(s: &str) -> Self {
        MatrixId(s.to_string())
    }
}

impl std::fmt::Display for MatrixId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Marketplace quality policy derived from epsilon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Platinum,
    Gold,
    Silver,
    Bronze,
    Rejected,
}

impl QualityTier {
    pub fn from_epsilon(epsilon: f32) -> Self {
        if epsilon < 0.005 {
            QualityTier::Platinum
        } else if epsilon < 0.01 {
            QualityTier::Gold
        } else if epsilon < 0.05 {
            QualityTier::Silver
        } else if epsilon < 0.10 {
            QualityTier::Bronze
        } else {
            QualityTier::Rejected
        }
    }

    pub fn is_acceptable(&self) -> bool {
        *self != QualityTier::Rejected
    }
}

/// One affine layer. `weights` is row-major, `output_dim x input_dim`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Layer {
    input_dim: usize,
    output_dim: usize,
    weights: Vec<f32>,
    bias: Vec<f32>,
}

impl Layer {
    pub fn new(input_dim: usize, output_dim: usize, weights: Vec<f32>, bias: Vec<f32>) -> Result<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(ProtocolError::InvalidDimension {
                field: "layer width",
                value: input_dim.min(output_dim),
            });
        }
        let expected = input_dim
            .checked_mul(output_dim)
            .ok_or_else(|| ProtocolError::serialization("layer size overflow"))?;
        if weights.len() != expected {
            return Err(ProtocolError::mismatch(expected, weights.len()));
        }
        if bias.len() != output_dim {
            return Err(ProtocolError::mismatch(output_dim, bias.len()));
        }
        Ok(Self {
            input_dim,
            output_dim,
            weights,
            bias,
        })
    }

    /// Xavier-normal weights, zero bias.
    pub fn random<R: Rng + ?Sized>(input_dim: usize, output_dim: usize, rng: &mut R) -> Self {
        let std = (2.0 / (input_dim + output_dim) as f64).sqrt() as f32;
        let weights = (0..input_dim * output_dim)
            .map(|_| rng.sample::<f32, _>(StandardNormal) * std)
            .collect();
        Self {
            input_dim,
            output_dim,
            weights,
            bias: vec![0.0; output_dim],
        }
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn bias(&self) -> &[f32] {
        &self.bias
    }

    /// `W x + b`, without activation.
    pub fn affine(&self, input: &[f32]) -> Vec<f32> {
        self.weights
            .chunks_exact(self.input_dim)
            .zip(self.bias.iter())
            .map(|(row, b)| crate::math::dot(row, input) + b)
            .collect()
    }
}

/// Immutable, validated transform from `source_dim` to `target_dim`.
///
/// Only the envelope codec reconstructs a matrix from bytes, so every
/// instance has passed the shape checks in [`WMatrix::from_parts`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WMatrix {
    source_model: String,
    target_model: String,
    source_dim: usize,
    target_dim: usize,
    activation: Activation,
    layers: Vec<Layer>,
    epsilon: f32,
}

impl WMatrix {
    /// Assemble a matrix, checking that the layer chain connects
    /// `source_dim` to `target_dim`.
    pub fn from_parts(
        source_model: impl Into<String>,
        target_model: impl Into<String>,
        activation: Activation,
        layers: Vec<Layer>,
        epsilon: f32,
    ) -> Result<Self> {
        let first = layers
            .first()
            .ok_or_else(|| ProtocolError::EmptySequence("W-matrix has no layers".into()))?;
        let source_dim = first.input_dim;
        let mut width = source_dim;
        for layer in &layers {
            if layer.input_dim != width {
                return Err(ProtocolError::mismatch(width, layer.input_dim));
            }
            width = layer.output_dim;
        }
        if !epsilon.is_finite() {
            return Err(ProtocolError::serialization("epsilon is not finite"));
        }
        Ok(Self {
            source_model: source_model.into(),
            target_model: target_model.into(),
            source_dim,
            target_dim: width,
            activation,
            layers,
            epsilon: epsilon.clamp(0.0, 1.0),
        })
    }

    /// Fresh, untrained stack with geometrically interpolated widths.
    /// Epsilon is 1.0 until training measures it.
    pub fn initialize<R: Rng + ?Sized>(
        source_model: &str,
        target_model: &str,
        source_dim: usize,
        target_dim: usize,
        activation: Activation,
        config: &AlignmentConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let widths = plan_widths(source_dim, target_dim, config)?;
        let layers = widths
            .windows(2)
            .map(|pair| Layer::random(pair[0], pair[1], rng))
            .collect();
        Self::from_parts(source_model, target_model, activation, layers, 1.0)
    }

    pub fn source_model(&self) -> &str {
        &self.source_model
    }

    pub fn target_model(&self) -> &str {
        &self.target_model
    }

    pub fn source_dim(&self) -> usize {
        self.source_dim
    }

    pub fn target_dim(&self) -> usize {
        self.target_dim
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn confidence(&self) -> f32 {
        (1.0 - self.epsilon).clamp(0.0, 1.0)
    }

    pub fn quality_tier(&self) -> QualityTier {
        QualityTier::from_epsilon(self.epsilon)
    }

    /// Widths from input to output, e.g. `[1536, 1920, 2432, 3072]`.
    pub fn transformation_path(&self) -> Vec<usize> {
        std::iter::once(self.source_dim)
            .chain(self.layers.iter().map(|l| l.output_dim))
            .collect()
    }

    pub fn architecture(&self) -> String {
        self.transformation_path()
            .iter()
            .map(|w| w.to_string())
            .collect::<Vec<_>>()
            .join(" → ")
    }

    /// Run the stack. Hidden layers apply the activation; the output layer is linear.
    pub fn forward(&self, vector: &[f32]) -> Result<Vec<f32>> {
        if vector.len() != self.source_dim {
            return Err(ProtocolError::mismatch(self.source_dim, vector.len()));
        }
        let last = self.layers.len() - 1;
        let mut current = vector.to_vec();
        for (i, layer) in self.layers.iter().enumerate() {
            let mut z = layer.affine(&current);
            if i < last {
                for v in z.iter_mut() {
                    *v = self.activation.apply(*v);
                }
            }
            current = z;
        }
        Ok(current)
    }

    pub(crate) fn encode_body(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        envelope::write_str(&mut buf, &self.source_model)?;
        envelope::write_str(&mut buf, &self.target_model)?;
        buf.write_u32::<LittleEndian>(dim_u32(self.source_dim)?)?;
        buf.write_u32::<LittleEndian>(dim_u32(self.target_dim)?)?;
        buf.write_u8(self.activation as u8)?;
        buf.write_f32::<LittleEndian>(self.epsilon)?;
        buf.write_u32::<LittleEndian>(self.layers.len() as u32)?;
        for layer in &self.layers {
            buf.write_u32::<LittleEndian>(dim_u32(layer.input_dim)?)?;
            buf.write_u32::<LittleEndian>(dim_u32(layer.output_dim)?)?;
            envelope::write_f32s(&mut buf, &layer.weights)?;
            envelope::write_f32s(&mut buf, &layer.bias)?;
        }
        Ok(buf)
    }

    pub(crate) fn decode_body(body: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(body);
        let source_model = envelope::read_str(&mut cursor)?;
        let target_model = envelope::read_str(&mut cursor)?;
        let source_dim = cursor.read_u32::<LittleEndian>()? as usize;
        let target_dim = cursor.read_u32::<LittleEndian>()? as usize;
        let activation = Activation::from_u8(cursor.read_u8()?)
            .ok_or_else(|| ProtocolError::serialization("invalid activation"))?;
        let epsilon = cursor.read_f32::<LittleEndian>()?;
        let num_layers = cursor.read_u32::<LittleEndian>()? as usize;

        let mut layers = Vec::new();
        for _ in 0..num_layers {
            let input_dim = cursor.read_u32::<LittleEndian>()? as usize;
            let output_dim = cursor.read_u32::<LittleEndian>()? as usize;
            let count = input_dim
                .checked_mul(output_dim)
                .ok_or_else(|| ProtocolError::serialization("layer size overflow"))?;
            let weights = envelope::read_f32s(&mut cursor, count)?;
            let bias = envelope::read_f32s(&mut cursor, output_dim)?;
            layers.push(
                Layer::new(input_dim, output_dim, weights, bias)
                    .map_err(|e| ProtocolError::serialization(e.to_string()))?,
            );
        }
        envelope::expect_end(&cursor)?;

        let matrix = Self::from_parts(source_model, target_model, activation, layers, epsilon)
            .map_err(|e| ProtocolError::serialization(e.to_string()))?;
        if matrix.source_dim != source_dim || matrix.target_dim != target_dim {
            return Err(ProtocolError::serialization(format!(
                "declared {}→{} but layers describe {}→{}",
                source_dim, target_dim, matrix.source_dim, matrix.target_dim
            )));
        }
        Ok(matrix)
    }

    pub(crate) fn to_envelope(&self) -> Result<Envelope> {
        Ok(Envelope::new(ArtifactKind::WMatrix, self.encode_body()?))
    }
}

fn dim_u32(d: usize) -> Result<u32> {
    u32::try_from(d).map_err(|_| ProtocolError::serialization(format!("dimension {} exceeds u32", d)))
}

/// Layer widths bridging `source_dim` to `target_dim`, each step changing the
/// width by at most `max_layer_ratio`. Every layer must stay within
/// `max_layer_params` weights.
pub fn plan_widths(source_dim: usize, target_dim: usize, config: &AlignmentConfig) -> Result<Vec<usize>> {
    if source_dim == 0 {
        return Err(ProtocolError::InvalidDimension {
            field: "sourceDim",
            value: source_dim,
        });
    }
    if target_dim == 0 {
        return Err(ProtocolError::InvalidDimension {
            field: "targetDim",
            value: target_dim,
        });
    }

    let ratio = target_dim as f64 / source_dim as f64;
    let steps = if source_dim == target_dim {
        1
    } else {
        let needed = (ratio.ln().abs() / (config.max_layer_ratio as f64).ln()).ceil() as usize;
        needed.clamp(1, config.max_layers)
    };

    let mut widths = Vec::with_capacity(steps + 1);
    widths.push(source_dim);
    for i in 1..steps {
        let w = source_dim as f64 * ratio.powf(i as f64 / steps as f64);
        widths.push(round_width(w, config.width_multiple));
    }
    widths.push(target_dim);

    for pair in widths.windows(2) {
        let params = pair[0].saturating_mul(pair[1]);
        if params > config.max_layer_params {
            return Err(ProtocolError::InvalidDimension {
                field: "layerParams",
                value: params,
            });
        }
    }
    Ok(widths)
}

fn round_width(w: f64, multiple: usize) -> usize {
    let m = multiple as f64;
    if w < m {
        w.round().max(1.0) as usize
    } else {
        ((w / m).round() * m) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_plan_widths_geometric() {
        let config = AlignmentConfig::default();
        assert_eq!(
            plan_widths(1536, 3072, &config).unwrap(),
            vec![1536, 1920, 2432, 3072]
        );
        assert_eq!(plan_widths(4096, 4096, &config).unwrap(), vec![4096, 4096]);
        assert_eq!(plan_widths(8, 12, &config).unwrap(), vec![8, 10, 12]);

        // Shrinking works the same way
        let down = plan_widths(3072, 768, &config).unwrap();
        assert_eq!(down.first(), Some(&3072));
        assert_eq!(down.last(), Some(&768));
        assert!(down.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_plan_widths_caps_layers() {
        let config = AlignmentConfig {
            max_layers: 2,
            ..Default::default()
        };
        assert_eq!(plan_widths(64, 8192, &config).unwrap().len(), 3);
    }

    #[test]
    fn test_invalid_dimensions() {
        let config = AlignmentConfig::default();
        assert!(matches!(
            plan_widths(0, 10, &config),
            Err(ProtocolError::InvalidDimension { field: "sourceDim", .. })
        ));
        assert!(matches!(
            plan_widths(10, 0, &config),
            Err(ProtocolError::InvalidDimension { field: "targetDim", .. })
        ));
    }

    #[test]
    fn test_plan_widths_rejects_oversized_layers() {
        let config = AlignmentConfig::default();
        assert!(matches!(
            plan_widths(1 << 33, 1 << 33, &config),
            Err(ProtocolError::InvalidDimension { field: "layerParams", value: usize::MAX })
        ));
        assert!(matches!(
            plan_widths(1_000_000, 1_000_000, &config),
            Err(ProtocolError::InvalidDimension { field: "layerParams", value: 1_000_000_000_000 })
        ));

        let tight = AlignmentConfig {
            max_layer_params: 100,
            ..Default::default()
        };
        assert_eq!(plan_widths(10, 10, &tight).unwrap(), vec![10, 10]);
        assert!(plan_widths(10, 11, &tight).is_err());
    }

    #[test]
    fn test_forward_hidden_activation_only() {
        // 2 → 2 → 1; relu on the hidden layer, linear output
        let hidden = Layer::new(2, 2, vec![1.0, 0.0, 0.0, 1.0], vec![0.0, 0.0]).unwrap();
        let out = Layer::new(2, 1, vec![1.0, 1.0], vec![-5.0]).unwrap();
        let m = WMatrix::from_parts("a", "b", Activation::Relu, vec![hidden, out], 0.02).unwrap();

        assert_eq!(m.forward(&[3.0, -4.0]).unwrap(), vec![-2.0]);
        assert_eq!(m.architecture(), "2 → 2 → 1");
        assert_eq!(m.quality_tier(), QualityTier::Silver);
        assert!((m.confidence() - 0.98).abs() < 1e-6);
        assert!(matches!(
            m.forward(&[1.0]),
            Err(ProtocolError::DimensionMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_from_parts_rejects_broken_chain() {
        let a = Layer::new(4, 3, vec![0.0; 12], vec![0.0; 3]).unwrap();
        let b = Layer::new(2, 5, vec![0.0; 10], vec![0.0; 5]).unwrap();
        assert!(WMatrix::from_parts("a", "b", Activation::Tanh, vec![a, b], 0.0).is_err());
        assert!(WMatrix::from_parts("a", "b", Activation::Tanh, vec![], 0.0).is_err());
        assert!(Layer::new(2, 2, vec![0.0; 3], vec![0.0; 2]).is_err());
    }

    #[test]
    fn test_body_roundtrip_bit_exact() {
        let mut rng = StdRng::seed_from_u64(7);
        let config = AlignmentConfig::default();
        let m = WMatrix::initialize("llama-3-8b", "mistral-7b", 8, 12, Activation::Gelu, &config, &mut rng)
            .unwrap();
        let decoded = WMatrix::decode_body(&m.encode_body().unwrap()).unwrap();
        assert_eq!(decoded, m);

        let v: Vec<f32> = (0..8).map(|i| i as f32 * 0.3 - 1.0).collect();
        let a = m.forward(&v).unwrap();
        let b = decoded.forward(&v).unwrap();
        assert_eq!(
            a.iter().map(|x| x.to_bits()).collect::<Vec<_>>(),
            b.iter().map(|x| x.to_bits()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_decode_body_rejects_truncation() {
        let mut rng = StdRng::seed_from_u64(1);
        let m = WMatrix::initialize("a", "b", 4, 4, Activation::Tanh, &AlignmentConfig::default(), &mut rng)
            .unwrap();
        let body = m.encode_body().unwrap();
        assert!(WMatrix::decode_body(&body[..body.len() - 3]).is_err());
    }

    #[test]
    fn test_quality_tiers() {
        assert_eq!(QualityTier::from_epsilon(0.001), QualityTier::Platinum);
        assert_eq!(QualityTier::from_epsilon(0.007), QualityTier::Gold);
        assert_eq!(QualityTier::from_epsilon(0.03), QualityTier::Silver);
        assert_eq!(QualityTier::from_epsilon(0.09), QualityTier::Bronze);
        assert_eq!(QualityTier::from_epsilon(0.10), QualityTier::Rejected);
        assert!(!QualityTier::Rejected.is_acceptable());
    }
}
