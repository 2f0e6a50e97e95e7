//! Registry of W-matrices and the operations buyers and sellers run on them.

use crate::activation::Activation;
use crate::config::AlignmentConfig;
use crate::crypto::SealKey;
use crate::envelope::{ArtifactKind, EncodeOptions, Envelope};
use crate::error::{ProtocolError, Result};
use crate::storage::KeyValueStore;
use crate::training::{self, TrainingPair};
use crate::wmatrix::{MatrixId, QualityTier, WMatrix};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

/// Shape of a matrix that is built on the fly and never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixDescriptor {
    pub source_model: String,
    pub target_model: String,
    pub source_dim: usize,
    pub target_dim: usize,
    #[serde(default)]
    pub activation: Option<Activation>,
}

impl MatrixDescriptor {
    /// Seed derived from the descriptor, so the same descriptor always
    /// yields the same ephemeral weights.
    fn seed(&self, activation: Activation) -> u64 {
        let key = format!(
            "{}\u{0}{}\u{0}{}\u{0}{}\u{0}{}",
            self.source_model,
            self.target_model,
            self.source_dim,
            self.target_dim,
            activation.name()
        );
        xxh3_64(key.as_bytes())
    }
}

/// Which matrix an `align` call should use.
#[derive(Debug, Clone)]
pub enum AlignTarget {
    Stored(MatrixId),
    Descriptor(MatrixDescriptor),
}

impl From<MatrixId> for AlignTarget {
    fn from(id: MatrixId) -> Self {
        AlignTarget::Stored(id)
    }
}

impl From<MatrixDescriptor> for AlignTarget {
    fn from(d: MatrixDescriptor) -> Self {
        AlignTarget::Descriptor(d)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedMatrix {
    pub matrix_id: MatrixId,
    pub architecture: String,
    pub transformation_path: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlignmentResult {
    pub aligned_vector: Vec<f32>,
    /// `clamp(1 - epsilon, 0, 1)`
    pub confidence: f32,
    /// The matrix's measured epsilon.
    pub alignment_loss: f32,
    pub transformation_path: Vec<usize>,
    pub quality_tier: QualityTier,
}

impl AlignmentResult {
    fn new(matrix: &WMatrix, aligned_vector: Vec<f32>) -> Self {
        Self {
            aligned_vector,
            confidence: matrix.confidence(),
            alignment_loss: matrix.epsilon(),
            transformation_path: matrix.transformation_path(),
            quality_tier: matrix.quality_tier(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingReport {
    pub matrix_id: MatrixId,
    pub architecture: String,
    pub epsilon: f32,
    pub iterations: usize,
    pub converged: bool,
    pub final_loss: f32,
    pub quality_tier: QualityTier,
    /// Whether epsilon was measured on pairs excluded from training.
    pub held_out: bool,
    /// Similarity of the singular spectra before and after alignment, in [0, 1].
    pub information_retention: f32,
}

/// Insert-once store of immutable matrices keyed by opaque id.
pub struct WMatrixAligner {
    matrices: DashMap<MatrixId, Arc<WMatrix>>,
    config: AlignmentConfig,
}

impl WMatrixAligner {
    pub fn new(config: AlignmentConfig) -> Self {
        Self {
            matrices: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &AlignmentConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.matrices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matrices.is_empty()
    }

    fn rng(&self) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    fn register(&self, matrix: WMatrix) -> MatrixId {
        let id = MatrixId::generate();
        self.matrices.insert(id.clone(), Arc::new(matrix));
        id
    }

    /// Build and register an untrained matrix. Its epsilon is 1.0 until it is
    /// replaced by a trained one.
    pub fn create(
        &self,
        source_model: &str,
        target_model: &str,
        source_dim: usize,
        target_dim: usize,
        activation: Option<Activation>,
    ) -> Result<CreatedMatrix> {
        let activation = activation.unwrap_or(self.config.default_activation);
        let matrix = WMatrix::initialize(
            source_model,
            target_model,
            source_dim,
            target_dim,
            activation,
            &self.config,
            &mut self.rng(),
        )?;
        let architecture = matrix.architecture();
        let transformation_path = matrix.transformation_path();
        let matrix_id = self.register(matrix);

        info!(%matrix_id, source_model, target_model, %architecture, "W-matrix created");
        Ok(CreatedMatrix {
            matrix_id,
            architecture,
            transformation_path,
        })
    }

    /// Fit a new matrix on paired hidden states and register it.
    pub fn train(
        &self,
        source_model: &str,
        target_model: &str,
        pairs: &[TrainingPair],
        activation: Option<Activation>,
    ) -> Result<TrainingReport> {
        let activation = activation.unwrap_or(self.config.default_activation);
        let outcome = training::fit(
            source_model,
            target_model,
            pairs,
            activation,
            &self.config,
            &mut self.rng(),
        )?;
        let architecture = outcome.matrix.architecture();
        let epsilon = outcome.matrix.epsilon();
        let quality_tier = outcome.matrix.quality_tier();
        let matrix_id = self.register(outcome.matrix);

        info!(
            %matrix_id,
            source_model,
            target_model,
            epsilon,
            iterations = outcome.iterations,
            converged = outcome.converged,
            ?quality_tier,
            "W-matrix trained"
        );
        Ok(TrainingReport {
            matrix_id,
            architecture,
            epsilon,
            iterations: outcome.iterations,
            converged: outcome.converged,
            final_loss: outcome.final_loss,
            quality_tier,
            held_out: outcome.held_out,
            information_retention: outcome.information_retention,
        })
    }

    pub fn get(&self, id: &MatrixId) -> Result<Arc<WMatrix>> {
        self.matrices
            .get(id)
            .map(|m| Arc::clone(m.value()))
            .ok_or_else(|| ProtocolError::MatrixNotFound(id.to_string()))
    }

    fn resolve(&self, target: &AlignTarget) -> Result<Arc<WMatrix>> {
        match target {
            AlignTarget::Stored(id) => self.get(id),
            AlignTarget::Descriptor(d) => {
                let activation = d.activation.unwrap_or(self.config.default_activation);
                let mut rng = StdRng::seed_from_u64(d.seed(activation));
                let matrix = WMatrix::initialize(
                    &d.source_model,
                    &d.target_model,
                    d.source_dim,
                    d.target_dim,
                    activation,
                    &self.config,
                    &mut rng,
                )?;
                Ok(Arc::new(matrix))
            }
        }
    }

    pub fn align(&self, vector: &[f32], target: impl Into<AlignTarget>) -> Result<AlignmentResult> {
        let matrix = self.resolve(&target.into())?;
        let aligned = matrix.forward(vector)?;
        Ok(AlignmentResult::new(&matrix, aligned))
    }

    /// Align many vectors with one matrix. Output order follows input order;
    /// any dimension mismatch fails the whole batch before work starts.
    pub fn align_batch(
        &self,
        vectors: &[Vec<f32>],
        target: impl Into<AlignTarget>,
    ) -> Result<Vec<AlignmentResult>> {
        let matrix = self.resolve(&target.into())?;
        if let Some(bad) = vectors.iter().find(|v| v.len() != matrix.source_dim()) {
            return Err(ProtocolError::mismatch(matrix.source_dim(), bad.len()));
        }
        vectors
            .par_iter()
            .map(|v| Ok(AlignmentResult::new(&matrix, matrix.forward(v)?)))
            .collect()
    }

    pub fn serialize(&self, id: &MatrixId) -> Result<String> {
        self.serialize_with(id, &EncodeOptions::default())
    }

    pub fn serialize_with(&self, id: &MatrixId, opts: &EncodeOptions) -> Result<String> {
        self.get(id)?.to_envelope()?.to_transport_string(opts)
    }

    /// Register a matrix from a transport string under a fresh id.
    /// Nothing is registered unless the whole payload validates.
    pub fn deserialize(&self, payload: &str) -> Result<MatrixId> {
        self.deserialize_with(payload, None)
    }

    pub fn deserialize_with(&self, payload: &str, key: Option<&SealKey>) -> Result<MatrixId> {
        let envelope = Envelope::from_transport_string(payload, key)?.expect_kind(ArtifactKind::WMatrix)?;
        let matrix = WMatrix::decode_body(&envelope.body)?;
        let id = self.register(matrix);
        debug!(matrix_id = %id, "W-matrix deserialized");
        Ok(id)
    }

    /// Write the matrix's envelope bytes under its id.
    pub fn persist(&self, id: &MatrixId, store: &dyn KeyValueStore) -> Result<()> {
        let bytes = self.get(id)?.to_envelope()?.encode(&EncodeOptions::compressed(3))?;
        store.put(id.as_str(), bytes)?;
        debug!(matrix_id = %id, "W-matrix persisted");
        Ok(())
    }

    /// Load a persisted matrix back under its original id. An id that is
    /// already registered keeps its existing entry.
    pub fn restore(&self, id: &MatrixId, store: &dyn KeyValueStore) -> Result<Arc<WMatrix>> {
        let bytes = store
            .get(id.as_str())?
            .ok_or_else(|| ProtocolError::MatrixNotFound(id.to_string()))?;
        let envelope = Envelope::decode(&bytes, None)?.expect_kind(ArtifactKind::WMatrix)?;
        let matrix = Arc::new(WMatrix::decode_body(&envelope.body)?);

        let stored = match self.matrices.entry(id.clone()) {
            Entry::Occupied(e) => Arc::clone(e.get()),
            Entry::Vacant(e) => Arc::clone(e.insert(matrix).value()),
        };
        debug!(matrix_id = %id, "W-matrix restored");
        Ok(stored)
    }
}

impl Default for WMatrixAligner {
    fn default() -> Self {
        Self::new(AlignmentConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use crate::storage::MemoryStore;

    fn seeded() -> WMatrixAligner {
        WMatrixAligner::new(AlignmentConfig {
            seed: Some(42),
            ..Default::default()
        })
    }

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| ((i % 17) as f32 - 8.0) * 0.05).collect()
    }

    #[test]
    fn test_create_and_align() {
        let aligner = seeded();
        let created = aligner.create("gpt-3.5", "gpt-4", 1536, 3072, None).unwrap();
        assert_eq!(created.architecture, "1536 → 1920 → 2432 → 3072");

        let result = aligner.align(&ramp(1536), created.matrix_id.clone()).unwrap();
        assert_eq!(result.aligned_vector.len(), 3072);
        assert!((0.0..=1.0).contains(&result.confidence));
        assert_eq!(result.transformation_path, vec![1536, 1920, 2432, 3072]);

        let err = aligner.align(&ramp(1024), created.matrix_id).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::DimensionMismatch { expected: 1536, actual: 1024 }
        ));
    }

    #[test]
    fn test_create_rejects_zero_dim() {
        let aligner = seeded();
        assert!(matches!(
            aligner.create("a", "b", 0, 16, None),
            Err(ProtocolError::InvalidDimension { .. })
        ));
        assert!(aligner.is_empty());
    }

    #[test]
    fn test_unknown_matrix() {
        let aligner = seeded();
        let err = aligner.align(&[1.0], MatrixId::from("wm_missing")).unwrap_err();
        assert!(matches!(err, ProtocolError::MatrixNotFound(id) if id == "wm_missing"));
    }

    #[test]
    fn test_descriptor_alignment_is_deterministic_and_unstored() {
        let aligner = WMatrixAligner::default();
        let d = MatrixDescriptor {
            source_model: "llama-3-8b".into(),
            target_model: "mistral-7b".into(),
            source_dim: 16,
            target_dim: 24,
            activation: None,
        };
        let v = ramp(16);
        let a = aligner.align(&v, d.clone()).unwrap();
        let b = aligner.align(&v, d).unwrap();
        assert_eq!(a.aligned_vector, b.aligned_vector);
        assert_eq!(a.confidence, 0.0);
        assert_eq!(a.quality_tier, QualityTier::Rejected);
        assert!(aligner.is_empty());
    }

    #[test]
    fn test_align_batch_preserves_order() {
        let aligner = seeded();
        let id = aligner.create("a", "b", 8, 12, None).unwrap().matrix_id;
        let vectors: Vec<Vec<f32>> = (0..16).map(|i| vec![i as f32 * 0.1; 8]).collect();

        let batch = aligner.align_batch(&vectors, id.clone()).unwrap();
        for (v, r) in vectors.iter().zip(batch.iter()) {
            assert_eq!(aligner.align(v, id.clone()).unwrap().aligned_vector, r.aligned_vector);
        }

        let mut bad = vectors.clone();
        bad[5] = vec![0.0; 7];
        assert!(matches!(
            aligner.align_batch(&bad, id),
            Err(ProtocolError::DimensionMismatch { expected: 8, actual: 7 })
        ));
    }

    #[test]
    fn test_serialize_roundtrip_bit_identical() {
        let aligner = seeded();
        let id = aligner.create("claude-3", "gpt-4", 32, 48, Some(Activation::Gelu)).unwrap().matrix_id;
        let payload = aligner.serialize(&id).unwrap();

        let restored = aligner.deserialize(&payload).unwrap();
        assert_ne!(restored, id);
        assert_eq!(*aligner.get(&restored).unwrap(), *aligner.get(&id).unwrap());

        let v = ramp(32);
        let a = aligner.align(&v, id).unwrap().aligned_vector;
        let b = aligner.align(&v, restored).unwrap().aligned_vector;
        assert!(a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits()));
    }

    #[test]
    fn test_malformed_payload_registers_nothing() {
        let aligner = seeded();
        let id = aligner.create("a", "b", 4, 4, None).unwrap().matrix_id;
        let before = aligner.len();

        assert!(matches!(
            aligner.deserialize("not base64 at all!"),
            Err(ProtocolError::Serialization(_))
        ));

        let mut tampered = aligner.serialize(&id).unwrap().into_bytes();
        let mid = tampered.len() / 2;
        tampered[mid] = if tampered[mid] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).unwrap();
        assert!(aligner.deserialize(&tampered).is_err());

        assert_eq!(aligner.len(), before);
    }

    #[test]
    fn test_sealed_payload_needs_key() {
        let aligner = seeded();
        let id = aligner.create("a", "b", 4, 6, None).unwrap().matrix_id;
        let key = crypto::generate_key();
        let payload = aligner.serialize_with(&id, &EncodeOptions::sealed(key)).unwrap();

        assert!(matches!(aligner.deserialize(&payload), Err(ProtocolError::Crypto(_))));
        let restored = aligner.deserialize_with(&payload, Some(&key)).unwrap();
        assert_eq!(*aligner.get(&restored).unwrap(), *aligner.get(&id).unwrap());
    }

    #[test]
    fn test_persist_restore() {
        let store = MemoryStore::new();
        let seller = seeded();
        let id = seller.create("a", "b", 6, 9, None).unwrap().matrix_id;
        seller.persist(&id, &store).unwrap();

        let buyer = WMatrixAligner::default();
        let restored = buyer.restore(&id, &store).unwrap();
        assert_eq!(*restored, *seller.get(&id).unwrap());
        assert!(buyer.get(&id).is_ok());

        assert!(matches!(
            buyer.restore(&MatrixId::from("wm_nope"), &store),
            Err(ProtocolError::MatrixNotFound(_))
        ));
    }

    #[test]
    fn test_train_registers_new_matrix() {
        let aligner = seeded();
        let pairs: Vec<TrainingPair> = (0..30)
            .map(|i| {
                let x: Vec<f32> = (0..4).map(|j| ((i * 7 + j * 3) % 11) as f32 * 0.1 - 0.5).collect();
                let y = vec![x[1], -x[0], x[3], x[2]];
                TrainingPair::new(x, y)
            })
            .collect();

        let report = aligner.train("src", "dst", &pairs, None).unwrap();
        assert_eq!(report.architecture, "4 → 4");
        assert!((0.0..=1.0).contains(&report.epsilon));
        assert_eq!(report.quality_tier, QualityTier::from_epsilon(report.epsilon));
        assert!(report.held_out);
        assert!((0.0..=1.0).contains(&report.information_retention));
        assert!(aligner.get(&report.matrix_id).is_ok());
    }
}
