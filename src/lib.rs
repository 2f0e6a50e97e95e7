//! Cross-model memory alignment and verification.
//!
//! Independently trained models exchange hidden states and KV-caches through
//! four components:
//!
//! * [`WMatrixAligner`]: learns and applies transforms between latent spaces,
//!   reporting the measured error instead of hiding it;
//! * [`kv_cache`]: attention-ranked compression of key/value caches;
//! * [`AntiPoisoningVerifier`]: single-use challenges that check a seller's
//!   vectors behave like genuine model outputs;
//! * [`SemanticAnchorIndex`]: the fixed catalog of canonical prompts the
//!   verifier and calibration measure against.
//!
//! Artifacts travel in a checksummed [`Envelope`] (CRC32 plus an xxh3 strong
//! tail, optionally zstd-compressed and XChaCha20-Poly1305 sealed).
//! [`MemoryExchange`] wires everything behind a JSON request surface.

pub mod activation;
pub mod adapters;
pub mod aligner;
pub mod anchors;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod kv_cache;
pub mod math;
pub mod scoring;
pub mod service;
pub mod storage;
pub mod training;
pub mod verifier;
pub mod wmatrix;

pub use activation::Activation;
pub use adapters::{AttentionType, ModelAdapter};
pub use aligner::{AlignTarget, AlignmentResult, CreatedMatrix, MatrixDescriptor, TrainingReport, WMatrixAligner};
pub use anchors::{
    AnchorCategory, AnchorStatistics, AnchorVectorStore, CalibrationResult, MemoryAnchorStore, NearestAnchor,
    SemanticAnchor, SemanticAnchorIndex,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AlignmentConfig, CalibrationConfig, CompressionConfig, ProtocolConfig, VerificationConfig};
pub use envelope::{ArtifactKind, EncodeOptions, Envelope, Flags};
pub use error::{ErrorKind, ProtocolError, Result};
pub use kv_cache::{
    BandwidthEstimate, CompressedKvCache, CompressionResult, CompressionStats, DecompressedKvCache, QualityReport,
    SavingsEstimate,
};
pub use scoring::{Anomaly, AnomalyKind, ScoreBreakdown};
pub use service::{MemoryExchange, Request, Response};
pub use storage::{KeyValueStore, MemoryStore};
pub use training::TrainingPair;
pub use verifier::{AntiPoisoningVerifier, Challenge, ChallengeView, TestPrompt, VerificationResult};
pub use wmatrix::{Layer, MatrixId, QualityTier, WMatrix};
