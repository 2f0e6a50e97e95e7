//! Transport-agnostic request surface over all protocol components.
//!
//! Requests and responses are serde enums tagged by `method` / `type` with
//! camelCase fields, so any byte transport can carry them as JSON. Failures
//! are rendered as `{"error": {"kind", "code", "message"}}`.

use crate::activation::Activation;
use crate::adapters::ModelAdapter;
use crate::aligner::{AlignTarget, AlignmentResult, CreatedMatrix, MatrixDescriptor, TrainingReport, WMatrixAligner};
use crate::anchors::{
    AnchorCategory, AnchorStatistics, AnchorVectorStore, CalibrationResult, MemoryAnchorStore, NearestAnchor,
    SemanticAnchor, SemanticAnchorIndex,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{CompressionConfig, ProtocolConfig, VerificationConfig};
use crate::envelope::ENVELOPE_VERSION;
use crate::error::{ErrorKind, ProtocolError, Result};
use crate::kv_cache::{
    self, BandwidthEstimate, CompressedKvCache, CompressionResult, DecompressedKvCache, QualityReport,
    SavingsEstimate,
};
use crate::training::TrainingPair;
use crate::verifier::{AntiPoisoningVerifier, Challenge, ChallengeView, VerificationResult};
use crate::wmatrix::MatrixId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const DEFAULT_TOP_K: usize = 10;

/// Matrix selector on the wire: a stored id, or a descriptor for an
/// ephemeral matrix.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TargetSpec {
    #[serde(rename_all = "camelCase")]
    Stored { matrix_id: MatrixId },
    Descriptor(MatrixDescriptor),
}

impl From<TargetSpec> for AlignTarget {
    fn from(spec: TargetSpec) -> Self {
        match spec {
            TargetSpec::Stored { matrix_id } => AlignTarget::Stored(matrix_id),
            TargetSpec::Descriptor(d) => AlignTarget::Descriptor(d),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    Capability,
    CreateMatrix {
        source_model: String,
        target_model: String,
        source_dim: usize,
        target_dim: usize,
        #[serde(default)]
        activation: Option<Activation>,
    },
    TrainMatrix {
        source_model: String,
        target_model: String,
        pairs: Vec<TrainingPair>,
        #[serde(default)]
        activation: Option<Activation>,
    },
    Align {
        vector: Vec<f32>,
        target: TargetSpec,
    },
    AlignBatch {
        vectors: Vec<Vec<f32>>,
        target: TargetSpec,
    },
    SerializeMatrix {
        matrix_id: MatrixId,
    },
    DeserializeMatrix {
        payload: String,
    },
    Compress {
        keys: Vec<Vec<f32>>,
        values: Vec<Vec<f32>>,
        queries: Vec<Vec<f32>>,
        #[serde(default)]
        model_name: Option<String>,
        #[serde(default)]
        config: Option<CompressionConfig>,
    },
    Decompress {
        compressed: CompressedKvCache,
        original_length: usize,
    },
    EstimateBandwidth {
        compressed: CompressedKvCache,
        original_length: usize,
        vector_dimension: usize,
    },
    ValidateQuality {
        compressed: CompressedKvCache,
        original_length: usize,
        #[serde(default)]
        model_name: Option<String>,
    },
    EstimateSavings {
        model_name: String,
        num_tokens: usize,
        dimension: usize,
        #[serde(default)]
        attention_threshold: Option<f32>,
    },
    GetSupportedModels,
    GetModelAdapter {
        model_name: String,
    },
    GenerateChallenge {
        #[serde(default)]
        config: Option<VerificationConfig>,
    },
    GetChallenge {
        challenge_id: String,
    },
    Verify {
        challenge_id: String,
        vector_outputs: Vec<Vec<f32>>,
        nonce: String,
        #[serde(default)]
        config: Option<VerificationConfig>,
    },
    GetAnchors {
        #[serde(default)]
        category: Option<String>,
    },
    GetCategories,
    StoreAnchorVector {
        anchor_id: u32,
        vector: Vec<f32>,
    },
    FindNearest {
        vector: Vec<f32>,
        #[serde(default)]
        top_k: Option<usize>,
    },
    Calibrate {
        vector: Vec<f32>,
    },
    GetStatistics,
    PurgeExpired,
}

/// What this endpoint speaks, returned for `capability` requests.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub envelope_version: u8,
    pub compress: Vec<&'static str>,
    pub crypto: Vec<&'static str>,
    pub activations: Vec<Activation>,
    pub anchor_categories: Vec<AnchorCategory>,
}

impl Capability {
    fn current() -> Self {
        Self {
            envelope_version: ENVELOPE_VERSION,
            compress: vec!["zstd"],
            crypto: vec!["xchacha20poly1305"],
            activations: vec![Activation::Relu, Activation::Tanh, Activation::Sigmoid, Activation::Gelu],
            anchor_categories: AnchorCategory::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Response {
    Capability(Capability),
    MatrixCreated(CreatedMatrix),
    MatrixTrained(TrainingReport),
    Aligned(AlignmentResult),
    AlignedBatch { results: Vec<AlignmentResult> },
    Serialized { payload: String },
    Deserialized { matrix_id: MatrixId },
    Compressed(CompressionResult),
    Decompressed(DecompressedKvCache),
    Bandwidth(BandwidthEstimate),
    Quality(QualityReport),
    Savings(SavingsEstimate),
    SupportedModels { models: Vec<ModelAdapter> },
    /// `adapter` is null for models outside every known family.
    Adapter { adapter: Option<ModelAdapter> },
    Challenge(Challenge),
    ChallengeView(ChallengeView),
    Verification(VerificationResult),
    Anchors { anchors: Vec<SemanticAnchor> },
    Categories { categories: Vec<AnchorCategory> },
    AnchorStored { anchor_id: u32 },
    Nearest { anchors: Vec<NearestAnchor> },
    Calibration(CalibrationResult),
    Statistics(AnchorStatistics),
    Purged { count: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

impl From<&ProtocolError> for ErrorBody {
    fn from(e: &ProtocolError) -> Self {
        Self {
            kind: e.kind(),
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// Owns one instance of every component and routes requests to them.
pub struct MemoryExchange {
    config: ProtocolConfig,
    aligner: WMatrixAligner,
    anchors: Arc<SemanticAnchorIndex>,
    verifier: AntiPoisoningVerifier,
}

impl MemoryExchange {
    pub fn new(config: ProtocolConfig) -> Result<Self> {
        Self::with_parts(config, Arc::new(MemoryAnchorStore::new()), Arc::new(SystemClock))
    }

    /// Build with an external anchor vector store and time source.
    pub fn with_parts(
        config: ProtocolConfig,
        anchor_store: Arc<dyn AnchorVectorStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let anchors = Arc::new(SemanticAnchorIndex::with_store(anchor_store, config.calibration.clone()));
        let verifier = AntiPoisoningVerifier::with_clock(Arc::clone(&anchors), config.verification.clone(), clock);
        Ok(Self {
            aligner: WMatrixAligner::new(config.alignment.clone()),
            anchors,
            verifier,
            config,
        })
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn aligner(&self) -> &WMatrixAligner {
        &self.aligner
    }

    pub fn anchors(&self) -> &SemanticAnchorIndex {
        &self.anchors
    }

    pub fn verifier(&self) -> &AntiPoisoningVerifier {
        &self.verifier
    }

    fn compression_config(&self, model_name: Option<&str>) -> CompressionConfig {
        match model_name {
            Some(name) => CompressionConfig::for_model(name),
            None => self.config.compression.clone(),
        }
    }

    pub fn handle(&self, request: Request) -> Result<Response> {
        Ok(match request {
            Request::Capability => Response::Capability(Capability::current()),
            Request::CreateMatrix {
                source_model,
                target_model,
                source_dim,
                target_dim,
                activation,
            } => Response::MatrixCreated(self.aligner.create(
                &source_model,
                &target_model,
                source_dim,
                target_dim,
                activation,
            )?),
            Request::TrainMatrix {
                source_model,
                target_model,
                pairs,
                activation,
            } => Response::MatrixTrained(self.aligner.train(&source_model, &target_model, &pairs, activation)?),
            Request::Align { vector, target } => {
                Response::Aligned(self.aligner.align(&vector, AlignTarget::from(target))?)
            }
            Request::AlignBatch { vectors, target } => Response::AlignedBatch {
                results: self.aligner.align_batch(&vectors, AlignTarget::from(target))?,
            },
            Request::SerializeMatrix { matrix_id } => Response::Serialized {
                payload: self.aligner.serialize(&matrix_id)?,
            },
            Request::DeserializeMatrix { payload } => Response::Deserialized {
                matrix_id: self.aligner.deserialize(&payload)?,
            },
            Request::Compress {
                keys,
                values,
                queries,
                model_name,
                config,
            } => {
                let config = config.unwrap_or_else(|| self.compression_config(model_name.as_deref()));
                Response::Compressed(kv_cache::compress(&keys, &values, &queries, &config)?)
            }
            Request::Decompress {
                compressed,
                original_length,
            } => Response::Decompressed(kv_cache::decompress_with(
                &compressed,
                original_length,
                &self.config.compression,
            )?),
            Request::EstimateBandwidth {
                compressed,
                original_length,
                vector_dimension,
            } => Response::Bandwidth(kv_cache::estimate_bandwidth_with(
                &compressed,
                original_length,
                vector_dimension,
                self.config.compression.element_size,
            )),
            Request::ValidateQuality {
                compressed,
                original_length,
                model_name,
            } => {
                let config = self.compression_config(model_name.as_deref());
                Response::Quality(kv_cache::validate_quality(&compressed, original_length, &config))
            }
            Request::EstimateSavings {
                model_name,
                num_tokens,
                dimension,
                attention_threshold,
            } => Response::Savings(kv_cache::estimate_savings(
                &model_name,
                num_tokens,
                dimension,
                attention_threshold,
            )?),
            Request::GetSupportedModels => Response::SupportedModels {
                models: ModelAdapter::all().to_vec(),
            },
            Request::GetModelAdapter { model_name } => Response::Adapter {
                adapter: ModelAdapter::for_model(&model_name).cloned(),
            },
            Request::GenerateChallenge { config } => Response::Challenge(match config {
                Some(c) => self.verifier.generate_challenge_with(&c)?,
                None => self.verifier.generate_challenge()?,
            }),
            Request::GetChallenge { challenge_id } => {
                Response::ChallengeView(self.verifier.get_challenge(&challenge_id)?)
            }
            Request::Verify {
                challenge_id,
                vector_outputs,
                nonce,
                config,
            } => {
                let config = config.as_ref().unwrap_or(&self.config.verification);
                Response::Verification(self.verifier.verify_with(&challenge_id, &vector_outputs, &nonce, config)?)
            }
            Request::GetAnchors { category } => Response::Anchors {
                anchors: match category {
                    Some(c) => self.anchors.get_by_category(&c)?,
                    None => self.anchors.get_all(),
                },
            },
            Request::GetCategories => Response::Categories {
                categories: self.anchors.get_categories(),
            },
            Request::StoreAnchorVector { anchor_id, vector } => {
                self.anchors.store_anchor_vector(anchor_id, vector)?;
                Response::AnchorStored { anchor_id }
            }
            Request::FindNearest { vector, top_k } => Response::Nearest {
                anchors: self.anchors.find_nearest(&vector, top_k.unwrap_or(DEFAULT_TOP_K)),
            },
            Request::Calibrate { vector } => Response::Calibration(self.anchors.calibrate(&vector)),
            Request::GetStatistics => Response::Statistics(self.anchors.get_statistics()),
            Request::PurgeExpired => Response::Purged {
                count: self.verifier.purge_expired(),
            },
        })
    }

    /// Decode a JSON request, run it and encode the outcome. Never fails;
    /// errors become an `error` object.
    pub fn handle_json(&self, raw: &str) -> String {
        let outcome = serde_json::from_str::<Request>(raw)
            .map_err(ProtocolError::from)
            .and_then(|req| self.handle(req))
            .and_then(|resp| serde_json::to_string(&resp).map_err(ProtocolError::from));
        match outcome {
            Ok(json) => json,
            Err(e) => {
                debug!(kind = ?e.kind(), code = e.code(), "request failed");
                render_error(&e)
            }
        }
    }
}

fn render_error(e: &ProtocolError) -> String {
    let body = serde_json::json!({ "error": ErrorBody::from(e) });
    body.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn exchange() -> MemoryExchange {
        let mut config = ProtocolConfig::default();
        config.alignment.seed = Some(1);
        MemoryExchange::new(config).unwrap()
    }

    fn call(ex: &MemoryExchange, req: Value) -> Value {
        serde_json::from_str(&ex.handle_json(&req.to_string())).unwrap()
    }

    #[test]
    fn test_create_and_align_over_json() {
        let ex = exchange();
        let created = call(
            &ex,
            json!({"method": "createMatrix", "sourceModel": "a", "targetModel": "b", "sourceDim": 8, "targetDim": 12}),
        );
        assert_eq!(created["type"], "matrixCreated");
        assert_eq!(created["architecture"], "8 → 10 → 12");
        let id = created["matrixId"].clone();

        let aligned = call(
            &ex,
            json!({"method": "align", "vector": vec![0.1; 8], "target": {"matrixId": id}}),
        );
        assert_eq!(aligned["type"], "aligned");
        assert_eq!(aligned["alignedVector"].as_array().unwrap().len(), 12);

        let ephemeral = call(
            &ex,
            json!({"method": "align", "vector": vec![0.1; 4],
                   "target": {"sourceModel": "x", "targetModel": "y", "sourceDim": 4, "targetDim": 4}}),
        );
        assert_eq!(ephemeral["confidence"], 0.0);
    }

    #[test]
    fn test_errors_are_structured() {
        let ex = exchange();
        let err = call(
            &ex,
            json!({"method": "align", "vector": [1.0], "target": {"matrixId": "wm_missing"}}),
        );
        assert_eq!(err["error"]["kind"], "validation");
        assert_eq!(err["error"]["code"], "MatrixNotFound");

        let garbage: Value = serde_json::from_str(&ex.handle_json("{not json")).unwrap();
        assert_eq!(garbage["error"]["kind"], "serialization");

        let unknown = call(&ex, json!({"method": "getAnchors", "category": "astrology"}));
        assert_eq!(unknown["error"]["code"], "UnknownCategory");
    }

    #[test]
    fn test_challenge_roundtrip_over_json() {
        let ex = exchange();
        let challenge = call(&ex, json!({"method": "generateChallenge"}));
        assert_eq!(challenge["type"], "challenge");
        let id = challenge["id"].as_str().unwrap().to_string();

        let view = call(&ex, json!({"method": "getChallenge", "challengeId": id}));
        assert!(view.get("nonce").is_none());
        assert_eq!(view["testPrompts"].as_array().unwrap().len(), 10);

        let wrong = call(
            &ex,
            json!({"method": "verify", "challengeId": id, "vectorOutputs": [[1.0]], "nonce": "00"}),
        );
        assert_eq!(wrong["error"]["kind"], "protocol");
        assert_eq!(wrong["error"]["code"], "NonceMismatch");
    }

    #[test]
    fn test_compress_with_model_adapter() {
        let ex = exchange();
        let keys = vec![vec![0.0; 4]; 40];
        let resp = call(
            &ex,
            json!({"method": "compress", "keys": keys, "values": keys, "queries": [[1.0, 0.0, 0.0, 0.0]],
                   "modelName": "llama-3-8b"}),
        );
        assert_eq!(resp["type"], "compressed");
        // 0.88 of 40 equal weights needs 36 tokens.
        assert_eq!(resp["stats"]["compressedTokens"], 36);

        let compressed = resp["compressed"].clone();
        let restored = call(&ex, json!({"method": "decompress", "compressed": compressed, "originalLength": 40}));
        assert_eq!(restored["keys"].as_array().unwrap().len(), 40);
    }

    #[test]
    fn test_oversized_inputs_are_rejected() {
        let ex = exchange();
        let created = call(
            &ex,
            json!({"method": "createMatrix", "sourceModel": "a", "targetModel": "b",
                   "sourceDim": 8_589_934_592u64, "targetDim": 8_589_934_592u64}),
        );
        assert_eq!(created["error"]["code"], "InvalidDimension");

        let ephemeral = call(
            &ex,
            json!({"method": "align", "vector": [0.5],
                   "target": {"sourceModel": "x", "targetModel": "y", "sourceDim": 1, "targetDim": 1_000_000_000u64}}),
        );
        assert_eq!(ephemeral["error"]["code"], "InvalidDimension");

        let cache = json!({"keys": [[1.0]], "values": [[2.0]], "selectedIndices": [0], "cumulativeAttention": 1.0});
        let restored = call(
            &ex,
            json!({"method": "decompress", "compressed": cache.clone(), "originalLength": u64::MAX}),
        );
        assert_eq!(restored["error"]["code"], "LengthMismatch");

        let bandwidth = call(
            &ex,
            json!({"method": "estimateBandwidth", "compressed": cache, "originalLength": u64::MAX,
                   "vectorDimension": u64::MAX}),
        );
        assert_eq!(bandwidth["originalSize"], u64::MAX);
    }

    #[test]
    fn test_adapter_queries_and_savings() {
        let ex = exchange();
        let models = call(&ex, json!({"method": "getSupportedModels"}));
        assert_eq!(models["type"], "supportedModels");
        assert_eq!(models["models"].as_array().unwrap().len(), 7);

        let mistral = call(&ex, json!({"method": "getModelAdapter", "modelName": "mistral-7b"}));
        assert_eq!(mistral["adapter"]["attentionType"], "sliding_window");
        assert_eq!(mistral["adapter"]["windowSize"], 4096);
        let unknown = call(&ex, json!({"method": "getModelAdapter", "modelName": "falcon"}));
        assert!(unknown["adapter"].is_null());

        let savings = call(
            &ex,
            json!({"method": "estimateSavings", "modelName": "gpt-4", "numTokens": 1000, "dimension": 512}),
        );
        assert_eq!(savings["type"], "savings");
        assert_eq!(savings["modelFamily"], "gpt");
        assert!(savings["bandwidthSavingsPercent"].as_f64().unwrap() > 40.0);
    }

    #[test]
    fn test_capability() {
        let ex = exchange();
        let cap = call(&ex, json!({"method": "capability"}));
        assert_eq!(cap["envelopeVersion"], 1);
        assert_eq!(cap["crypto"][0], "xchacha20poly1305");
        assert_eq!(cap["anchorCategories"].as_array().unwrap().len(), 16);
    }
}
