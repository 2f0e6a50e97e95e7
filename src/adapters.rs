//! Per-family attention characteristics used to tune compression.

use crate::config::CompressionConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionType {
    MultiHead,
    GroupedQuery,
    SlidingWindow,
    MultiLatent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelAdapter {
    pub family: &'static str,
    pub attention_type: AttentionType,
    pub recommended_threshold: f32,
    /// Only set for sliding-window attention.
    pub window_size: Option<usize>,
}

const ADAPTERS: &[ModelAdapter] = &[
    ModelAdapter {
        family: "gpt",
        attention_type: AttentionType::MultiHead,
        recommended_threshold: 0.90,
        window_size: None,
    },
    ModelAdapter {
        family: "claude",
        attention_type: AttentionType::MultiHead,
        recommended_threshold: 0.92,
        window_size: None,
    },
    ModelAdapter {
        family: "llama",
        attention_type: AttentionType::GroupedQuery,
        recommended_threshold: 0.88,
        window_size: None,
    },
    ModelAdapter {
        family: "mistral",
        attention_type: AttentionType::SlidingWindow,
        recommended_threshold: 0.85,
        window_size: Some(4096),
    },
    ModelAdapter {
        family: "gemini",
        attention_type: AttentionType::MultiHead,
        recommended_threshold: 0.90,
        window_size: None,
    },
    ModelAdapter {
        family: "qwen",
        attention_type: AttentionType::GroupedQuery,
        recommended_threshold: 0.88,
        window_size: None,
    },
    ModelAdapter {
        family: "deepseek",
        attention_type: AttentionType::MultiLatent,
        recommended_threshold: 0.90,
        window_size: None,
    },
];

impl ModelAdapter {
    pub fn all() -> &'static [ModelAdapter] {
        ADAPTERS
    }

    /// Match a model name such as `"Mistral-7B-Instruct"` to its family by prefix.
    pub fn for_model(model_name: &str) -> Option<&'static ModelAdapter> {
        let name = model_name.trim().to_ascii_lowercase();
        ADAPTERS.iter().find(|a| name.starts_with(a.family))
    }
}

impl CompressionConfig {
    /// Apply the family's recommended threshold, capping `max_tokens` at the
    /// attention window. Unknown models get the defaults.
    pub fn for_model(model_name: &str) -> Self {
        let mut config = CompressionConfig::default();
        if let Some(adapter) = ModelAdapter::for_model(model_name) {
            config.attention_threshold = adapter.recommended_threshold;
            if let Some(window) = adapter.window_size {
                config.max_tokens = config.max_tokens.min(window);
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_lookup() {
        let adapter = ModelAdapter::for_model("Mistral-7B-Instruct").unwrap();
        assert_eq!(adapter.attention_type, AttentionType::SlidingWindow);
        assert_eq!(adapter.window_size, Some(4096));
        assert_eq!(ModelAdapter::for_model("gpt-4").unwrap().family, "gpt");
        assert!(ModelAdapter::for_model("falcon-40b").is_none());
        assert_eq!(ModelAdapter::all().len(), 7);
    }

    #[test]
    fn test_config_for_model() {
        let config = CompressionConfig::for_model("llama-3-70b");
        assert_eq!(config.attention_threshold, 0.88);
        config.validate().unwrap();

        let fallback = CompressionConfig::for_model("unknown");
        assert_eq!(fallback.attention_threshold, 0.90);
    }
}
