//! Model configuration.

use crate::error::{FlashBertError, Result};
use serde::{Deserialize, Serialize};

/// Position embedding schemes accepted by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionEmbeddingType {
    /// Learned absolute position table.
    Absolute,
}

/// Configuration for a BERT encoder, as found in `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BertConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Number of layers.
    pub num_hidden_layers: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Intermediate dimension (FFN).
    pub intermediate_size: usize,
    /// Activation key, e.g. `gelu` or `gelu_pytorch_tanh`.
    pub hidden_act: String,
    /// Layer norm epsilon.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    /// Position embedding kind; only `absolute` can be loaded.
    #[serde(default = "default_position_embedding_type")]
    pub position_embedding_type: String,
    /// Size of the position table.
    pub max_position_embeddings: usize,
    /// Optional tighter input limit used by sentence-transformers exports.
    #[serde(default)]
    pub max_seq_length: Option<usize>,
    /// Number of token types.
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    /// Model architecture type.
    #[serde(default)]
    pub model_type: String,
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

fn default_position_embedding_type() -> String {
    "absolute".to_string()
}

fn default_type_vocab_size() -> usize {
    2
}

impl BertConfig {
    /// Head dimension.
    pub fn head_size(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Longest sequence a request may carry.
    pub fn max_input_length(&self) -> usize {
        self.max_seq_length.unwrap_or(self.max_position_embeddings)
    }

    /// Resolve the position embedding kind.
    pub fn position_embedding_kind(&self) -> Result<PositionEmbeddingType> {
        match self.position_embedding_type.as_str() {
            "absolute" => Ok(PositionEmbeddingType::Absolute),
            other => Err(FlashBertError::UnsupportedPositionEmbedding(
                other.to_string(),
            )),
        }
    }

    /// Reject configs no encoder can be built from.
    pub fn validate(&self) -> Result<()> {
        if self.num_hidden_layers == 0 {
            return Err(FlashBertError::InvalidConfig(
                "num_hidden_layers must be > 0".into(),
            ));
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(FlashBertError::InvalidConfig(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        self.position_embedding_kind()?;
        Ok(())
    }

    /// Load from JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(config)
    }
}

impl Default for BertConfig {
    fn default() -> Self {
        // bert-base-uncased
        Self {
            vocab_size: 30522,
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            hidden_act: "gelu".to_string(),
            layer_norm_eps: 1e-12,
            position_embedding_type: default_position_embedding_type(),
            max_position_embeddings: 512,
            max_seq_length: None,
            type_vocab_size: 2,
            model_type: "bert".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_json_with_defaults() {
        let json = r#"{
            "vocab_size": 100,
            "hidden_size": 32,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "intermediate_size": 64,
            "hidden_act": "gelu",
            "max_position_embeddings": 128
        }"#;
        let config: BertConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.head_size(), 8);
        assert_eq!(config.type_vocab_size, 2);
        assert!((config.layer_norm_eps - 1e-12).abs() < 1e-20);
        assert_eq!(
            config.position_embedding_kind().unwrap(),
            PositionEmbeddingType::Absolute
        );
        assert_eq!(config.max_input_length(), 128);
        config.validate().unwrap();
    }

    #[test]
    fn max_seq_length_wins_over_position_table() {
        let config = BertConfig {
            max_seq_length: Some(256),
            ..Default::default()
        };
        assert_eq!(config.max_input_length(), 256);
    }

    #[test]
    fn relative_position_embeddings_rejected() {
        let config = BertConfig {
            position_embedding_type: "relative_key".into(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            FlashBertError::UnsupportedPositionEmbedding(ref kind) if kind == "relative_key"
        ));
    }

    #[test]
    fn indivisible_heads_rejected() {
        let config = BertConfig {
            hidden_size: 30,
            num_attention_heads: 4,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(FlashBertError::InvalidConfig(_))
        ));
    }
}
