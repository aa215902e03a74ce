//! Model loading and inference.
//!
//! Provides the BERT encoder pipeline:
//! - Model configuration
//! - Weight loading into the fused compute layout
//! - Embedding, attention and feed-forward stages
//! - Encoder stack and CLS-pooling model driver

mod config;
mod embeddings;
mod golden;
mod layer;
mod layer_norm;
mod loader;
mod mlp;
mod transformer;

pub use config::{BertConfig, PositionEmbeddingType};
pub use embeddings::BertEmbeddings;
pub use golden::{GoldenCase, GoldenResult, GoldenSummary, GoldenTestHarness};
pub use layer::{BertAttention, BertLayer};
pub use layer_norm::{
    AddLayerNorm, FastLayerNorm, FusedAddLayerNorm, GenericAddLayerNorm, VectorizedAddLayerNorm,
};
pub use loader::{synthetic_checkpoint, Checkpoint, WeightLoader, WeightScope};
pub use mlp::{Activation, BertFeedForward};
pub use transformer::{BertEncoder, Embedding, FlashBertModel};
