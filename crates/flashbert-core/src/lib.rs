//! # FlashBERT Core
//!
//! Forward-pass inference for BERT-family encoders over ragged batches.
//!
//! This crate provides:
//! - **Weight loading** from SafeTensors into a fused, matmul-ready layout
//! - **Fused add + layer norm** with three capability-selected kernels
//! - **Varlen attention** over packed sequences, or bias-masked attention
//!   over padded grids
//! - **Batch adapter** turning either batch layout into uniform forward-pass
//!   arguments
//! - **CLS pooling** into one embedding vector per input sequence

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod attention;
pub mod backend;
pub mod batch;
pub mod error;
pub mod model;

pub use backend::Backend;
pub use error::{FlashBertError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::attention::AttentionBackend;
    pub use crate::backend::Backend;
    pub use crate::batch::{Batch, BatchKind, BucketingConfig, EmbedRequest, FlashBatch, PaddedBatch};
    pub use crate::error::{FlashBertError, Result};
    pub use crate::model::{BertConfig, Checkpoint, Embedding, FlashBertModel, WeightLoader};
}
