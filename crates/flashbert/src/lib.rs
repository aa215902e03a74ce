//! # FlashBert
//!
//! BERT-family sentence embeddings over flash-style packed batches.
//!
//! - **Packed batches**: variable-length sequences concatenated without padding
//! - **Padded fallback**: a dense `[batch, len]` grid with optional shape bucketing
//! - **Pluggable kernels**: fused or vectorized residual layer norm, varlen attention
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flashbert::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let model = FlashBert::builder()
//!         .model_path("models/bge-small")
//!         .dtype("float16")
//!         .build()?;
//!
//!     let request = EmbedRequest::from_sequences(vec![
//!         (vec![101, 7592, 102], vec![0, 0, 0]),
//!         (vec![101, 2088, 2003, 102], vec![0, 0, 0, 0]),
//!     ]);
//!     let batch = model.batch_from_request(&request)?;
//!     let embeddings = model.embed(&batch)?;
//!     println!("{} x {}", embeddings.len(), model.hidden_size());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use flashbert_core::*;

mod engine;

pub use engine::{parse_dtype, FlashBert, FlashBertBuilder, FlashBertConfig};

/// Commonly used types.
pub mod prelude {
    pub use crate::engine::{FlashBert, FlashBertBuilder, FlashBertConfig};
    pub use crate::{
        backend::Backend,
        batch::{Batch, BatchKind, BucketingConfig, EmbedRequest, FlashBatch, PaddedBatch},
        error::{FlashBertError, Result},
        model::{BertConfig, Embedding, FlashBertModel, GoldenCase, GoldenTestHarness},
    };

    // Re-export useful external types
    pub use anyhow;
    pub use tracing;
}
