//! Attention computation backends.
//!
//! Provides abstractions over different attention implementations:
//! - `FlashAttnBackend` - GPU varlen attention via candle-flash-attn (`cuda` feature)
//! - [`ReferenceBackend`] - Portable implementation from candle tensor ops

mod backend;

pub use backend::{
    attention_probs, AttentionBackend, AttentionConfig, AttentionMask, ReferenceBackend,
};

#[cfg(feature = "cuda")]
mod flash;

#[cfg(feature = "cuda")]
pub use flash::FlashAttnBackend;
