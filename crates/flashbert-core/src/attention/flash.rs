//! GPU attention backend.
//!
//! [`FlashAttnBackend`] runs Flash Attention 2 varlen kernels from
//! candle-flash-attn over packed batches. The kernels only accept f16/bf16
//! CUDA tensors.

use crate::error::Result;
use candle_core::{DType, Tensor};

use super::{AttentionBackend, AttentionConfig, AttentionMask, ReferenceBackend};

/// GPU-accelerated varlen attention using candle-flash-attn.
///
/// Padded batches carry an additive bias the kernel cannot consume; those
/// are delegated to [`ReferenceBackend`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FlashAttnBackend {
    fallback: ReferenceBackend,
}

impl FlashAttnBackend {
    /// Create a new Flash Attention backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the kernel can run on tensors of `dtype`.
    pub fn supports(dtype: DType) -> bool {
        matches!(dtype, DType::F16 | DType::BF16)
    }
}

impl AttentionBackend for FlashAttnBackend {
    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: &AttentionMask<'_>,
        config: &AttentionConfig,
    ) -> Result<Tensor> {
        match mask {
            AttentionMask::Varlen { offsets, max_seqlen } if Self::supports(query.dtype()) => {
                // Kernel expects contiguous [total_tokens, num_heads, head_dim]
                let q = query.contiguous()?;
                let k = key.contiguous()?;
                let v = value.contiguous()?;
                let seqlens = offsets.tensor();
                let output = candle_flash_attn::flash_attn_varlen(
                    &q,
                    &k,
                    &v,
                    seqlens,
                    seqlens,
                    *max_seqlen,
                    *max_seqlen,
                    config.scale,
                    false,
                )?;
                Ok(output)
            }
            _ => self.fallback.forward(query, key, value, mask, config),
        }
    }

    fn name(&self) -> &'static str {
        "flash_attn_varlen"
    }
}
