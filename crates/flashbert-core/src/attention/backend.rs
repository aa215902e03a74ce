//! Attention backend trait and reference implementation.
//!
//! This module provides:
//! - [`AttentionBackend`] - Trait for attention computation backends
//! - [`ReferenceBackend`] - Portable implementation built from tensor ops
//! - [`AttentionConfig`] - Configuration for attention computation
//! - [`AttentionMask`] - How sequences in a batch are kept apart

use crate::batch::SequenceOffsets;
use crate::error::{FlashBertError, Result};
use candle_core::{DType, Tensor};
use std::fmt::Debug;

/// Configuration for attention computation.
#[derive(Debug, Clone)]
pub struct AttentionConfig {
    /// Number of heads.
    pub num_heads: usize,
    /// Head dimension.
    pub head_dim: usize,
    /// Softmax scale (1/sqrt(head_dim) by default).
    pub scale: f32,
}

impl AttentionConfig {
    /// Create a new attention config.
    pub fn new(num_heads: usize, head_dim: usize) -> Self {
        Self {
            num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f32).sqrt(),
        }
    }

    /// Hidden size covered by all heads.
    pub fn hidden_size(&self) -> usize {
        self.num_heads * self.head_dim
    }
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self::new(12, 64) // bert-base
    }
}

/// Sequence separation for one attention call.
#[derive(Debug, Clone, Copy)]
pub enum AttentionMask<'a> {
    /// Packed tokens; every sequence attends only within its offset range.
    Varlen {
        /// Sequence boundaries.
        offsets: &'a SequenceOffsets,
        /// Longest sequence.
        max_seqlen: usize,
    },
    /// Rectangular grid with an additive `[rows, 1, len, len]` bias.
    Bias(&'a Tensor),
}

/// Bidirectional scaled dot-product attention over `[tokens, heads, head_dim]`
/// projections.
pub trait AttentionBackend: Send + Sync + Debug {
    /// Attend `query` over `key`/`value`; returns `[tokens, heads, head_dim]`.
    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: &AttentionMask<'_>,
        config: &AttentionConfig,
    ) -> Result<Tensor>;

    /// Kernel name for logs.
    fn name(&self) -> &'static str;
}

/// Softmax-normalized attention weights `softmax(q k^T * scale + bias)`.
///
/// `query`/`key` are `[..., len, head_dim]`; `bias` must broadcast to the
/// score shape. Half-precision inputs are scored in f32 and cast back.
pub fn attention_probs(
    query: &Tensor,
    key: &Tensor,
    bias: Option<&Tensor>,
    scale: f64,
) -> Result<Tensor> {
    let dtype = query.dtype();
    let upcast = matches!(dtype, DType::F16 | DType::BF16);
    let (q, k) = if upcast {
        (query.to_dtype(DType::F32)?, key.to_dtype(DType::F32)?)
    } else {
        (query.clone(), key.clone())
    };

    let rank = k.rank();
    let scores = (q.matmul(&k.transpose(rank - 2, rank - 1)?.contiguous()?)? * scale)?;
    let scores = match bias {
        Some(bias) => scores.broadcast_add(&bias.to_dtype(scores.dtype())?)?,
        None => scores,
    };
    let probs = candle_nn::ops::softmax_last_dim(&scores.contiguous()?)?;
    Ok(probs.to_dtype(dtype)?)
}

/// Portable backend built from candle tensor ops.
///
/// Packed batches are attended one sequence at a time; padded batches as one
/// batched matmul with the additive bias.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceBackend;

impl ReferenceBackend {
    /// Create a new reference backend.
    pub fn new() -> Self {
        Self
    }

    fn attend(q: &Tensor, k: &Tensor, v: &Tensor, bias: Option<&Tensor>, scale: f64) -> Result<Tensor> {
        let probs = attention_probs(q, k, bias, scale)?;
        Ok(probs.matmul(v)?)
    }

    fn varlen(
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        offsets: &SequenceOffsets,
        config: &AttentionConfig,
    ) -> Result<Tensor> {
        let tokens = query.dims()[0];
        if offsets.total_tokens() != tokens {
            return Err(FlashBertError::ShapeMismatch(format!(
                "offsets cover {} tokens, projections hold {}",
                offsets.total_tokens(),
                tokens
            )));
        }

        let mut outputs = Vec::with_capacity(offsets.num_sequences());
        for (start, len) in offsets.ranges() {
            // [len, H, d] -> [H, len, d]
            let seq = |t: &Tensor| -> Result<Tensor> {
                Ok(t.narrow(0, start, len)?.transpose(0, 1)?.contiguous()?)
            };
            let out = Self::attend(&seq(query)?, &seq(key)?, &seq(value)?, None, config.scale as f64)?;
            outputs.push(out.transpose(0, 1)?);
        }
        Ok(Tensor::cat(&outputs, 0)?.contiguous()?)
    }

    fn padded(
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        bias: &Tensor,
        config: &AttentionConfig,
    ) -> Result<Tensor> {
        let (rows, len) = match bias.dims() {
            &[rows, 1, l1, l2] if l1 == l2 => (rows, l1),
            dims => {
                return Err(FlashBertError::ShapeMismatch(format!(
                    "attention bias must be [rows, 1, len, len], got {:?}",
                    dims
                )))
            }
        };
        let tokens = query.dims()[0];
        if tokens != rows * len {
            return Err(FlashBertError::ShapeMismatch(format!(
                "bias covers a {}x{} grid, projections hold {} tokens",
                rows, len, tokens
            )));
        }

        // [rows*len, H, d] -> [rows, H, len, d]
        let grid = |t: &Tensor| -> Result<Tensor> {
            Ok(t.reshape((rows, len, config.num_heads, config.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let out = Self::attend(&grid(query)?, &grid(key)?, &grid(value)?, Some(bias), config.scale as f64)?;
        Ok(out
            .transpose(1, 2)?
            .reshape((tokens, config.num_heads, config.head_dim))?)
    }
}

impl AttentionBackend for ReferenceBackend {
    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: &AttentionMask<'_>,
        config: &AttentionConfig,
    ) -> Result<Tensor> {
        match mask {
            AttentionMask::Varlen { offsets, .. } => Self::varlen(query, key, value, offsets, config),
            AttentionMask::Bias(bias) => Self::padded(query, key, value, bias, config),
        }
    }

    fn name(&self) -> &'static str {
        "reference"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, D};

    fn row_sums(t: &Tensor) -> Vec<f32> {
        t.sum(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
    }

    fn create_dummy_tensor(dims: &[usize]) -> Tensor {
        Tensor::randn(0.0f32, 1.0, dims, &Device::Cpu).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn attention_config_scale() {
        let config = AttentionConfig::new(8, 64);
        let expected_scale = 1.0 / (64.0f32).sqrt();
        assert!((config.scale - expected_scale).abs() < 1e-6);
        assert_eq!(config.hidden_size(), 512);
        assert_eq!(AttentionConfig::default().hidden_size(), 768);
    }

    #[test]
    fn probs_are_normalized() {
        let q = create_dummy_tensor(&[2, 5, 8]);
        let k = create_dummy_tensor(&[2, 5, 8]);
        let probs = attention_probs(&q, &k, None, 0.5).unwrap();
        assert_eq!(probs.dims(), &[2, 5, 5]);
        for s in row_sums(&probs) {
            assert!((s - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn masked_keys_get_no_weight() {
        let q = create_dummy_tensor(&[1, 3, 4]);
        let k = create_dummy_tensor(&[1, 3, 4]);
        let bias = Tensor::new(&[[[0f32, 0., f32::MIN]]], &Device::Cpu).unwrap();
        let probs = attention_probs(&q, &k, Some(&bias), 0.5).unwrap();
        let probs = probs.to_vec3::<f32>().unwrap();
        for row in &probs[0] {
            assert!(row[2] < 1e-12);
            assert!((row[0] + row[1] - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn single_token_attends_to_itself() {
        let config = AttentionConfig::new(2, 4);
        let device = Device::Cpu;
        let offsets = SequenceOffsets::new(vec![0, 1], &device).unwrap();
        let q = create_dummy_tensor(&[1, 2, 4]);
        let k = create_dummy_tensor(&[1, 2, 4]);
        let v = create_dummy_tensor(&[1, 2, 4]);
        let mask = AttentionMask::Varlen {
            offsets: &offsets,
            max_seqlen: 1,
        };
        let out = ReferenceBackend::new().forward(&q, &k, &v, &mask, &config).unwrap();
        assert!(max_abs_diff(&out, &v) < 1e-6);
    }

    #[test]
    fn varlen_sequences_are_independent() {
        let config = AttentionConfig::new(2, 4);
        let device = Device::Cpu;
        let q = create_dummy_tensor(&[5, 2, 4]);
        let k = create_dummy_tensor(&[5, 2, 4]);
        let v = create_dummy_tensor(&[5, 2, 4]);
        let backend = ReferenceBackend::new();

        let both = SequenceOffsets::new(vec![0, 3, 5], &device).unwrap();
        let joint = backend
            .forward(
                &q,
                &k,
                &v,
                &AttentionMask::Varlen {
                    offsets: &both,
                    max_seqlen: 3,
                },
                &config,
            )
            .unwrap();

        let first = SequenceOffsets::new(vec![0, 3], &device).unwrap();
        let alone = backend
            .forward(
                &q.narrow(0, 0, 3).unwrap(),
                &k.narrow(0, 0, 3).unwrap(),
                &v.narrow(0, 0, 3).unwrap(),
                &AttentionMask::Varlen {
                    offsets: &first,
                    max_seqlen: 3,
                },
                &config,
            )
            .unwrap();
        assert!(max_abs_diff(&joint.narrow(0, 0, 3).unwrap(), &alone) < 1e-6);
    }

    #[test]
    fn padded_matches_varlen() {
        let config = AttentionConfig::new(2, 4);
        let device = Device::Cpu;
        // packed: lengths 3 and 2
        let q = create_dummy_tensor(&[5, 2, 4]);
        let k = create_dummy_tensor(&[5, 2, 4]);
        let v = create_dummy_tensor(&[5, 2, 4]);
        let offsets = SequenceOffsets::new(vec![0, 3, 5], &device).unwrap();
        let backend = ReferenceBackend::new();
        let packed = backend
            .forward(
                &q,
                &k,
                &v,
                &AttentionMask::Varlen {
                    offsets: &offsets,
                    max_seqlen: 3,
                },
                &config,
            )
            .unwrap();

        // padded 2x3 grid, last cell of row 1 is padding
        let pad = Tensor::zeros((1, 2, 4), DType::F32, &device).unwrap();
        let to_grid = |t: &Tensor| Tensor::cat(&[t.clone(), pad.clone()], 0).unwrap();
        let bias = Tensor::from_slice(
            &[0f32, 0., 0., 0., 0., f32::MIN],
            (2, 1, 1, 3),
            &device,
        )
        .unwrap()
        .broadcast_as((2, 1, 3, 3))
        .unwrap()
        .contiguous()
        .unwrap();
        let padded = backend
            .forward(&to_grid(&q), &to_grid(&k), &to_grid(&v), &AttentionMask::Bias(&bias), &config)
            .unwrap();
        assert_eq!(padded.dims(), &[6, 2, 4]);
        assert!(max_abs_diff(&padded.narrow(0, 0, 5).unwrap(), &packed) < 1e-5);
    }

    #[test]
    fn mismatched_offsets_rejected() {
        let config = AttentionConfig::new(2, 4);
        let offsets = SequenceOffsets::new(vec![0, 3], &Device::Cpu).unwrap();
        let q = create_dummy_tensor(&[4, 2, 4]);
        let err = ReferenceBackend::new()
            .forward(
                &q,
                &q,
                &q,
                &AttentionMask::Varlen {
                    offsets: &offsets,
                    max_seqlen: 3,
                },
                &config,
            )
            .unwrap_err();
        assert!(matches!(err, FlashBertError::ShapeMismatch(_)));
    }
}
