//! Fused residual-add + Layer Normalization.
//!
//! Every encoder sub-block ends with `layernorm(residual + x)`. The unit
//! returns both the normalized tensor and the pre-normalization sum, which is
//! the residual for whatever comes next.
//!
//! # Formula
//!
//! `y = (s - mean(s)) / sqrt(var(s) + eps) * weight + bias`, with
//! `s = residual + x` (or `s = x` without a residual), statistics taken over
//! the last dimension.
//!
//! Three kernels implement [`AddLayerNorm`]; one is picked per backend at
//! construction (see [`crate::backend::Backend`]) and shared by every layer.

use crate::error::{FlashBertError, Result};
use candle_core::{DType, Module, Tensor, D};
use std::fmt;
use std::sync::Arc;

/// Residual-add + layer norm kernel.
pub trait AddLayerNorm: Send + Sync + fmt::Debug {
    /// Returns `(normalized, residual + hidden)`.
    fn forward(
        &self,
        hidden: &Tensor,
        residual: Option<&Tensor>,
        weight: &Tensor,
        bias: &Tensor,
        eps: f64,
    ) -> Result<(Tensor, Tensor)>;

    /// Kernel name for logs.
    fn name(&self) -> &'static str;
}

fn residual_sum(hidden: &Tensor, residual: Option<&Tensor>) -> Result<Tensor> {
    match residual {
        Some(residual) => {
            if residual.dims() != hidden.dims() {
                return Err(FlashBertError::ShapeMismatch(format!(
                    "residual {:?} does not match hidden states {:?}",
                    residual.dims(),
                    hidden.dims()
                )));
            }
            Ok((residual + hidden)?)
        }
        None => Ok(hidden.clone()),
    }
}

/// Single fused layer-norm kernel over the summed input.
#[derive(Debug, Default, Clone, Copy)]
pub struct FusedAddLayerNorm;

impl AddLayerNorm for FusedAddLayerNorm {
    fn forward(
        &self,
        hidden: &Tensor,
        residual: Option<&Tensor>,
        weight: &Tensor,
        bias: &Tensor,
        eps: f64,
    ) -> Result<(Tensor, Tensor)> {
        let sum = residual_sum(hidden, residual)?.contiguous()?;
        let normed = candle_nn::ops::layer_norm(&sum, weight, bias, eps as f32)?;
        Ok((normed, sum))
    }

    fn name(&self) -> &'static str {
        "fused_kernel"
    }
}

/// Row-batched `candle_nn::LayerNorm` module over the summed input.
///
/// Leading dimensions are flattened into `[rows, hidden]` and half precision
/// rows are widened to f32 for the statistics, then cast back. Strided input
/// is copied into rows by the reshape.
#[derive(Debug, Default, Clone, Copy)]
pub struct VectorizedAddLayerNorm;

impl AddLayerNorm for VectorizedAddLayerNorm {
    fn forward(
        &self,
        hidden: &Tensor,
        residual: Option<&Tensor>,
        weight: &Tensor,
        bias: &Tensor,
        eps: f64,
    ) -> Result<(Tensor, Tensor)> {
        let sum = residual_sum(hidden, residual)?;
        let dtype = sum.dtype();
        let dims = sum.dims().to_vec();
        let width = dims.last().copied().unwrap_or(1).max(1);
        let rows = sum.reshape((sum.elem_count() / width, width))?;

        let wide = matches!(dtype, DType::F16 | DType::BF16);
        let (rows, weight, bias) = if wide {
            (
                rows.to_dtype(DType::F32)?,
                weight.to_dtype(DType::F32)?,
                bias.to_dtype(DType::F32)?,
            )
        } else {
            (rows, weight.clone(), bias.clone())
        };

        let norm = candle_nn::LayerNorm::new(weight, bias, eps);
        let normed = norm.forward(&rows)?.to_dtype(dtype)?.reshape(dims)?;
        Ok((normed, sum))
    }

    fn name(&self) -> &'static str {
        "vectorized_extension"
    }
}

/// Elementwise add, then mean/variance normalization op by op.
///
/// Half precision inputs are normalized in f32 and cast back.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericAddLayerNorm;

impl AddLayerNorm for GenericAddLayerNorm {
    fn forward(
        &self,
        hidden: &Tensor,
        residual: Option<&Tensor>,
        weight: &Tensor,
        bias: &Tensor,
        eps: f64,
    ) -> Result<(Tensor, Tensor)> {
        let sum = residual_sum(hidden, residual)?;
        let dtype = sum.dtype();
        let internal = match dtype {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };

        let x = sum.to_dtype(internal)?;
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let denom = (var + eps)?.sqrt()?;
        let normed = centered.broadcast_div(&denom)?.to_dtype(dtype)?;
        let normed = normed.broadcast_mul(weight)?.broadcast_add(bias)?;

        Ok((normed, sum))
    }

    fn name(&self) -> &'static str {
        "generic"
    }
}

/// Layer norm parameters bound to a shared kernel.
#[derive(Debug, Clone)]
pub struct FastLayerNorm {
    /// Scale, `[hidden]`.
    weight: Tensor,
    /// Shift, `[hidden]`.
    bias: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
    kernel: Arc<dyn AddLayerNorm>,
}

impl FastLayerNorm {
    /// Create a new layer norm with given parameters.
    pub fn new(weight: Tensor, bias: Tensor, eps: f64, kernel: Arc<dyn AddLayerNorm>) -> Result<Self> {
        if weight.rank() != 1 || weight.dims() != bias.dims() {
            return Err(FlashBertError::ShapeMismatch(format!(
                "layer norm weight {:?} and bias {:?} must be matching vectors",
                weight.dims(),
                bias.dims()
            )));
        }
        Ok(Self {
            weight,
            bias,
            eps,
            kernel,
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `hidden` - Input tensor [..., hidden_size]
    /// * `residual` - Optional tensor of the same shape added before normalizing
    pub fn forward(&self, hidden: &Tensor, residual: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        self.kernel
            .forward(hidden, residual, &self.weight, &self.bias, self.eps)
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Get epsilon value.
    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Name of the kernel in use.
    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }
}
