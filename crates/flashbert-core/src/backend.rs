//! Hardware capability selection.
//!
//! A [`Backend`] decides which add+layernorm kernel the model uses, which
//! batch layout it accepts and which attention kernel it runs.

use crate::attention::{AttentionBackend, ReferenceBackend};
use crate::batch::BatchKind;
use crate::error::{FlashBertError, Result};
use crate::model::{
    AddLayerNorm, FusedAddLayerNorm, GenericAddLayerNorm, VectorizedAddLayerNorm,
};
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Device capability class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// GPU with a fused add+layernorm kernel and varlen attention.
    FusedKernel,
    /// CPU with a vectorized layer-norm extension.
    VectorizedExtension,
    /// Accelerator without either; padded batches only.
    Generic,
}

impl Backend {
    /// Pick the capability class for `device`.
    ///
    /// [`Backend::Generic`] is never detected; it has to be requested.
    pub fn detect(device: &Device) -> Self {
        match device {
            Device::Cuda(_) | Device::Metal(_) => Backend::FusedKernel,
            Device::Cpu => Backend::VectorizedExtension,
        }
    }

    /// Config name.
    pub fn name(&self) -> &'static str {
        match self {
            Backend::FusedKernel => "fused_kernel",
            Backend::VectorizedExtension => "vectorized_extension",
            Backend::Generic => "generic",
        }
    }

    /// Batch layout the model accepts on this backend.
    pub fn batch_kind(&self) -> BatchKind {
        match self {
            Backend::Generic => BatchKind::Padded,
            Backend::FusedKernel | Backend::VectorizedExtension => BatchKind::Flash,
        }
    }

    /// Add+layernorm kernel for this backend.
    pub fn add_layer_norm(&self) -> Arc<dyn AddLayerNorm> {
        match self {
            Backend::FusedKernel => Arc::new(FusedAddLayerNorm),
            Backend::VectorizedExtension => Arc::new(VectorizedAddLayerNorm),
            Backend::Generic => Arc::new(GenericAddLayerNorm),
        }
    }

    /// Attention kernel for this backend on `device` at `dtype`.
    pub fn attention(&self, device: &Device, dtype: DType) -> Arc<dyn AttentionBackend> {
        #[cfg(feature = "cuda")]
        {
            use crate::attention::FlashAttnBackend;
            if *self == Backend::FusedKernel && device.is_cuda() {
                if FlashAttnBackend::supports(dtype) {
                    return Arc::new(FlashAttnBackend::new());
                }
                tracing::warn!(?dtype, "flash attention needs f16 or bf16, using reference attention");
            }
        }
        let _ = (device, dtype);
        Arc::new(ReferenceBackend::new())
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = FlashBertError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fused_kernel" | "fused" | "cuda" => Ok(Backend::FusedKernel),
            "vectorized_extension" | "vectorized" | "cpu" => Ok(Backend::VectorizedExtension),
            "generic" | "padded" => Ok(Backend::Generic),
            other => Err(FlashBertError::InvalidConfig(format!(
                "unknown backend: {}",
                other
            ))),
        }
    }
}
