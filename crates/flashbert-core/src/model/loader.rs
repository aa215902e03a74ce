//! Checkpoint access and SafeTensors weight loading.
//!
//! A checkpoint is a flat table of named tensors queried by exact dotted key
//! (`encoder.layer.0.attention.self.query.weight`). [`WeightScope`] adds a
//! name prefix plus the target dtype/device and performs the one-time layout
//! work (transposes, QKV fusion) at construction.
//!
//! # Example
//!
//! ```ignore
//! use flashbert_core::model::{WeightLoader, WeightScope};
//!
//! let loader = WeightLoader::from_file("/path/to/model.safetensors".as_ref(), &Device::Cpu)?;
//! let vb = WeightScope::new(&loader, DType::F32, &Device::Cpu);
//! let qkv = vb.pp("encoder.layer.0.attention.self")
//!     .get_fused_transposed(&["query.weight", "key.weight", "value.weight"])?;
//! ```

use super::BertConfig;
use crate::error::{FlashBertError, Result};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Read-only named tensor store.
pub trait Checkpoint: Send + Sync {
    /// Fetch a tensor by exact name.
    fn get_tensor(&self, name: &str) -> Result<Tensor>;

    /// Check if a tensor exists.
    fn contains(&self, name: &str) -> bool;
}

impl Checkpoint for HashMap<String, Tensor> {
    fn get_tensor(&self, name: &str) -> Result<Tensor> {
        self.get(name)
            .cloned()
            .ok_or_else(|| FlashBertError::MissingTensor {
                name: name.to_string(),
            })
    }

    fn contains(&self, name: &str) -> bool {
        self.contains_key(name)
    }
}

/// Weight loader for SafeTensors format.
pub struct WeightLoader {
    /// Loaded tensors indexed by name.
    tensors: HashMap<String, Tensor>,
    /// Device for loaded tensors.
    device: Device,
}

impl WeightLoader {
    /// Load all .safetensors files in a model directory.
    pub fn from_dir(dir: &Path, device: &Device) -> Result<Self> {
        let mut tensors = HashMap::new();

        let mut safetensor_files: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |e| e == "safetensors") {
                safetensor_files.push(path);
            }
        }

        // Sort for deterministic loading order
        safetensor_files.sort();

        if safetensor_files.is_empty() {
            return Err(FlashBertError::ModelError(format!(
                "No .safetensors files found in {}",
                dir.display()
            )));
        }

        for path in &safetensor_files {
            tensors.extend(Self::load_safetensors_file(path, device)?);
        }

        Ok(Self {
            tensors,
            device: device.clone(),
        })
    }

    /// Create a weight loader from a single file.
    pub fn from_file(path: &Path, device: &Device) -> Result<Self> {
        let tensors = Self::load_safetensors_file(path, device)?;
        Ok(Self {
            tensors,
            device: device.clone(),
        })
    }

    fn load_safetensors_file(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
        let data = fs::read(path)?;
        let safetensors = SafeTensors::deserialize(&data).map_err(|e| {
            FlashBertError::ModelError(format!("Failed to deserialize {}: {}", path.display(), e))
        })?;

        let mut tensors = HashMap::new();
        for (name, view) in safetensors.tensors() {
            let tensor = Self::view_to_tensor(&name, &view, device)?;
            tensors.insert(name, tensor);
        }

        tracing::debug!(
            path = %path.display(),
            tensors = tensors.len(),
            "loaded safetensors file"
        );

        Ok(tensors)
    }

    /// Convert a SafeTensors view to a Candle tensor.
    ///
    /// Raw bytes are copied out with `pod_collect_to_vec`, which tolerates the
    /// unaligned offsets safetensors headers produce.
    fn view_to_tensor(
        name: &str,
        view: &safetensors::tensor::TensorView,
        device: &Device,
    ) -> Result<Tensor> {
        let shape: Vec<usize> = view.shape().to_vec();
        let data = view.data();

        let tensor = match view.dtype() {
            safetensors::Dtype::F32 => {
                let values: Vec<f32> = bytemuck::pod_collect_to_vec(data);
                Tensor::from_vec(values, shape, device)?
            }
            safetensors::Dtype::F16 => {
                let values: Vec<half::f16> = bytemuck::pod_collect_to_vec(data);
                Tensor::from_vec(values, shape, device)?
            }
            safetensors::Dtype::BF16 => {
                let values: Vec<half::bf16> = bytemuck::pod_collect_to_vec(data);
                Tensor::from_vec(values, shape, device)?
            }
            safetensors::Dtype::F64 => {
                let values: Vec<f64> = bytemuck::pod_collect_to_vec(data);
                Tensor::from_vec(values, shape, device)?
            }
            safetensors::Dtype::I64 => {
                let values: Vec<i64> = bytemuck::pod_collect_to_vec(data);
                Tensor::from_vec(values, shape, device)?
            }
            safetensors::Dtype::I32 => {
                // Candle has no I32, upcast
                let values: Vec<i32> = bytemuck::pod_collect_to_vec(data);
                let values: Vec<i64> = values.into_iter().map(i64::from).collect();
                Tensor::from_vec(values, shape, device)?
            }
            safetensors::Dtype::U32 => {
                let values: Vec<u32> = bytemuck::pod_collect_to_vec(data);
                Tensor::from_vec(values, shape, device)?
            }
            safetensors::Dtype::U8 => Tensor::from_vec(data.to_vec(), shape, device)?,
            other => {
                return Err(FlashBertError::ModelError(format!(
                    "Unsupported dtype {:?} for tensor {}",
                    other, name
                )));
            }
        };

        Ok(tensor)
    }

    /// Get all tensor names.
    pub fn tensor_names(&self) -> Vec<&str> {
        self.tensors.keys().map(|s| s.as_str()).collect()
    }

    /// Get the number of loaded tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Check if no tensors are loaded.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Get the device tensors are loaded to.
    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl Checkpoint for WeightLoader {
    fn get_tensor(&self, name: &str) -> Result<Tensor> {
        self.tensors.get_tensor(name)
    }

    fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }
}

/// Prefix-scoped, dtype/device-binding view over a [`Checkpoint`].
///
/// Layout contract for projections: checkpoints store linear weights as
/// `[out_features, in_features]`. Every weight returned by the `*_transposed`
/// getters is `[in_features, out_features]` and contiguous, so a projection
/// is `x.matmul(&w)?.broadcast_add(&b)?` on a 2D `[tokens, in_features]`
/// input.
#[derive(Clone)]
pub struct WeightScope<'a> {
    checkpoint: &'a dyn Checkpoint,
    prefix: String,
    dtype: DType,
    device: Device,
}

impl<'a> WeightScope<'a> {
    /// Create a root scope.
    pub fn new(checkpoint: &'a dyn Checkpoint, dtype: DType, device: &Device) -> Self {
        Self {
            checkpoint,
            prefix: String::new(),
            dtype,
            device: device.clone(),
        }
    }

    /// Push a name segment.
    pub fn pp(&self, segment: impl AsRef<str>) -> Self {
        Self {
            checkpoint: self.checkpoint,
            prefix: self.path(segment.as_ref()),
            dtype: self.dtype,
            device: self.device.clone(),
        }
    }

    fn path(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }

    /// Target dtype.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Target device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Check whether `name` exists under this scope.
    pub fn contains(&self, name: &str) -> bool {
        self.checkpoint.contains(&self.path(name))
    }

    fn raw(&self, name: &str) -> Result<Tensor> {
        self.checkpoint.get_tensor(&self.path(name))
    }

    fn place(&self, tensor: Tensor) -> Result<Tensor> {
        Ok(tensor.to_dtype(self.dtype)?.to_device(&self.device)?)
    }

    /// Tensor as stored.
    pub fn get(&self, name: &str) -> Result<Tensor> {
        self.place(self.raw(name)?)
    }

    /// Linear weight in `[in, out]` orientation.
    pub fn get_transposed(&self, name: &str) -> Result<Tensor> {
        let weight = self.raw(name)?;
        if weight.rank() != 2 {
            return Err(FlashBertError::ShapeMismatch(format!(
                "{} must be 2D, got {:?}",
                self.path(name),
                weight.dims()
            )));
        }
        self.place(weight.t()?.contiguous()?)
    }

    /// Concatenate same-shaped tensors along the output-feature axis (dim 0).
    pub fn get_fused(&self, names: &[&str]) -> Result<Tensor> {
        self.place(self.concat(names)?)
    }

    /// Concatenate same-shaped linear weights along the output-feature axis,
    /// then transpose: `[n * out, in]` becomes `[in, n * out]`.
    pub fn get_fused_transposed(&self, names: &[&str]) -> Result<Tensor> {
        let fused = self.concat(names)?;
        self.place(fused.t()?.contiguous()?)
    }

    fn concat(&self, names: &[&str]) -> Result<Tensor> {
        let parts = names
            .iter()
            .map(|name| self.raw(name))
            .collect::<Result<Vec<_>>>()?;
        if let Some(first) = parts.first() {
            for (name, part) in names.iter().zip(parts.iter()).skip(1) {
                if part.dims() != first.dims() {
                    return Err(FlashBertError::ShapeMismatch(format!(
                        "{} has shape {:?}, expected {:?}",
                        self.path(name),
                        part.dims(),
                        first.dims()
                    )));
                }
            }
        }
        Ok(Tensor::cat(&parts, 0)?)
    }
}

/// Deterministic random checkpoint with BERT tensor names for `config`.
///
/// All tensors are f32 on CPU. Layer norm weights are drawn around one so
/// that normalization does not collapse the signal.
pub fn synthetic_checkpoint(config: &BertConfig, seed: u64) -> Result<HashMap<String, Tensor>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tensors = HashMap::new();
    let hidden = config.hidden_size;
    let inter = config.intermediate_size;

    let mut add = |name: String, shape: &[usize], center: f32, spread: f32| -> Result<()> {
        let len: usize = shape.iter().product();
        let values: Vec<f32> = (0..len)
            .map(|_| center + rng.gen_range(-spread..spread))
            .collect();
        tensors.insert(name, Tensor::from_vec(values, shape, &Device::Cpu)?);
        Ok(())
    };

    add("embeddings.word_embeddings.weight".into(), &[config.vocab_size, hidden], 0.0, 0.5)?;
    add("embeddings.token_type_embeddings.weight".into(), &[config.type_vocab_size, hidden], 0.0, 0.5)?;
    add("embeddings.position_embeddings.weight".into(), &[config.max_position_embeddings, hidden], 0.0, 0.5)?;
    add("embeddings.LayerNorm.weight".into(), &[hidden], 1.0, 0.1)?;
    add("embeddings.LayerNorm.bias".into(), &[hidden], 0.0, 0.1)?;

    for i in 0..config.num_hidden_layers {
        let p = format!("encoder.layer.{i}");
        for proj in ["query", "key", "value"] {
            add(format!("{p}.attention.self.{proj}.weight"), &[hidden, hidden], 0.0, 0.2)?;
            add(format!("{p}.attention.self.{proj}.bias"), &[hidden], 0.0, 0.1)?;
        }
        add(format!("{p}.attention.output.dense.weight"), &[hidden, hidden], 0.0, 0.2)?;
        add(format!("{p}.attention.output.dense.bias"), &[hidden], 0.0, 0.1)?;
        add(format!("{p}.attention.output.LayerNorm.weight"), &[hidden], 1.0, 0.1)?;
        add(format!("{p}.attention.output.LayerNorm.bias"), &[hidden], 0.0, 0.1)?;
        add(format!("{p}.intermediate.dense.weight"), &[inter, hidden], 0.0, 0.2)?;
        add(format!("{p}.intermediate.dense.bias"), &[inter], 0.0, 0.1)?;
        add(format!("{p}.output.dense.weight"), &[hidden, inter], 0.0, 0.2)?;
        add(format!("{p}.output.dense.bias"), &[hidden], 0.0, 0.1)?;
        add(format!("{p}.output.LayerNorm.weight"), &[hidden], 1.0, 0.1)?;
        add(format!("{p}.output.LayerNorm.bias"), &[hidden], 0.0, 0.1)?;
    }

    Ok(tensors)
}
