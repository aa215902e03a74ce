//! High-level embedding model.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device};
use flashbert_core::{
    batch::{Batch, BatchKind, BucketingConfig, EmbedRequest},
    model::{BertConfig, Embedding, FlashBertModel, WeightLoader},
    Backend,
};
use std::path::PathBuf;
use tracing::{info, instrument};

/// Configuration for loading a model.
#[derive(Debug, Clone)]
pub struct FlashBertConfig {
    /// Directory holding `config.json` and `*.safetensors`.
    pub model_path: PathBuf,
    /// Activation precision: `float32`, `float16` or `bfloat16`.
    pub dtype: String,
    /// Device to run on.
    pub device: Device,
    /// Capability class; detected from the device when unset.
    pub backend: Option<Backend>,
    /// Shape bucketing for padded batches. Generic-backend models read it
    /// from the environment when unset.
    pub bucketing: Option<BucketingConfig>,
}

impl Default for FlashBertConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            dtype: "float32".to_string(),
            device: Device::Cpu,
            backend: None,
            bucketing: None,
        }
    }
}

/// Parse a precision name.
pub fn parse_dtype(name: &str) -> Result<DType> {
    Ok(match name {
        "float32" | "f32" => DType::F32,
        "float16" | "f16" => DType::F16,
        "bfloat16" | "bf16" => DType::BF16,
        other => bail!("unsupported dtype: {other} (expected float32, float16 or bfloat16)"),
    })
}

/// Builder for [`FlashBert`].
#[derive(Debug, Default)]
pub struct FlashBertBuilder {
    config: FlashBertConfig,
}

impl FlashBertBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set model directory.
    pub fn model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.model_path = path.into();
        self
    }

    /// Set precision by name.
    pub fn dtype(mut self, dtype: impl Into<String>) -> Self {
        self.config.dtype = dtype.into();
        self
    }

    /// Set device.
    pub fn device(mut self, device: Device) -> Self {
        self.config.device = device;
        self
    }

    /// Force a capability class.
    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = Some(backend);
        self
    }

    /// Set padded-batch bucketing.
    pub fn bucketing(mut self, bucketing: BucketingConfig) -> Self {
        self.config.bucketing = Some(bucketing);
        self
    }

    /// Load the model.
    pub fn build(self) -> Result<FlashBert> {
        FlashBert::load(self.config)
    }
}

/// Loaded embedding model.
#[derive(Debug)]
pub struct FlashBert {
    model: FlashBertModel,
    bucketing: Option<BucketingConfig>,
}

impl FlashBert {
    /// Create a new builder.
    pub fn builder() -> FlashBertBuilder {
        FlashBertBuilder::new()
    }

    /// Load `config.json` and safetensors weights from `config.model_path`.
    pub fn load(config: FlashBertConfig) -> Result<Self> {
        let dtype = parse_dtype(&config.dtype)?;
        let config_path = config.model_path.join("config.json");
        let bert_config = BertConfig::from_file(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        info!(
            model_type = %bert_config.model_type,
            hidden_size = bert_config.hidden_size,
            layers = bert_config.num_hidden_layers,
            max_input_length = bert_config.max_input_length(),
            "model config"
        );

        let weights = WeightLoader::from_dir(&config.model_path, &config.device)
            .with_context(|| format!("failed to load weights from {}", config.model_path.display()))?;

        let backend = config
            .backend
            .unwrap_or_else(|| Backend::detect(&config.device));
        let model = FlashBertModel::new(&weights, &config.device, dtype, &bert_config, backend)
            .context("failed to build model")?;

        let bucketing = match (backend.batch_kind(), config.bucketing) {
            (BatchKind::Padded, None) => Some(BucketingConfig::from_env()?),
            (BatchKind::Padded, Some(b)) => {
                b.validate()?;
                Some(b)
            }
            (BatchKind::Flash, _) => None,
        };

        info!(backend = %backend, ?dtype, ?bucketing, "model ready");
        Ok(Self { model, bucketing })
    }

    /// Longest sequence a request may carry.
    pub fn max_input_length(&self) -> usize {
        self.model.max_input_length()
    }

    /// Embedding vector length.
    pub fn hidden_size(&self) -> usize {
        self.model.hidden_size()
    }

    /// Batch layout the model accepts.
    pub fn batch_kind(&self) -> BatchKind {
        self.model.batch_kind()
    }

    /// Capability class in use.
    pub fn backend(&self) -> Backend {
        self.model.backend()
    }

    /// Underlying model.
    pub fn model(&self) -> &FlashBertModel {
        &self.model
    }

    /// Build the batch layout this model accepts.
    pub fn batch_from_request(&self, req: &EmbedRequest) -> Result<Batch> {
        Ok(Batch::from_request(
            req,
            self.model.backend(),
            self.model.device(),
            self.model.max_input_length(),
            self.bucketing.as_ref(),
        )?)
    }

    /// Embed every sequence of `batch`, in input order.
    #[instrument(name = "embed", skip_all, fields(batch_size = batch.len(), kind = %batch.kind()))]
    pub fn embed(&self, batch: &Batch) -> Result<Vec<Embedding>> {
        Ok(self.model.embed(batch)?)
    }

    /// Batch and embed a request.
    pub fn embed_request(&self, req: &EmbedRequest) -> Result<Vec<Embedding>> {
        let batch = self.batch_from_request(req)?;
        self.embed(&batch)
    }
}
