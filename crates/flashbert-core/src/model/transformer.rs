//! Encoder stack and model driver.

use super::{BertConfig, BertEmbeddings, BertLayer, Checkpoint, WeightScope};
use crate::attention::AttentionMask;
use crate::backend::Backend;
use crate::batch::{prepare, Batch, BatchKind, PreparedBatch};
use crate::error::{FlashBertError, Result};
use candle_core::{DType, Device, Tensor};
use tracing::{debug, info};

/// One pooled vector per input sequence, `hidden_size` long.
pub type Embedding = Vec<f32>;

/// Ordered stack of encoder layers.
#[derive(Debug, Clone)]
pub struct BertEncoder {
    layers: Vec<BertLayer>,
}

impl BertEncoder {
    /// Create from loaded layers.
    pub fn new(layers: Vec<BertLayer>) -> Self {
        Self { layers }
    }

    /// Run every layer in order over `[tokens, hidden]`.
    pub fn forward(&self, hidden: &Tensor, mask: &AttentionMask<'_>) -> Result<Tensor> {
        let mut hidden = hidden.clone();
        for layer in &self.layers {
            hidden = layer.forward(&hidden, mask)?;
        }
        Ok(hidden)
    }

    /// Number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

/// BERT encoder producing CLS-pooled sequence embeddings.
///
/// Weights are immutable after construction; `embed` takes `&self` and may be
/// called concurrently.
#[derive(Debug, Clone)]
pub struct FlashBertModel {
    embeddings: BertEmbeddings,
    encoder: BertEncoder,
    config: BertConfig,
    backend: Backend,
    device: Device,
    dtype: DType,
}

impl FlashBertModel {
    /// Build a model from `checkpoint` for the given backend.
    ///
    /// Tensor names may carry a leading `bert.` prefix.
    pub fn new(
        checkpoint: &dyn Checkpoint,
        device: &Device,
        dtype: DType,
        config: &BertConfig,
        backend: Backend,
    ) -> Result<Self> {
        config.validate()?;

        let root = WeightScope::new(checkpoint, dtype, device);
        let vb = if checkpoint.contains("bert.embeddings.word_embeddings.weight") {
            debug!("checkpoint uses a `bert.` tensor prefix");
            root.pp("bert")
        } else {
            root
        };

        let kernel = backend.add_layer_norm();
        let attention = backend.attention(device, dtype);

        let embeddings = BertEmbeddings::load(&vb.pp("embeddings"), config, kernel.clone())?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| {
                BertLayer::load(
                    &vb.pp(format!("encoder.layer.{i}")),
                    config,
                    kernel.clone(),
                    attention.clone(),
                    i,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            layers = config.num_hidden_layers,
            hidden_size = config.hidden_size,
            heads = config.num_attention_heads,
            act = %config.hidden_act,
            backend = %backend,
            layer_norm = kernel.name(),
            attention = attention.name(),
            ?dtype,
            "loaded BERT encoder"
        );

        Ok(Self {
            embeddings,
            encoder: BertEncoder::new(layers),
            config: config.clone(),
            backend,
            device: device.clone(),
            dtype,
        })
    }

    /// Embed every sequence of `batch`.
    ///
    /// The batch layout must be the one [`Self::batch_kind`] reports.
    pub fn embed(&self, batch: &Batch) -> Result<Vec<Embedding>> {
        let pooled = self.forward(batch)?;
        Ok(pooled.to_dtype(DType::F32)?.to_vec2::<f32>()?)
    }

    /// Pooled `[num_sequences, hidden]` tensor in the model dtype.
    pub fn forward(&self, batch: &Batch) -> Result<Tensor> {
        let expected = self.batch_kind();
        if batch.kind() != expected {
            return Err(FlashBertError::UnsupportedBatch {
                backend: self.backend.name(),
                expected: expected.name(),
                got: batch.kind().name(),
            });
        }

        let prepared = prepare(batch, self.dtype)?;
        let hidden = self.encode(&prepared)?;
        prepared.pool(&hidden)
    }

    /// Final hidden states for every token of a prepared batch.
    fn encode(&self, prepared: &PreparedBatch) -> Result<Tensor> {
        let hidden = self.embeddings.forward(
            &prepared.input_ids,
            &prepared.token_type_ids,
            &prepared.position_ids,
        )?;
        self.encoder.forward(&hidden, &prepared.attention_mask())
    }

    /// Model configuration.
    pub fn config(&self) -> &BertConfig {
        &self.config
    }

    /// Capability class fixed at construction.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Batch layout this model accepts.
    pub fn batch_kind(&self) -> BatchKind {
        self.backend.batch_kind()
    }

    /// Get device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Activation dtype.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Output vector length.
    pub fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    /// Longest sequence a request may carry.
    pub fn max_input_length(&self) -> usize {
        self.config.max_input_length()
    }

    /// Number of encoder layers.
    pub fn num_layers(&self) -> usize {
        self.encoder.num_layers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BucketingConfig, EmbedRequest, FlashBatch, PaddedBatch};
    use crate::model::synthetic_checkpoint;
    use std::collections::HashMap;

    fn tiny_config() -> BertConfig {
        BertConfig {
            vocab_size: 32,
            hidden_size: 8,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            intermediate_size: 16,
            max_position_embeddings: 16,
            ..Default::default()
        }
    }

    fn request() -> EmbedRequest {
        EmbedRequest::from_sequences(vec![
            (vec![1, 5, 9], vec![0, 0, 1]),
            (vec![2, 7], vec![0, 0]),
        ])
    }

    fn flash(req: &EmbedRequest) -> Batch {
        Batch::Flash(FlashBatch::from_request(req, &Device::Cpu).unwrap())
    }

    fn padded(req: &EmbedRequest, bucketing: Option<&BucketingConfig>) -> Batch {
        Batch::Padded(PaddedBatch::from_request(req, &Device::Cpu, 16, bucketing).unwrap())
    }

    fn model(checkpoint: &HashMap<String, Tensor>, backend: Backend) -> FlashBertModel {
        FlashBertModel::new(checkpoint, &Device::Cpu, DType::F32, &tiny_config(), backend).unwrap()
    }

    fn assert_close(a: &[Vec<f32>], b: &[Vec<f32>], tol: f32) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.len(), y.len());
            for (p, q) in x.iter().zip(y.iter()) {
                assert!((p - q).abs() < tol, "{} vs {}", p, q);
            }
        }
    }

    /// One layer, one head, hidden 2. Projection weights are zero so every
    /// stage reduces to a bias add followed by a 2-wide layer norm, which maps
    /// `[a, b]` to `[sign(a - b), sign(b - a)]` before scale and shift.
    fn closed_form_checkpoint() -> (BertConfig, HashMap<String, Tensor>) {
        let config = BertConfig {
            vocab_size: 4,
            hidden_size: 2,
            num_hidden_layers: 1,
            num_attention_heads: 1,
            intermediate_size: 3,
            max_position_embeddings: 3,
            ..Default::default()
        };
        let d = Device::Cpu;
        let t = |v: &[f32], shape: &[usize]| Tensor::from_slice(v, shape, &d).unwrap();
        let zeros = |shape: &[usize]| Tensor::zeros(shape, DType::F32, &d).unwrap();
        let ones = || Tensor::ones(2, DType::F32, &d).unwrap();

        let mut w = HashMap::new();
        let mut put = |k: &str, v: Tensor| {
            w.insert(k.to_string(), v);
        };
        put("embeddings.word_embeddings.weight", t(&[0., 0., 2., 0., 0., 2., 1., 1.], &[4, 2]));
        put("embeddings.position_embeddings.weight", t(&[0., 0., 0., 0.5, 0.5, 0.], &[3, 2]));
        put("embeddings.token_type_embeddings.weight", zeros(&[2, 2]));
        put("embeddings.LayerNorm.weight", ones());
        put("embeddings.LayerNorm.bias", zeros(&[2]));

        let p = "encoder.layer.0";
        for proj in ["query", "key", "value"] {
            put(&format!("{p}.attention.self.{proj}.weight"), zeros(&[2, 2]));
        }
        put(&format!("{p}.attention.self.query.bias"), t(&[0.3, -0.2], &[2]));
        put(&format!("{p}.attention.self.key.bias"), t(&[1.0, 0.4], &[2]));
        put(&format!("{p}.attention.self.value.bias"), t(&[5.0, -5.0], &[2]));
        put(&format!("{p}.attention.output.dense.weight"), zeros(&[2, 2]));
        put(&format!("{p}.attention.output.dense.bias"), t(&[0.5, 0.], &[2]));
        put(&format!("{p}.attention.output.LayerNorm.weight"), ones());
        put(&format!("{p}.attention.output.LayerNorm.bias"), zeros(&[2]));
        put(&format!("{p}.intermediate.dense.weight"), zeros(&[3, 2]));
        put(&format!("{p}.intermediate.dense.bias"), t(&[1., 2., 3.], &[3]));
        put(&format!("{p}.output.dense.weight"), zeros(&[2, 3]));
        put(&format!("{p}.output.dense.bias"), t(&[0., 1.5], &[2]));
        put(&format!("{p}.output.LayerNorm.weight"), t(&[2., 1.], &[2]));
        put(&format!("{p}.output.LayerNorm.bias"), t(&[0.5, 0.], &[2]));
        (config, w)
    }

    #[test]
    fn closed_form_two_sequence_batch() {
        let (config, checkpoint) = closed_form_checkpoint();
        // sequence 0: ids [1, 3, 0], sequence 1: ids [2, 1]
        let req = EmbedRequest::from_sequences(vec![
            (vec![1, 3, 0], vec![0; 3]),
            (vec![2, 1], vec![0; 2]),
        ]);
        assert_eq!(req.cu_seq_lengths, vec![0, 3, 5]);

        for backend in [Backend::VectorizedExtension, Backend::FusedKernel] {
            let model =
                FlashBertModel::new(&checkpoint, &Device::Cpu, DType::F32, &config, backend).unwrap();
            let out = model.embed(&flash(&req)).unwrap();

            // seq 0 first token: embed LN([2, 0]) = [1, -1]
            //   attention: LN([0.5, 0] + [1, -1]) = [1, -1]
            //   ffn: LN([0, 1.5] + [1, -1]) = [1, -1] -> * [2, 1] + [0.5, 0] = [2.5, -1]
            // seq 1 first token: embed LN([0, 2]) = [-1, 1]
            //   attention: LN([0.5, 0] + [-1, 1]) = [-1, 1]
            //   ffn: LN([0, 1.5] + [-1, 1]) = [-1, 1] -> [-1.5, 1]
            assert_close(&out, &[vec![2.5, -1.0], vec![-1.5, 1.0]], 1e-5);
        }
    }

    #[test]
    fn pooled_vectors_are_first_token_states() {
        let checkpoint = synthetic_checkpoint(&tiny_config(), 7).unwrap();
        let model = model(&checkpoint, Backend::VectorizedExtension);
        let batch = flash(&request());
        let prepared = prepare(&batch, DType::F32).unwrap();
        let hidden = model.encode(&prepared).unwrap().to_vec2::<f32>().unwrap();
        let out = model.embed(&batch).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], hidden[0]);
        assert_eq!(out[1], hidden[3]);
    }

    #[test]
    fn packed_and_padded_paths_agree() {
        let checkpoint = synthetic_checkpoint(&tiny_config(), 11).unwrap();
        let req = request();
        let packed = model(&checkpoint, Backend::VectorizedExtension)
            .embed(&flash(&req))
            .unwrap();
        let generic = model(&checkpoint, Backend::Generic);
        let grid = generic.embed(&padded(&req, None)).unwrap();
        assert_close(&packed, &grid, 1e-4);

        let bucketing = BucketingConfig {
            pad_sequence_to_multiple_of: 4,
            seq_len_exponent_base: 2,
        };
        let req3 = EmbedRequest::from_sequences(vec![
            (vec![1, 5, 9], vec![0, 0, 1]),
            (vec![2, 7], vec![0, 0]),
            (vec![3], vec![0]),
        ]);
        let bucketed = generic.embed(&padded(&req3, Some(&bucketing))).unwrap();
        assert_eq!(bucketed.len(), 3);
        assert_close(&bucketed[..2], &grid, 1e-4);
    }

    #[test]
    fn sequences_do_not_influence_each_other() {
        let checkpoint = synthetic_checkpoint(&tiny_config(), 5).unwrap();
        let model = model(&checkpoint, Backend::VectorizedExtension);
        let joint = model.embed(&flash(&request())).unwrap();
        let alone = model
            .embed(&flash(&EmbedRequest::from_sequences(vec![(vec![2, 7], vec![0, 0])])))
            .unwrap();
        assert_close(&joint[1..], &alone, 1e-5);
    }

    #[test]
    fn embed_is_deterministic() {
        let checkpoint = synthetic_checkpoint(&tiny_config(), 2).unwrap();
        let model = model(&checkpoint, Backend::FusedKernel);
        let batch = flash(&request());
        assert_eq!(model.embed(&batch).unwrap(), model.embed(&batch).unwrap());
    }

    #[test]
    fn wrong_batch_layout_rejected() {
        let checkpoint = synthetic_checkpoint(&tiny_config(), 2).unwrap();
        let err = model(&checkpoint, Backend::Generic)
            .embed(&flash(&request()))
            .unwrap_err();
        assert!(matches!(
            err,
            FlashBertError::UnsupportedBatch {
                backend: "generic",
                expected: "padded",
                got: "flash"
            }
        ));
        let err = model(&checkpoint, Backend::VectorizedExtension)
            .embed(&padded(&request(), None))
            .unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::UnsupportedBatch);
    }

    #[test]
    fn bert_prefixed_checkpoint_loads() {
        let checkpoint = synthetic_checkpoint(&tiny_config(), 4).unwrap();
        let prefixed: HashMap<String, Tensor> = checkpoint
            .iter()
            .map(|(k, v)| (format!("bert.{k}"), v.clone()))
            .collect();
        let plain = model(&checkpoint, Backend::VectorizedExtension);
        let with_prefix = model(&prefixed, Backend::VectorizedExtension);
        assert_eq!(with_prefix.num_layers(), 2);
        let batch = flash(&request());
        assert_eq!(plain.embed(&batch).unwrap(), with_prefix.embed(&batch).unwrap());
    }

    #[test]
    fn construction_failures() {
        let mut checkpoint = synthetic_checkpoint(&tiny_config(), 4).unwrap();
        let relative = BertConfig {
            position_embedding_type: "relative_key".into(),
            ..tiny_config()
        };
        let err = FlashBertModel::new(
            &checkpoint,
            &Device::Cpu,
            DType::F32,
            &relative,
            Backend::VectorizedExtension,
        )
        .unwrap_err();
        assert!(matches!(err, FlashBertError::UnsupportedPositionEmbedding(_)));
        assert_eq!(err.category(), crate::error::ErrorCategory::Construction);

        checkpoint.remove("encoder.layer.1.output.LayerNorm.bias");
        let err = FlashBertModel::new(
            &checkpoint,
            &Device::Cpu,
            DType::F32,
            &tiny_config(),
            Backend::VectorizedExtension,
        )
        .unwrap_err();
        assert!(matches!(err, FlashBertError::MissingTensor { .. }));
    }

    #[test]
    fn out_of_vocabulary_id_fails_call() {
        let checkpoint = synthetic_checkpoint(&tiny_config(), 4).unwrap();
        let model = model(&checkpoint, Backend::VectorizedExtension);
        let req = EmbedRequest::from_sequences(vec![(vec![1, 99], vec![0, 0])]);
        let err = model.embed(&flash(&req)).unwrap_err();
        assert!(matches!(err, FlashBertError::EmbeddingIndex { table: "word", .. }));
        assert_eq!(err.category(), crate::error::ErrorCategory::Numeric);
    }

    #[test]
    fn half_precision_tracks_f32() {
        let checkpoint = synthetic_checkpoint(&tiny_config(), 8).unwrap();
        let full = model(&checkpoint, Backend::Generic)
            .embed(&padded(&request(), None))
            .unwrap();
        let half = FlashBertModel::new(
            &checkpoint,
            &Device::Cpu,
            DType::F16,
            &tiny_config(),
            Backend::Generic,
        )
        .unwrap()
        .embed(&padded(&request(), None))
        .unwrap();
        assert_close(&full, &half, 5e-2);
    }
}
