//! Encoder layer implementation.
//!
//! A single post-norm BERT encoder layer combining:
//! - Fused QKV projection
//! - Bidirectional multi-head attention (pluggable kernel)
//! - Output projection with residual add + layer norm
//! - Feed-forward stage

use super::{AddLayerNorm, BertConfig, BertFeedForward, FastLayerNorm, WeightScope};
use crate::attention::{AttentionBackend, AttentionConfig, AttentionMask};
use crate::error::{FlashBertError, Result};
use candle_core::Tensor;
use std::sync::Arc;

/// Self-attention stage of an encoder layer.
#[derive(Debug, Clone)]
pub struct BertAttention {
    /// Fused projection: `[hidden, 3 * hidden]`, columns ordered Q, K, V.
    qkv_weight: Tensor,
    /// Fused bias: `[3 * hidden]`.
    qkv_bias: Tensor,
    /// Output projection: `[hidden, hidden]`.
    dense_weight: Tensor,
    /// Output bias: `[hidden]`.
    dense_bias: Tensor,
    layer_norm: FastLayerNorm,
    config: AttentionConfig,
    backend: Arc<dyn AttentionBackend>,
}

impl BertAttention {
    /// Load from an `encoder.layer.{i}.attention` scope.
    pub fn load(
        vb: &WeightScope<'_>,
        config: &BertConfig,
        kernel: Arc<dyn AddLayerNorm>,
        backend: Arc<dyn AttentionBackend>,
    ) -> Result<Self> {
        let hidden = config.hidden_size;
        let attn = vb.pp("self");
        let qkv_weight =
            attn.get_fused_transposed(&["query.weight", "key.weight", "value.weight"])?;
        let qkv_bias = attn.get_fused(&["query.bias", "key.bias", "value.bias"])?;
        if qkv_weight.dims() != [hidden, 3 * hidden] || qkv_bias.dims() != [3 * hidden] {
            return Err(FlashBertError::ShapeMismatch(format!(
                "fused qkv weight {:?} / bias {:?} do not match hidden size {}",
                qkv_weight.dims(),
                qkv_bias.dims(),
                hidden
            )));
        }

        let output = vb.pp("output");
        Ok(Self {
            qkv_weight,
            qkv_bias,
            dense_weight: output.pp("dense").get_transposed("weight")?,
            dense_bias: output.pp("dense").get("bias")?,
            layer_norm: FastLayerNorm::new(
                output.get("LayerNorm.weight")?,
                output.get("LayerNorm.bias")?,
                config.layer_norm_eps,
                kernel,
            )?,
            config: AttentionConfig::new(config.num_attention_heads, config.head_size()),
            backend,
        })
    }

    /// Forward pass over `[tokens, hidden]`.
    pub fn forward(&self, hidden: &Tensor, mask: &AttentionMask<'_>) -> Result<Tensor> {
        let tokens = hidden.dims()[0];
        let (heads, head_dim) = (self.config.num_heads, self.config.head_dim);

        // [tokens, 3 * hidden] -> [tokens, 3 * heads, head_dim]
        let qkv = hidden
            .matmul(&self.qkv_weight)?
            .broadcast_add(&self.qkv_bias)?
            .reshape((tokens, 3 * heads, head_dim))?;
        let q = qkv.narrow(1, 0, heads)?;
        let k = qkv.narrow(1, heads, heads)?;
        let v = qkv.narrow(1, 2 * heads, heads)?;

        let attn = self.backend.forward(&q, &k, &v, mask, &self.config)?;
        let attn = attn.reshape((tokens, heads * head_dim))?;

        let out = attn
            .matmul(&self.dense_weight)?
            .broadcast_add(&self.dense_bias)?;
        let (out, _) = self.layer_norm.forward(&out, Some(hidden))?;
        Ok(out)
    }

    /// Attention geometry.
    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }
}

/// A single encoder layer: attention then feed-forward.
#[derive(Debug, Clone)]
pub struct BertLayer {
    attention: BertAttention,
    feed_forward: BertFeedForward,
    /// Layer index (for debugging).
    layer_idx: usize,
}

impl BertLayer {
    /// Load layer `layer_idx` from an `encoder.layer.{layer_idx}` scope.
    pub fn load(
        vb: &WeightScope<'_>,
        config: &BertConfig,
        kernel: Arc<dyn AddLayerNorm>,
        backend: Arc<dyn AttentionBackend>,
        layer_idx: usize,
    ) -> Result<Self> {
        Ok(Self {
            attention: BertAttention::load(&vb.pp("attention"), config, kernel.clone(), backend)?,
            feed_forward: BertFeedForward::load(vb, config, kernel)?,
            layer_idx,
        })
    }

    /// Forward pass over `[tokens, hidden]`.
    pub fn forward(&self, hidden: &Tensor, mask: &AttentionMask<'_>) -> Result<Tensor> {
        let hidden = self.attention.forward(hidden, mask)?;
        self.feed_forward.forward(&hidden)
    }

    /// Get layer index.
    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::ReferenceBackend;
    use crate::batch::SequenceOffsets;
    use crate::model::{synthetic_checkpoint, VectorizedAddLayerNorm};
    use candle_core::{DType, Device};

    fn config() -> BertConfig {
        BertConfig {
            vocab_size: 16,
            hidden_size: 8,
            num_hidden_layers: 1,
            num_attention_heads: 2,
            intermediate_size: 12,
            max_position_embeddings: 8,
            ..Default::default()
        }
    }

    fn load_layer(checkpoint: &std::collections::HashMap<String, Tensor>) -> Result<BertLayer> {
        let vb = WeightScope::new(checkpoint, DType::F32, &Device::Cpu);
        BertLayer::load(
            &vb.pp("encoder.layer.0"),
            &config(),
            Arc::new(VectorizedAddLayerNorm),
            Arc::new(ReferenceBackend::new()),
            0,
        )
    }

    #[test]
    fn layer_preserves_shape() {
        let checkpoint = synthetic_checkpoint(&config(), 3).unwrap();
        let layer = load_layer(&checkpoint).unwrap();
        assert_eq!(layer.layer_idx(), 0);
        assert_eq!(layer.attention.config().head_dim, 4);

        let hidden = Tensor::randn(0f32, 1.0, (5, 8), &Device::Cpu).unwrap();
        let offsets = SequenceOffsets::new(vec![0, 2, 5], &Device::Cpu).unwrap();
        let mask = AttentionMask::Varlen {
            offsets: &offsets,
            max_seqlen: 3,
        };
        let out = layer.forward(&hidden, &mask).unwrap();
        assert_eq!(out.dims(), &[5, 8]);
    }

    #[test]
    fn fused_projection_matches_separate_projections() {
        let checkpoint = synthetic_checkpoint(&config(), 9).unwrap();
        let layer = load_layer(&checkpoint).unwrap();
        let x = Tensor::randn(0f32, 1.0, (3, 8), &Device::Cpu).unwrap();

        let fused = x
            .matmul(&layer.attention.qkv_weight)
            .unwrap()
            .broadcast_add(&layer.attention.qkv_bias)
            .unwrap();
        for (i, name) in ["query", "key", "value"].iter().enumerate() {
            let w = &checkpoint[&format!("encoder.layer.0.attention.self.{name}.weight")];
            let b = &checkpoint[&format!("encoder.layer.0.attention.self.{name}.bias")];
            let separate = x
                .matmul(&w.t().unwrap())
                .unwrap()
                .broadcast_add(b)
                .unwrap();
            let slice = fused.narrow(1, i * 8, 8).unwrap();
            let diff = (slice - separate)
                .unwrap()
                .abs()
                .unwrap()
                .flatten_all()
                .unwrap()
                .max(0)
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert!(diff < 1e-5, "{name}: {diff}");
        }
    }

    #[test]
    fn missing_projection_fails_construction() {
        let mut checkpoint = synthetic_checkpoint(&config(), 1).unwrap();
        checkpoint.remove("encoder.layer.0.attention.self.value.bias");
        let err = load_layer(&checkpoint).unwrap_err();
        assert!(matches!(err, FlashBertError::MissingTensor { ref name } if name.ends_with("value.bias")));
    }
}
