//! Token, segment and position embeddings.

use super::{AddLayerNorm, BertConfig, FastLayerNorm, PositionEmbeddingType, WeightScope};
use crate::error::{FlashBertError, Result};
use candle_core::Tensor;
use std::sync::Arc;

/// Embedding stage: `layernorm(word[ids] + position[pos] + token_type[types])`.
#[derive(Debug, Clone)]
pub struct BertEmbeddings {
    /// `[vocab_size, hidden]`
    word_embeddings: Tensor,
    /// `[type_vocab_size, hidden]`
    token_type_embeddings: Tensor,
    /// `[max_position_embeddings, hidden]`
    position_embeddings: Tensor,
    layer_norm: FastLayerNorm,
}

impl BertEmbeddings {
    /// Load from the `embeddings` scope.
    pub fn load(vb: &WeightScope<'_>, config: &BertConfig, kernel: Arc<dyn AddLayerNorm>) -> Result<Self> {
        match config.position_embedding_kind()? {
            PositionEmbeddingType::Absolute => {}
        }

        let word_embeddings = vb.get("word_embeddings.weight")?;
        let token_type_embeddings = vb.get("token_type_embeddings.weight")?;
        let position_embeddings = vb.get("position_embeddings.weight")?;
        for (name, table) in [
            ("word_embeddings", &word_embeddings),
            ("token_type_embeddings", &token_type_embeddings),
            ("position_embeddings", &position_embeddings),
        ] {
            if table.rank() != 2 || table.dims()[1] != config.hidden_size {
                return Err(FlashBertError::ShapeMismatch(format!(
                    "{} has shape {:?}, expected [_, {}]",
                    name,
                    table.dims(),
                    config.hidden_size
                )));
            }
        }

        let layer_norm = FastLayerNorm::new(
            vb.get("LayerNorm.weight")?,
            vb.get("LayerNorm.bias")?,
            config.layer_norm_eps,
            kernel,
        )?;

        Ok(Self {
            word_embeddings,
            token_type_embeddings,
            position_embeddings,
            layer_norm,
        })
    }

    /// Embed flat `[tokens]` id tensors into `[tokens, hidden]`.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        token_type_ids: &Tensor,
        position_ids: &Tensor,
    ) -> Result<Tensor> {
        let words = lookup(&self.word_embeddings, input_ids, "word")?;
        let positions = lookup(&self.position_embeddings, position_ids, "position")?;
        let types = lookup(&self.token_type_embeddings, token_type_ids, "token type")?;

        let embeddings = (words + positions)?;
        let (hidden, _) = self.layer_norm.forward(&embeddings, Some(&types))?;
        Ok(hidden)
    }
}

fn lookup(table: &Tensor, ids: &Tensor, name: &'static str) -> Result<Tensor> {
    let size = table.dims()[0];
    let max = ids.max(0)?.to_scalar::<u32>()?;
    if max as usize >= size {
        return Err(FlashBertError::EmbeddingIndex {
            table: name,
            index: max,
            size,
        });
    }
    Ok(table.index_select(ids, 0)?)
}
