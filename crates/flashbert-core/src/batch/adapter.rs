//! Uniform forward-pass arguments for either batch layout.

use super::{Batch, FlashBatch, PaddedBatch, SequenceOffsets};
use crate::attention::AttentionMask;
use crate::error::{FlashBertError, Result};
use candle_core::{DType, Device, Shape, Tensor};

/// Padding bookkeeping for a rectangular batch.
#[derive(Debug, Clone)]
pub struct Padding {
    /// Rows in the grid, including filler.
    pub rows: usize,
    /// Padded sequence length.
    pub len: usize,
    /// Additive attention bias, `[rows, 1, len, len]`: 0 where the key is a
    /// real token, the dtype minimum where it is padding.
    pub bias: Tensor,
    /// Flat grid indices of real tokens, row-major.
    pub real_positions: Tensor,
}

/// Everything the encoder stack needs besides the hidden states.
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    /// Flat token ids, `[tokens]`.
    pub input_ids: Tensor,
    /// Flat token type ids, `[tokens]`.
    pub token_type_ids: Tensor,
    /// Flat position ids, `[tokens]`.
    pub position_ids: Tensor,
    /// Boundaries of real sequences. For padded batches these index the
    /// compacted real-token buffer, not the grid.
    pub offsets: SequenceOffsets,
    /// Longest sequence the attention kernel must handle.
    pub max_seqlen: usize,
    /// Set for padded batches.
    pub padding: Option<Padding>,
}

impl PreparedBatch {
    /// Number of output vectors.
    pub fn num_sequences(&self) -> usize {
        self.offsets.num_sequences()
    }

    /// Attention mask for this layout.
    pub fn attention_mask(&self) -> AttentionMask<'_> {
        match &self.padding {
            Some(p) => AttentionMask::Bias(&p.bias),
            None => AttentionMask::Varlen {
                offsets: &self.offsets,
                max_seqlen: self.max_seqlen,
            },
        }
    }

    /// CLS pooling: the first real token of every sequence.
    pub fn pool(&self, hidden: &Tensor) -> Result<Tensor> {
        let starts = self.offsets.starts()?;
        match &self.padding {
            Some(p) => {
                let tokens = hidden.dims().first().copied().unwrap_or(0);
                if tokens != p.rows * p.len {
                    return Err(FlashBertError::ShapeMismatch(format!(
                        "hidden states have {} tokens, padded grid is {}x{}",
                        tokens, p.rows, p.len
                    )));
                }
                let real = hidden.index_select(&p.real_positions, 0)?;
                Ok(real.index_select(&starts, 0)?)
            }
            None => Ok(hidden.index_select(&starts, 0)?),
        }
    }
}

/// Derive the forward-pass arguments for `batch`; `dtype` is the model's
/// activation dtype, used for the attention bias.
pub fn prepare(batch: &Batch, dtype: DType) -> Result<PreparedBatch> {
    match batch {
        Batch::Flash(b) => Ok(prepare_flash(b)),
        Batch::Padded(b) => prepare_padded(b, dtype),
    }
}

fn prepare_flash(batch: &FlashBatch) -> PreparedBatch {
    PreparedBatch {
        input_ids: batch.input_ids.clone(),
        token_type_ids: batch.token_type_ids.clone(),
        position_ids: batch.position_ids.clone(),
        offsets: batch.cu_seqlens.clone(),
        max_seqlen: batch.max_s,
        padding: None,
    }
}

fn prepare_padded(batch: &PaddedBatch, dtype: DType) -> Result<PreparedBatch> {
    let (rows, len) = (batch.rows(), batch.padded_len());
    let device = batch.input_ids.device();
    let mask = &batch.attention_mask;

    // Row lengths are the last column of the running sum over each mask row.
    let lengths = mask
        .to_dtype(DType::F32)?
        .cumsum(1)?
        .narrow(1, len - 1, 1)?
        .squeeze(1)?
        .to_dtype(DType::U32)?
        .to_vec1::<u32>()?;
    let lengths = &lengths[..batch.len()];
    let offsets = SequenceOffsets::from_lengths(lengths, device)?;

    let mut real = Vec::with_capacity(offsets.total_tokens());
    for (row, &n) in lengths.iter().enumerate() {
        let base = (row * len) as u32;
        real.extend(base..base + n);
    }
    let real_positions = Tensor::from_slice(&real, real.len(), device)?;

    let shape = Shape::from((rows, 1, len, len));
    let keys = mask.reshape((rows, 1, 1, len))?.broadcast_as(shape.clone())?;
    let zeros = Tensor::zeros(shape.clone(), dtype, device)?;
    let bias = keys.where_cond(&zeros, &dtype_min(dtype, shape, device)?)?;

    Ok(PreparedBatch {
        input_ids: batch.input_ids.flatten_all()?,
        token_type_ids: batch.token_type_ids.flatten_all()?,
        position_ids: batch.position_ids.flatten_all()?,
        offsets,
        max_seqlen: len,
        padding: Some(Padding {
            rows,
            len,
            bias,
            real_positions,
        }),
    })
}

/// Tensor filled with the most negative finite value of `dtype`.
fn dtype_min(dtype: DType, shape: Shape, device: &Device) -> Result<Tensor> {
    let t = match dtype {
        DType::F16 => Tensor::full(half::f16::MIN, shape, device)?,
        DType::BF16 => Tensor::full(half::bf16::MIN, shape, device)?,
        DType::F64 => Tensor::full(f64::MIN, shape, device)?,
        _ => Tensor::full(f32::MIN, shape, device)?.to_dtype(dtype)?,
    };
    Ok(t)
}
