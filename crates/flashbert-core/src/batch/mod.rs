//! Batch representations consumed by the model.
//!
//! Two mutually exclusive layouts:
//! - [`FlashBatch`] - every sequence concatenated into one flat buffer,
//!   boundaries given by [`SequenceOffsets`]
//! - [`PaddedBatch`] - a rectangular `[rows, len]` grid plus a 0/1 attention
//!   mask
//!
//! [`Batch`] is the tagged union of the two. [`prepare`] turns either into the
//! uniform arguments the encoder stack threads through its layers.

mod adapter;
mod offsets;
mod request;

pub use adapter::{prepare, Padding, PreparedBatch};
pub use offsets::SequenceOffsets;
pub use request::{round_up_seq, BucketingConfig, EmbedRequest};

use crate::error::{FlashBertError, Result};
use candle_core::{Device, Tensor};
use std::fmt;

/// Which batch layout a backend consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    /// Packed sequences with cumulative offsets.
    Flash,
    /// Rectangular grid with attention mask.
    Padded,
}

impl BatchKind {
    /// Short name.
    pub fn name(&self) -> &'static str {
        match self {
            BatchKind::Flash => "flash",
            BatchKind::Padded => "padded",
        }
    }
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Packed (ragged) batch.
#[derive(Debug, Clone)]
pub struct FlashBatch {
    /// Token ids, `[total_tokens]` u32.
    pub input_ids: Tensor,
    /// Token type ids, `[total_tokens]` u32.
    pub token_type_ids: Tensor,
    /// Position ids, `[total_tokens]` u32.
    pub position_ids: Tensor,
    /// Sequence boundaries.
    pub cu_seqlens: SequenceOffsets,
    /// Longest sequence in the batch.
    pub max_s: usize,
}

impl FlashBatch {
    /// Upload a packed batch.
    pub fn new(
        input_ids: &[u32],
        token_type_ids: &[u32],
        position_ids: &[u32],
        cu_seqlens: Vec<u32>,
        max_s: usize,
        device: &Device,
    ) -> Result<Self> {
        let total = input_ids.len();
        if token_type_ids.len() != total || position_ids.len() != total {
            return Err(FlashBertError::InvalidBatch(format!(
                "id arrays differ in length: input {}, token type {}, position {}",
                total,
                token_type_ids.len(),
                position_ids.len()
            )));
        }
        let cu_seqlens = SequenceOffsets::new(cu_seqlens, device)?;
        if cu_seqlens.total_tokens() != total {
            return Err(FlashBertError::InvalidBatch(format!(
                "offsets cover {} tokens but batch holds {}",
                cu_seqlens.total_tokens(),
                total
            )));
        }
        if cu_seqlens.max_len() > max_s {
            return Err(FlashBertError::InvalidBatch(format!(
                "max_s {} is shorter than the longest sequence {}",
                max_s,
                cu_seqlens.max_len()
            )));
        }

        Ok(Self {
            input_ids: Tensor::from_slice(input_ids, total, device)?,
            token_type_ids: Tensor::from_slice(token_type_ids, total, device)?,
            position_ids: Tensor::from_slice(position_ids, total, device)?,
            cu_seqlens,
            max_s,
        })
    }

    /// Number of sequences.
    pub fn len(&self) -> usize {
        self.cu_seqlens.num_sequences()
    }

    /// Always false; offsets describe at least one sequence.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Rectangular batch with attention mask.
///
/// Sequences must be left-aligned: each mask row is a run of ones followed by
/// zeros. Pooling gathers real positions in row-major order and indexes them
/// by cumulative row lengths, which is only correct for that layout.
#[derive(Debug, Clone)]
pub struct PaddedBatch {
    /// Token ids, `[rows, len]` u32.
    pub input_ids: Tensor,
    /// Token type ids, `[rows, len]` u32.
    pub token_type_ids: Tensor,
    /// Position ids, `[rows, len]` u32.
    pub position_ids: Tensor,
    /// 1 for real tokens, 0 for padding, `[rows, len]` u8.
    pub attention_mask: Tensor,
    /// Number of real sequences; rows past this are bucketing filler.
    size: usize,
}

impl PaddedBatch {
    /// Upload a padded batch from row-major host buffers.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rows: usize,
        len: usize,
        input_ids: &[u32],
        token_type_ids: &[u32],
        position_ids: &[u32],
        attention_mask: &[u8],
        size: usize,
        device: &Device,
    ) -> Result<Self> {
        let cells = rows * len;
        for (name, got) in [
            ("input_ids", input_ids.len()),
            ("token_type_ids", token_type_ids.len()),
            ("position_ids", position_ids.len()),
            ("attention_mask", attention_mask.len()),
        ] {
            if got != cells {
                return Err(FlashBertError::InvalidBatch(format!(
                    "{} has {} entries, expected {}x{}",
                    name, got, rows, len
                )));
            }
        }
        if size == 0 || size > rows {
            return Err(FlashBertError::InvalidBatch(format!(
                "batch size {} must be within 1..={}",
                size, rows
            )));
        }
        if len == 0 {
            return Err(FlashBertError::InvalidBatch(
                "padded length is 0, every sequence is empty".to_string(),
            ));
        }

        for (row, mask) in attention_mask.chunks(len).enumerate() {
            let real = mask.iter().take_while(|&&m| m == 1).count();
            if mask[real..].iter().any(|&m| m != 0) {
                return Err(FlashBertError::InvalidBatch(format!(
                    "attention mask row {} is not left-aligned",
                    row
                )));
            }
            if row < size && real == 0 {
                return Err(FlashBertError::InvalidBatch(format!(
                    "sequence {} is empty",
                    row
                )));
            }
        }

        Ok(Self {
            input_ids: Tensor::from_slice(input_ids, (rows, len), device)?,
            token_type_ids: Tensor::from_slice(token_type_ids, (rows, len), device)?,
            position_ids: Tensor::from_slice(position_ids, (rows, len), device)?,
            attention_mask: Tensor::from_slice(attention_mask, (rows, len), device)?,
            size,
        })
    }

    /// Number of real sequences.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Always false; construction rejects empty batches.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Allocated rows, including bucketing filler.
    pub fn rows(&self) -> usize {
        self.input_ids.dims()[0]
    }

    /// Padded sequence length.
    pub fn padded_len(&self) -> usize {
        self.input_ids.dims()[1]
    }
}

/// A batch in one of the two supported layouts.
#[derive(Debug, Clone)]
pub enum Batch {
    /// Packed sequences.
    Flash(FlashBatch),
    /// Padded grid.
    Padded(PaddedBatch),
}

impl Batch {
    /// Layout tag.
    pub fn kind(&self) -> BatchKind {
        match self {
            Batch::Flash(_) => BatchKind::Flash,
            Batch::Padded(_) => BatchKind::Padded,
        }
    }

    /// Number of sequences (one embedding each).
    pub fn len(&self) -> usize {
        match self {
            Batch::Flash(b) => b.len(),
            Batch::Padded(b) => b.len(),
        }
    }

    /// Check if batch is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<FlashBatch> for Batch {
    fn from(batch: FlashBatch) -> Self {
        Batch::Flash(batch)
    }
}

impl From<PaddedBatch> for Batch {
    fn from(batch: PaddedBatch) -> Self {
        Batch::Padded(batch)
    }
}
