//! Building batches from flat wire requests.

use super::{Batch, FlashBatch, PaddedBatch};
use crate::backend::Backend;
use crate::batch::BatchKind;
use crate::error::{FlashBertError, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::instrument;

/// Flat request as handed over by the router: every sequence concatenated,
/// boundaries in `cu_seq_lengths`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbedRequest {
    /// Token ids.
    pub input_ids: Vec<u32>,
    /// Token type (segment) ids.
    pub token_type_ids: Vec<u32>,
    /// Position ids.
    pub position_ids: Vec<u32>,
    /// Cumulative sequence lengths, `num_sequences + 1` entries.
    pub cu_seq_lengths: Vec<u32>,
    /// Longest sequence in the request.
    pub max_length: u32,
}

impl EmbedRequest {
    /// Pack sequences of `(input_ids, token_type_ids)` with positions
    /// `0..len`.
    pub fn from_sequences<I>(sequences: I) -> Self
    where
        I: IntoIterator<Item = (Vec<u32>, Vec<u32>)>,
    {
        let mut req = EmbedRequest {
            cu_seq_lengths: vec![0],
            ..Default::default()
        };
        for (ids, types) in sequences {
            let len = ids.len() as u32;
            req.input_ids.extend(ids);
            req.token_type_ids.extend(types);
            req.position_ids.extend(0..len);
            req.cu_seq_lengths.push(req.input_ids.len() as u32);
            req.max_length = req.max_length.max(len);
        }
        req
    }

    /// Number of sequences.
    pub fn num_sequences(&self) -> usize {
        self.cu_seq_lengths.len().saturating_sub(1)
    }

    /// Number of tokens.
    pub fn num_tokens(&self) -> usize {
        self.input_ids.len()
    }

    fn check_max_input_length(&self, max_input_length: usize) -> Result<()> {
        if self.max_length as usize > max_input_length {
            return Err(FlashBertError::InputTooLong {
                length: self.max_length as usize,
                max: max_input_length,
            });
        }
        Ok(())
    }
}

/// Shape bucketing for padded batches, so the device only ever sees a small
/// set of distinct `[rows, len]` shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketingConfig {
    /// Smallest padded length; lengths grow from here.
    pub pad_sequence_to_multiple_of: usize,
    /// Growth factor between successive length buckets.
    pub seq_len_exponent_base: usize,
}

impl Default for BucketingConfig {
    fn default() -> Self {
        Self {
            pad_sequence_to_multiple_of: 128,
            seq_len_exponent_base: 2,
        }
    }
}

impl BucketingConfig {
    /// Defaults overridden by `PAD_SEQUENCE_TO_MULTIPLE_OF` and
    /// `SEQ_LEN_EXPONENT_BASE`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = env_usize("PAD_SEQUENCE_TO_MULTIPLE_OF")? {
            config.pad_sequence_to_multiple_of = v;
        }
        if let Some(v) = env_usize("SEQ_LEN_EXPONENT_BASE")? {
            config.seq_len_exponent_base = v;
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject bucket parameters that cannot grow.
    pub fn validate(&self) -> Result<()> {
        if self.pad_sequence_to_multiple_of == 0 {
            return Err(FlashBertError::InvalidConfig(
                "pad_sequence_to_multiple_of must be > 0".into(),
            ));
        }
        if self.seq_len_exponent_base < 2 {
            return Err(FlashBertError::InvalidConfig(format!(
                "seq_len_exponent_base must be >= 2, got {}",
                self.seq_len_exponent_base
            )));
        }
        Ok(())
    }

    /// Padded length for a request whose longest sequence is `max_length`.
    pub fn bucket_len(&self, max_length: usize, max_input_length: usize) -> usize {
        round_up_seq(
            max_length,
            self.pad_sequence_to_multiple_of,
            self.seq_len_exponent_base,
        )
        .min(max_input_length)
    }

    /// Padded row count for `batch_size` sequences.
    pub fn bucket_rows(&self, batch_size: usize) -> usize {
        batch_size.next_power_of_two()
    }
}

fn env_usize(key: &str) -> Result<Option<usize>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| FlashBertError::InvalidConfig(format!("{key}={raw} is not an integer"))),
        Err(_) => Ok(None),
    }
}

/// Smallest `k * base^e` (with `e >= 0`) that is at least `n`.
pub fn round_up_seq(n: usize, k: usize, base: usize) -> usize {
    let mut len = k.max(1);
    if base < 2 {
        return len.max(n);
    }
    while len < n {
        len *= base;
    }
    len
}

impl FlashBatch {
    /// Upload a request as a packed batch.
    #[instrument(name = "from_request", skip_all, fields(kind = "flash", size = req.num_sequences()))]
    pub fn from_request(req: &EmbedRequest, device: &Device) -> Result<Self> {
        FlashBatch::new(
            &req.input_ids,
            &req.token_type_ids,
            &req.position_ids,
            req.cu_seq_lengths.clone(),
            req.max_length as usize,
            device,
        )
    }
}

impl PaddedBatch {
    /// Lay a request out as a left-aligned padded grid.
    ///
    /// With `bucketing`, the padded length and row count are rounded up to
    /// the next bucket; filler rows are fully masked and produce no output.
    #[instrument(name = "from_request", skip_all, fields(kind = "padded", size = req.num_sequences()))]
    pub fn from_request(
        req: &EmbedRequest,
        device: &Device,
        max_input_length: usize,
        bucketing: Option<&BucketingConfig>,
    ) -> Result<Self> {
        req.check_max_input_length(max_input_length)?;

        let total = req.num_tokens();
        if req.token_type_ids.len() != total || req.position_ids.len() != total {
            return Err(FlashBertError::InvalidBatch(format!(
                "id arrays differ in length: input {}, token type {}, position {}",
                total,
                req.token_type_ids.len(),
                req.position_ids.len()
            )));
        }
        let batch_size = req.num_sequences();
        if batch_size == 0 {
            return Err(FlashBertError::InvalidBatch(
                "offsets must describe at least one sequence".into(),
            ));
        }
        if req.cu_seq_lengths[0] != 0 || req.cu_seq_lengths[batch_size] as usize != total {
            return Err(FlashBertError::InvalidBatch(format!(
                "offsets {:?} do not cover {} tokens",
                req.cu_seq_lengths, total
            )));
        }

        let (rows, len) = match bucketing {
            Some(b) => (
                b.bucket_rows(batch_size),
                b.bucket_len(req.max_length as usize, max_input_length),
            ),
            None => (batch_size, req.max_length as usize),
        };

        let cells = rows * len;
        let mut input_ids = vec![0u32; cells];
        let mut token_type_ids = vec![0u32; cells];
        let mut position_ids = vec![0u32; cells];
        let mut attention_mask = vec![0u8; cells];

        for (i, w) in req.cu_seq_lengths.windows(2).enumerate() {
            let (start, end) = (w[0] as usize, w[1] as usize);
            if end < start || end - start > len {
                return Err(FlashBertError::InvalidBatch(format!(
                    "sequence {} spans {}..{} which does not fit a padded length of {}",
                    i, start, end, len
                )));
            }
            let n = end - start;
            let row = i * len;
            input_ids[row..row + n].copy_from_slice(&req.input_ids[start..end]);
            token_type_ids[row..row + n].copy_from_slice(&req.token_type_ids[start..end]);
            position_ids[row..row + n].copy_from_slice(&req.position_ids[start..end]);
            attention_mask[row..row + n].fill(1);
        }

        tracing::trace!(rows, len, batch_size, "padded batch layout");

        PaddedBatch::new(
            rows,
            len,
            &input_ids,
            &token_type_ids,
            &position_ids,
            &attention_mask,
            batch_size,
            device,
        )
    }
}

impl Batch {
    /// Build the batch variant `backend` consumes.
    ///
    /// Bucketing only applies to padded batches.
    pub fn from_request(
        req: &EmbedRequest,
        backend: Backend,
        device: &Device,
        max_input_length: usize,
        bucketing: Option<&BucketingConfig>,
    ) -> Result<Self> {
        match backend.batch_kind() {
            BatchKind::Flash => {
                req.check_max_input_length(max_input_length)?;
                Ok(Batch::Flash(FlashBatch::from_request(req, device)?))
            }
            BatchKind::Padded => Ok(Batch::Padded(PaddedBatch::from_request(
                req,
                device,
                max_input_length,
                bucketing,
            )?)),
        }
    }
}
