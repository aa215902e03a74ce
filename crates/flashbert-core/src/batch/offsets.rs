//! Cumulative sequence offsets for packed batches.

use crate::error::{FlashBertError, Result};
use candle_core::{Device, Tensor};

/// Cumulative sequence boundaries (`cu_seqlens`), kept both on the host (for
/// per-sequence bookkeeping) and on the device (for kernels and indexing).
///
/// `offsets[i]..offsets[i + 1]` is the token range of sequence `i` in the
/// packed buffer; the array has `num_sequences + 1` entries and starts at 0.
#[derive(Debug, Clone)]
pub struct SequenceOffsets {
    host: Vec<u32>,
    tensor: Tensor,
}

impl SequenceOffsets {
    /// Validate and upload offsets.
    ///
    /// Every sequence must hold at least one token.
    pub fn new(host: Vec<u32>, device: &Device) -> Result<Self> {
        if host.len() < 2 {
            return Err(FlashBertError::InvalidBatch(
                "offsets must describe at least one sequence".into(),
            ));
        }
        if host[0] != 0 {
            return Err(FlashBertError::InvalidBatch(format!(
                "offsets must start at 0, got {}",
                host[0]
            )));
        }
        if let Some(pos) = host.windows(2).position(|w| w[1] <= w[0]) {
            return Err(FlashBertError::InvalidBatch(format!(
                "offsets must be strictly increasing, sequence {} is empty or negative: {:?}",
                pos, host
            )));
        }
        let tensor = Tensor::from_slice(&host, host.len(), device)?;
        Ok(Self { host, tensor })
    }

    /// Build offsets from per-sequence lengths.
    pub fn from_lengths(lengths: &[u32], device: &Device) -> Result<Self> {
        let mut host = Vec::with_capacity(lengths.len() + 1);
        host.push(0u32);
        let mut total = 0u32;
        for &len in lengths {
            total += len;
            host.push(total);
        }
        Self::new(host, device)
    }

    /// Host copy of the offsets.
    pub fn as_slice(&self) -> &[u32] {
        &self.host
    }

    /// Device copy of the offsets (u32, `[num_sequences + 1]`).
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// Number of sequences.
    pub fn num_sequences(&self) -> usize {
        self.host.len() - 1
    }

    /// Number of packed tokens.
    pub fn total_tokens(&self) -> usize {
        self.host[self.host.len() - 1] as usize
    }

    /// `(start, len)` of every sequence.
    pub fn ranges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.host
            .windows(2)
            .map(|w| (w[0] as usize, (w[1] - w[0]) as usize))
    }

    /// Longest sequence.
    pub fn max_len(&self) -> usize {
        self.ranges().map(|(_, len)| len).max().unwrap_or(0)
    }

    /// First-token index of every sequence (`offsets[..-1]`), on device.
    pub fn starts(&self) -> Result<Tensor> {
        Ok(self.tensor.narrow(0, 0, self.num_sequences())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_lengths_accumulates() {
        let offsets = SequenceOffsets::from_lengths(&[3, 2], &Device::Cpu).unwrap();
        assert_eq!(offsets.as_slice(), &[0, 3, 5]);
        assert_eq!(offsets.num_sequences(), 2);
        assert_eq!(offsets.total_tokens(), 5);
        assert_eq!(offsets.max_len(), 3);
        assert_eq!(offsets.ranges().collect::<Vec<_>>(), vec![(0, 3), (3, 2)]);
        assert_eq!(offsets.starts().unwrap().to_vec1::<u32>().unwrap(), vec![0, 3]);
        assert_eq!(offsets.tensor().to_vec1::<u32>().unwrap(), vec![0, 3, 5]);
    }

    #[test]
    fn rejects_malformed_offsets() {
        assert!(SequenceOffsets::new(vec![0], &Device::Cpu).is_err());
        assert!(SequenceOffsets::new(vec![1, 3], &Device::Cpu).is_err());
        assert!(SequenceOffsets::new(vec![0, 3, 3], &Device::Cpu).is_err());
        assert!(SequenceOffsets::new(vec![0, 4, 2], &Device::Cpu).is_err());
    }
}
