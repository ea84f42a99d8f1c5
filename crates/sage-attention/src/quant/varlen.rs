//! Packed variable-length batches.
//!
//! Sequences are concatenated along the token axis of a `[total, heads,
//! head_dim]` tensor and delimited by a cumulative length table. Each
//! sequence is quantized per block on its own, so no block straddles two
//! sequences; the scale table gets its own cumulative offsets counted in
//! blocks.

use std::ops::Range;

use candle_core::{DType, Tensor};
use rayon::prelude::*;

use crate::core::errors::{AttentionError, Result};
use crate::layout::HostView;
use crate::quant::int8::{group_scale, round_half_away_from_zero};
use crate::quant::smooth::ChannelMean;
use crate::quant::tensors::{QuantizedTensor, ScaleTensor};

/// Validated cumulative offsets `[0, len_0, len_0 + len_1, ..., total]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CuSeqlens(Vec<usize>);

impl CuSeqlens {
    /// Validate `offsets` against the packed token count and the declared
    /// maximum sequence length.
    pub fn new(offsets: Vec<usize>, total: usize, max_seqlen: usize) -> Result<Self> {
        let invalid = |context: String| Err(AttentionError::InvalidSeqlens { context });
        if offsets.len() < 2 {
            return invalid(format!(
                "need at least two offsets, got {}",
                offsets.len()
            ));
        }
        if offsets[0] != 0 {
            return invalid(format!("first offset must be 0, got {}", offsets[0]));
        }
        for (b, pair) in offsets.windows(2).enumerate() {
            if pair[1] < pair[0] {
                return invalid(format!(
                    "offsets decrease at sequence {b}: {} -> {}",
                    pair[0], pair[1]
                ));
            }
            let len = pair[1] - pair[0];
            if len > max_seqlen {
                return invalid(format!(
                    "sequence {b} has length {len}, above max_seqlen {max_seqlen}"
                ));
            }
        }
        let last = offsets[offsets.len() - 1];
        if last != total {
            return invalid(format!(
                "last offset {last} does not match {total} packed tokens"
            ));
        }
        Ok(Self(offsets))
    }

    /// Read a rank-1 `u32` or `i64` tensor of offsets.
    pub fn from_tensor(tensor: &Tensor, total: usize, max_seqlen: usize) -> Result<Self> {
        if tensor.rank() != 1 {
            return Err(AttentionError::InvalidSeqlens {
                context: format!("expected a rank-1 tensor, got {:?}", tensor.dims()),
            });
        }
        if !matches!(tensor.dtype(), DType::U32 | DType::I64) {
            return Err(AttentionError::InvalidSeqlens {
                context: format!("expected u32 or i64 offsets, got {:?}", tensor.dtype()),
            });
        }
        let raw = tensor.to_dtype(DType::I64)?.to_vec1::<i64>()?;
        let offsets = raw
            .into_iter()
            .map(|o| {
                usize::try_from(o).map_err(|_| AttentionError::InvalidSeqlens {
                    context: format!("negative offset {o}"),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(offsets, total, max_seqlen)
    }

    pub fn offsets(&self) -> &[usize] {
        &self.0
    }

    /// Number of sequences.
    pub fn batch(&self) -> usize {
        self.0.len() - 1
    }

    pub fn total(&self) -> usize {
        self.0[self.0.len() - 1]
    }

    pub fn range(&self, b: usize) -> Range<usize> {
        self.0[b]..self.0[b + 1]
    }

    pub fn len_of(&self, b: usize) -> usize {
        self.0[b + 1] - self.0[b]
    }

    /// Sequence containing packed index `index`.
    pub fn sequence_of(&self, index: usize) -> usize {
        self.0.partition_point(|&o| o <= index) - 1
    }

    /// Offsets counted in `block`-sized groups: `ceil(len_b / block)` each.
    pub fn block_offsets(&self, block: usize) -> CuSeqlens {
        let mut offsets = Vec::with_capacity(self.0.len());
        offsets.push(0);
        let mut acc = 0;
        for b in 0..self.batch() {
            acc += self.len_of(b).div_ceil(block);
            offsets.push(acc);
        }
        CuSeqlens(offsets)
    }
}

/// Packed Q or K quantized per block within each sequence.
#[derive(Debug, Clone)]
pub struct VarlenInt8 {
    /// Batch-1 NHD view of the packed tokens.
    pub values: QuantizedTensor<i8>,
    /// `[total_blocks, heads]`.
    pub scales: ScaleTensor,
    /// Block offsets of each sequence in `scales`.
    pub cu_scale: CuSeqlens,
    pub block: usize,
}

impl VarlenInt8 {
    /// Scale of packed token `token` (in sequence `b`) for head `h`.
    #[inline]
    pub fn scale_of(&self, seqlens: &CuSeqlens, b: usize, token: usize, h: usize) -> f32 {
        let group = block_of(&self.cu_scale, seqlens, self.block, b, token);
        self.scales.values()[group * self.values.heads() + h]
    }
}

#[inline]
fn block_of(cu_scale: &CuSeqlens, seqlens: &CuSeqlens, block: usize, b: usize, token: usize) -> usize {
    cu_scale.offsets()[b] + (token - seqlens.offsets()[b]) / block
}

/// Quantize a packed batch per block of `block` tokens.
pub fn quantize_int8_varlen(
    input: &HostView,
    center: Option<&ChannelMean>,
    seqlens: &CuSeqlens,
    block: usize,
) -> Result<VarlenInt8> {
    let [_, heads, total, dim] = input.dims();
    if total != seqlens.total() {
        return Err(AttentionError::InvalidSeqlens {
            context: format!(
                "table covers {} tokens, tensor has {total}",
                seqlens.total()
            ),
        });
    }
    let cu_scale = seqlens.block_offsets(block);
    let blocks = cu_scale.total();
    let shift = |h: usize| center.map(|c| c.row(0, h));

    let mut scales = vec![0f32; blocks * heads];
    if heads > 0 {
        scales
            .par_chunks_mut(heads)
            .enumerate()
            .for_each(|(group, out)| {
                let b = cu_scale.sequence_of(group);
                let start = seqlens.offsets()[b] + (group - cu_scale.offsets()[b]) * block;
                let end = (start + block).min(seqlens.offsets()[b + 1]);
                for (h, scale) in out.iter_mut().enumerate() {
                    let mean = shift(h);
                    let mut max_abs = 0f32;
                    for token in start..end {
                        for d in 0..dim {
                            let x = input.get(0, h, token, d);
                            max_abs = max_abs.max(mean.map_or(x, |m| x - m[d]).abs());
                        }
                    }
                    *scale = group_scale(max_abs);
                }
            });
    }

    let mut data = vec![0i8; input.len()];
    if heads * dim > 0 {
        data.par_chunks_mut(heads * dim)
            .enumerate()
            .for_each(|(token, row)| {
                let b = seqlens.sequence_of(token);
                let group = block_of(&cu_scale, seqlens, block, b, token);
                for h in 0..heads {
                    let mean = shift(h);
                    let scale = scales[group * heads + h];
                    for d in 0..dim {
                        let x = input.get(0, h, token, d);
                        row[h * dim + d] =
                            round_half_away_from_zero(mean.map_or(x, |m| x - m[d]) / scale);
                    }
                }
            });
    }

    Ok(VarlenInt8 {
        values: QuantizedTensor::new(data, input.dims(), input.layout()),
        scales: ScaleTensor::new(scales, &[blocks, heads])?,
        cu_scale,
        block,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TensorLayout;

    #[test]
    fn malformed_tables_are_rejected() {
        let err = |offsets: Vec<usize>, total, max| CuSeqlens::new(offsets, total, max).unwrap_err();
        assert!(err(vec![0], 0, 4).to_string().contains("two offsets"));
        assert!(err(vec![1, 4], 4, 4).to_string().contains("first offset"));
        assert!(err(vec![0, 5, 3], 3, 8).to_string().contains("decrease"));
        assert!(err(vec![0, 3, 8], 8, 4).to_string().contains("max_seqlen"));
        assert!(err(vec![0, 3, 7], 8, 8).to_string().contains("packed tokens"));
    }

    #[test]
    fn offset_tensors_must_hold_integers() -> anyhow::Result<()> {
        let device = candle_core::Device::Cpu;
        let ints = Tensor::new(&[0u32, 3, 8], &device)?;
        assert_eq!(CuSeqlens::from_tensor(&ints, 8, 5)?.offsets(), &[0, 3, 8]);
        let longs = Tensor::new(&[0i64, 3, 8], &device)?;
        assert_eq!(CuSeqlens::from_tensor(&longs, 8, 5)?.batch(), 2);

        let floats = Tensor::new(&[0f32, 3.0, 8.0], &device)?;
        let err = CuSeqlens::from_tensor(&floats, 8, 5).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidSeqlens { .. }));
        assert!(err.is_configuration());
        let negative = Tensor::new(&[0i64, -1, 8], &device)?;
        assert!(CuSeqlens::from_tensor(&negative, 8, 8).is_err());
        Ok(())
    }

    #[test]
    fn block_offsets_round_each_sequence_up() -> anyhow::Result<()> {
        let seqlens = CuSeqlens::new(vec![0, 3, 3, 133], 133, 130)?;
        assert_eq!(seqlens.block_offsets(64).offsets(), &[0, 1, 1, 4]);
        assert_eq!(seqlens.sequence_of(0), 0);
        assert_eq!(seqlens.sequence_of(3), 2);
        assert_eq!(seqlens.sequence_of(132), 2);
        Ok(())
    }

    #[test]
    fn blocks_never_straddle_sequences() -> anyhow::Result<()> {
        // Sequence 0 is small values, sequence 1 large; a shared block would
        // squash sequence 0 to zero.
        let mut data = vec![0.01f32; 3];
        data.extend([100.0f32; 5]);
        let view = HostView::from_vec(data, [1, 1, 8, 1], TensorLayout::Nhd)?;
        let seqlens = CuSeqlens::new(vec![0, 3, 8], 8, 5)?;
        let q = quantize_int8_varlen(&view, None, &seqlens, 128)?;
        assert_eq!(q.scales.shape(), &[2, 1]);
        assert_eq!(q.values.get(0, 0, 0, 0), 127);
        assert_eq!(q.values.get(0, 0, 7, 0), 127);
        Ok(())
    }
}
