//! Result correction: undo K smoothing in the log-sum-exp and restore the
//! caller's dtype, layout and head dimension.
//!
//! Kernels report `lse₂ = m + log₂ l` over the logits of the smoothed K.
//! Since `q·(k - k̄) = q·k - q·k̄`, the natural-log LSE of the unsmoothed
//! problem is `lse₂ / log₂e + (q·k̄) · sm_scale`.

use candle_core::{DType, Device, Tensor};

use crate::core::config::TensorLayout;
use crate::core::errors::Result;
use crate::layout::trim_head_dim;
use crate::quant::ChannelMean;

pub const LOG2_E: f32 = std::f32::consts::LOG2_E;

/// `q · k̄ᵀ` for every query row, `[batch, q_heads, q_len]` in `f32`.
///
/// `q` is the padded input in `layout`; `mean` holds one K mean per KV head
/// over the padded head dimension.
pub fn lse_correction(q: &Tensor, mean: &ChannelMean, layout: TensorLayout) -> Result<Tensor> {
    let q = q.to_dtype(DType::F32)?;
    let q = match layout {
        TensorLayout::Hnd => q,
        TensorLayout::Nhd => q.transpose(1, 2)?.contiguous()?,
    };
    let (batch, q_heads, q_len, dim) = q.dims4()?;
    let kv_heads = mean.heads();
    let group = q_heads / kv_heads;

    // [b, kv, 1, d] -> [b, kv, group, d] -> [b, q_heads, d, 1]
    let km = mean
        .to_tensor(q.device())?
        .broadcast_as((batch, kv_heads, group, dim))?
        .reshape((batch, q_heads, dim))?
        .unsqueeze(3)?;
    let correction = q.matmul(&km.contiguous()?)?;
    Ok(correction.reshape((batch, q_heads, q_len))?)
}

/// Convert raw base-2 LSE to natural log and add back the smoothing shift.
pub fn correct_lse(raw: &Tensor, correction: Option<&Tensor>, sm_scale: f32) -> Result<Tensor> {
    let lse = raw.affine(1.0 / LOG2_E as f64, 0.0)?;
    match correction {
        Some(correction) => Ok(lse.add(&correction.affine(sm_scale as f64, 0.0)?)?),
        None => Ok(lse),
    }
}

/// Turn a kernel output buffer in `physical` dims into the caller's dtype and
/// unpadded head dimension.
pub fn finalize_output(
    buffer: Vec<f32>,
    physical: &[usize],
    original_head_dim: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let output = Tensor::from_vec(buffer, physical, device)?;
    let output = trim_head_dim(&output, original_head_dim)?;
    Ok(output.to_dtype(dtype)?)
}

/// Raw `[batch, heads, q_len]` LSE buffer as a tensor.
pub fn raw_lse_tensor(raw: Vec<f32>, dims: (usize, usize, usize), device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_vec(raw, dims, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::HostView;

    #[test]
    fn raw_lse_converts_to_natural_log() -> anyhow::Result<()> {
        let raw = Tensor::new(&[[[0f32, 1.0, LOG2_E]]], &Device::Cpu)?;
        let lse = correct_lse(&raw, None, 0.5)?;
        let values = lse.flatten_all()?.to_vec1::<f32>()?;
        assert!((values[0] - 0.0).abs() < 1e-6);
        assert!((values[1] - std::f32::consts::LN_2).abs() < 1e-6);
        assert!((values[2] - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn correction_matches_hand_computed_dot_products() -> anyhow::Result<()> {
        let device = Device::Cpu;
        // One batch, two query heads sharing one KV head, two rows, dim 2.
        let q = Tensor::new(&[[[[1f32, 2.0], [0.0, -1.0]], [[3.0, 0.5], [1.0, 1.0]]]], &device)?;
        let k = HostView::from_vec(vec![1.0, 3.0, 3.0, 5.0], [1, 1, 2, 2], TensorLayout::Hnd)?;
        let mean = ChannelMean::over_sequence(&k); // [2, 4]
        let correction = lse_correction(&q, &mean, TensorLayout::Hnd)?;
        assert_eq!(correction.dims(), &[1, 2, 2]);
        let values = correction.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(values, vec![10.0, -4.0, 8.0, 6.0]);

        let raw = Tensor::zeros((1, 2, 2), DType::F32, &device)?;
        let lse = correct_lse(&raw, Some(&correction), 0.5)?;
        assert_eq!(lse.flatten_all()?.to_vec1::<f32>()?, vec![5.0, -2.0, 4.0, 3.0]);
        Ok(())
    }

    #[test]
    fn nhd_queries_are_transposed_first() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let hnd = Tensor::arange(0f32, 12.0, &device)?.reshape((1, 2, 3, 2))?;
        let nhd = hnd.transpose(1, 2)?.contiguous()?;
        let mean = ChannelMean::over_sequence(&HostView::from_vec(
            vec![1.0, -1.0, 2.0, 0.5],
            [1, 2, 1, 2],
            TensorLayout::Hnd,
        )?);
        let a = lse_correction(&hnd, &mean, TensorLayout::Hnd)?;
        let b = lse_correction(&nhd, &mean, TensorLayout::Nhd)?;
        assert_eq!(
            a.flatten_all()?.to_vec1::<f32>()?,
            b.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }
}
