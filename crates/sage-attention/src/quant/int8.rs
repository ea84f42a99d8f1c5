//! Symmetric INT8 quantization of Q and K.
//!
//! Each group's scale is `max|x| / 127 + ε`, and every element becomes
//! `round_half_away_from_zero(x / scale)`, so `|x - q·scale| ≤ scale / 2`.
//! Positions beyond the real sequence length are zero and never influence a
//! scale; a group with no real positions gets scale `ε`.

use rayon::prelude::*;

use crate::core::errors::Result;
use crate::layout::view::ParallelUnit;
use crate::layout::HostView;
use crate::quant::groups::GroupPlan;
use crate::quant::smooth::ChannelMean;
use crate::quant::tensors::{QuantizedTensor, ScaleTensor};

/// Floor added to every scale so all-zero groups stay invertible.
pub const SCALE_EPSILON: f32 = 1e-7;
pub const INT8_MAX: f32 = 127.0;

/// Round to the nearest integer with ties away from zero, saturating to i8.
#[inline]
pub fn round_half_away_from_zero(x: f32) -> i8 {
    let shifted = x + 0.5f32.copysign(x);
    shifted.trunc().clamp(i8::MIN as f32, i8::MAX as f32) as i8
}

#[inline]
pub fn group_scale(max_abs: f32) -> f32 {
    max_abs / INT8_MAX + SCALE_EPSILON
}

/// Quantized Q or K with its `[batch, heads, groups]` scales.
#[derive(Debug, Clone)]
pub struct Int8Quantized {
    pub values: QuantizedTensor<i8>,
    pub scales: ScaleTensor,
    pub plan: GroupPlan,
}

/// Quantize `input` group-wise under `plan`, optionally centering each head
/// on `center` first.
///
/// Work is split over contiguous `(batch, head)` slabs, each writing its own
/// slice of the output and scale buffers.
pub fn quantize_int8(
    input: &HostView,
    center: Option<&ChannelMean>,
    plan: GroupPlan,
) -> Result<Int8Quantized> {
    let [batch, heads, seq, dim] = input.dims();
    let groups = plan.num_groups(seq);
    let mut data = vec![0i8; input.len()];
    let mut scales = vec![SCALE_EPSILON; batch * heads * groups];

    let unit = ParallelUnit::new(input.layout(), heads, seq, dim);
    let per_unit = unit.heads_per_unit();
    if unit.elems() > 0 && groups > 0 {
        data.par_chunks_mut(unit.elems())
            .zip(scales.par_chunks_mut(per_unit * groups))
            .zip(input.data().par_chunks(unit.elems()))
            .enumerate()
            .for_each(|(u, ((out, scale_out), src))| {
                for local in 0..per_unit {
                    let (b, h) = unit.coords(u, local);
                    let shift = center.map(|c| c.row(b, h));
                    let value = |s: usize, d: usize| {
                        let x = src[unit.local_offset(local, s, d)];
                        shift.map_or(x, |m| x - m[d])
                    };
                    for group in 0..groups {
                        let mut max_abs = 0f32;
                        for s in plan.positions(group, seq) {
                            for d in 0..dim {
                                max_abs = max_abs.max(value(s, d).abs());
                            }
                        }
                        let scale = group_scale(max_abs);
                        scale_out[local * groups + group] = scale;
                        for s in plan.positions(group, seq) {
                            for d in 0..dim {
                                out[unit.local_offset(local, s, d)] =
                                    round_half_away_from_zero(value(s, d) / scale);
                            }
                        }
                    }
                }
            });
    }

    Ok(Int8Quantized {
        values: QuantizedTensor::new(data, input.dims(), input.layout()),
        scales: ScaleTensor::new(scales, &[batch, heads, groups])?,
        plan,
    })
}
