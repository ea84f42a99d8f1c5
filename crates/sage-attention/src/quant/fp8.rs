//! FP8 E4M3 encoding and per-channel V quantization.

use rayon::prelude::*;

use crate::core::errors::Result;
use crate::layout::view::ParallelUnit;
use crate::layout::HostView;
use crate::quant::int8::SCALE_EPSILON;
use crate::quant::smooth::ChannelMean;
use crate::quant::tensors::{QuantizedTensor, ScaleTensor};

/// Largest finite E4M3 magnitude.
pub const FP8_E4M3_MAX: f32 = 448.0;

const MIN_NORMAL: f32 = 0.015625; // 2^-6
const SUBNORMAL_STEP: f32 = 0.001953125; // 2^-9

/// One FP8 E4M3 value (1 sign, 4 exponent, 3 mantissa bits, bias 7, no
/// infinities, NaN at `S.1111.111`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fp8E4M3(pub u8);

impl Fp8E4M3 {
    pub const MAX: Fp8E4M3 = Fp8E4M3(0x7E);

    /// Round-to-nearest-even, saturating to ±448.
    pub fn from_f32(x: f32) -> Self {
        let sign = if x.is_sign_negative() { 0x80u8 } else { 0 };
        if x.is_nan() {
            return Fp8E4M3(sign | 0x7F);
        }
        let a = x.abs();
        if a >= FP8_E4M3_MAX {
            return Fp8E4M3(sign | Self::MAX.0);
        }
        if a < MIN_NORMAL {
            // Code 8 is the smallest normal, so a rounded-up subnormal carries.
            let m = (a / SUBNORMAL_STEP).round_ties_even() as u8;
            return Fp8E4M3(sign | m);
        }
        let exp = ((a.to_bits() >> 23) & 0xFF) as i32 - 127;
        let frac = a / 2f32.powi(exp) - 1.0;
        let mut mant = (frac * 8.0).round_ties_even() as i32;
        let mut biased = exp + 7;
        if mant == 8 {
            mant = 0;
            biased += 1;
        }
        let code = ((biased << 3) | mant).min(Self::MAX.0 as i32) as u8;
        Fp8E4M3(sign | code)
    }

    pub fn to_f32(self) -> f32 {
        let sign = if self.0 & 0x80 != 0 { -1.0 } else { 1.0 };
        let exp = ((self.0 >> 3) & 0x0F) as i32;
        let mant = (self.0 & 0x07) as f32;
        if exp == 0x0F && self.0 & 0x07 == 0x07 {
            return f32::NAN;
        }
        if exp == 0 {
            return sign * mant * SUBNORMAL_STEP;
        }
        sign * (1.0 + mant / 8.0) * 2f32.powi(exp - 7)
    }
}

/// V quantized to FP8 with one scale per `(batch, head, channel)`.
#[derive(Debug, Clone)]
pub struct Fp8Value {
    /// Sequence axis zero-padded to the tier's alignment.
    pub values: QuantizedTensor<Fp8E4M3>,
    /// `[batch, kv_heads, head_dim]`.
    pub scales: ScaleTensor,
    /// Present when V was smoothed; the kernel adds it back.
    pub mean: Option<ChannelMean>,
    /// Real sequence length before padding.
    pub seq_len: usize,
}

/// Quantize V per channel: `scale = max_s |v - mean| / 448 + ε`.
pub fn quantize_value_fp8(
    input: &HostView,
    smooth: bool,
    seq_alignment: Option<usize>,
) -> Result<Fp8Value> {
    let [batch, heads, seq, dim] = input.dims();
    let padded_seq = match seq_alignment {
        Some(align) if align > 0 => seq.div_ceil(align) * align,
        _ => seq,
    };
    let mean = smooth.then(|| ChannelMean::over_sequence(input));

    let src_unit = ParallelUnit::new(input.layout(), heads, seq, dim);
    let dst_unit = ParallelUnit::new(input.layout(), heads, padded_seq, dim);
    let per_unit = src_unit.heads_per_unit();

    let mut data = vec![Fp8E4M3::default(); batch * heads * padded_seq * dim];
    let mut scales = vec![SCALE_EPSILON; batch * heads * dim];

    if src_unit.elems() > 0 {
        data.par_chunks_mut(dst_unit.elems())
            .zip(scales.par_chunks_mut(per_unit * dim))
            .zip(input.data().par_chunks(src_unit.elems()))
            .enumerate()
            .for_each(|(u, ((out, scale_out), src))| {
                for local in 0..per_unit {
                    let (b, h) = src_unit.coords(u, local);
                    let shift = mean.as_ref().map(|m| m.row(b, h));
                    for d in 0..dim {
                        let centered = |s: usize| {
                            let x = src[src_unit.local_offset(local, s, d)];
                            shift.map_or(x, |m| x - m[d])
                        };
                        let max_abs = (0..seq).fold(0f32, |acc, s| acc.max(centered(s).abs()));
                        let scale = max_abs / FP8_E4M3_MAX + SCALE_EPSILON;
                        scale_out[local * dim + d] = scale;
                        for s in 0..seq {
                            out[dst_unit.local_offset(local, s, d)] =
                                Fp8E4M3::from_f32(centered(s) / scale);
                        }
                    }
                }
            });
    }

    Ok(Fp8Value {
        values: QuantizedTensor::new(data, [batch, heads, padded_seq, dim], input.layout()),
        scales: ScaleTensor::new(scales, &[batch, heads, dim])?,
        mean,
        seq_len: seq,
    })
}
