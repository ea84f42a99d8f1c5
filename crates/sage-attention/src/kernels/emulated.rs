//! Host emulation of the fused kernel families.
//!
//! Runs every entry point on the CPU with the same arithmetic contract as the
//! device kernels: integer Q·Kᵀ dot products rescaled by the group scales,
//! base-2 softmax, P rounded to the family's P·V precision, and accumulation
//! in the entry's accumulator mode. Fixed and variable-length launches share
//! one row routine, so a single-sequence varlen call reproduces the
//! fixed-length result exactly.

use rayon::prelude::*;

use crate::core::config::AccumulatorMode;
use crate::core::errors::{AttentionError, Result};
use crate::kernels::launch::{FusedAttentionKernel, KernelLaunch, ValueOperand, VarlenLaunch};
use crate::kernels::selector::PvPrecision;
use crate::layout::view::ParallelUnit;
use crate::masks::causal_key_limit;
use crate::quant::{Fp8E4M3, FP8_E4M3_MAX};

/// CPU stand-in for every kernel family.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmulatedKernel;

impl EmulatedKernel {
    pub fn new() -> Self {
        Self
    }
}

impl FusedAttentionKernel for EmulatedKernel {
    fn name(&self) -> &str {
        "emulated"
    }

    fn launch(&self, launch: &KernelLaunch<'_>, output: &mut [f32]) -> Result<Option<Vec<f32>>> {
        let shape = launch.shape;
        let dim = shape.head_dim;
        let layout = launch.q.values.layout();
        let expected = shape.batch * shape.q_heads * shape.q_len * dim;
        if output.len() != expected {
            return Err(AttentionError::Backend {
                message: format!(
                    "output buffer holds {} elements, launch needs {expected}",
                    output.len()
                ),
            });
        }

        let rows = RowParams {
            accumulator: launch.entry.accumulator,
            precision: launch.entry.family.pv_precision(),
            flush_every: launch.tiles.block_k,
            scale_log2: launch.sm_scale * std::f32::consts::LOG2_E,
        };
        let unit = ParallelUnit::new(layout, shape.q_heads, shape.q_len, dim);
        let per_unit = unit.heads_per_unit();
        let mut lse = vec![f32::NEG_INFINITY; shape.batch * shape.q_heads * shape.q_len];

        if unit.elems() > 0 {
            output
                .par_chunks_mut(unit.elems())
                .zip(lse.par_chunks_mut(per_unit * shape.q_len))
                .enumerate()
                .for_each(|(u, (out, lse_out))| {
                    let mut scores = vec![0f32; shape.kv_len];
                    for local in 0..per_unit {
                        let (b, h) = unit.coords(u, local);
                        let kv_h = shape.kv_head(h);
                        let mean = launch.v_mean.map(|m| m.row(b, kv_h));
                        for i in 0..shape.q_len {
                            let q_row = launch.q.values.row(b, h, i);
                            let q_scale = launch.q.scale(b, h, i);
                            let limit = if launch.causal {
                                causal_key_limit(i, shape.q_len, shape.kv_len)
                            } else {
                                shape.kv_len
                            };
                            for (j, score) in scores.iter_mut().enumerate() {
                                *score = if j >= limit {
                                    f32::NEG_INFINITY
                                } else {
                                    logit(
                                        q_row,
                                        launch.k.values.row(b, kv_h, j),
                                        q_scale,
                                        launch.k.scale(b, kv_h, j),
                                        rows.scale_log2,
                                    )
                                };
                            }
                            let start = unit.local_offset(local, i, 0);
                            let row_out = &mut out[start..start + dim];
                            lse_out[local * shape.q_len + i] = match launch.v {
                                ValueOperand::Half(values) => {
                                    rows.attend(&scores, row_out, |j, d| values.get(b, kv_h, j, d))
                                }
                                ValueOperand::Fp8 { values, scales } => {
                                    let v_scale = &scales.values()
                                        [(b * shape.kv_heads + kv_h) * dim..][..dim];
                                    rows.attend(&scores, row_out, |j, d| {
                                        values.get(b, kv_h, j, d).to_f32() * v_scale[d]
                                    })
                                }
                            };
                            if let Some(mean) = mean {
                                row_out.iter_mut().zip(mean).for_each(|(o, m)| *o += m);
                            }
                        }
                    }
                });
        }

        Ok(launch.return_lse.then_some(lse))
    }

    fn launch_varlen(&self, launch: &VarlenLaunch<'_>, output: &mut [f32]) -> Result<()> {
        let shape = launch.shape;
        let dim = shape.head_dim;
        let row_len = shape.q_heads * dim;
        if output.len() != shape.q_len * row_len {
            return Err(AttentionError::Backend {
                message: format!(
                    "output buffer holds {} elements, launch needs {}",
                    output.len(),
                    shape.q_len * row_len
                ),
            });
        }

        let rows = RowParams {
            accumulator: launch.entry.accumulator,
            precision: launch.entry.family.pv_precision(),
            flush_every: launch.k.block,
            scale_log2: launch.sm_scale * std::f32::consts::LOG2_E,
        };
        let (cu_q, cu_k) = (launch.cu_seqlens_q, launch.cu_seqlens_k);

        if row_len > 0 {
            output
                .par_chunks_mut(row_len)
                .enumerate()
                .for_each(|(token, out)| {
                    let b = cu_q.sequence_of(token);
                    let i = token - cu_q.offsets()[b];
                    let keys = cu_k.range(b);
                    let limit = if launch.causal {
                        causal_key_limit(i, cu_q.len_of(b), keys.len())
                    } else {
                        keys.len()
                    };
                    let mut scores = vec![0f32; keys.len()];
                    for h in 0..shape.q_heads {
                        let kv_h = shape.kv_head(h);
                        let q_row = launch.q.values.row(0, h, token);
                        let q_scale = launch.q.scale_of(cu_q, b, token, h);
                        for (j, score) in scores.iter_mut().enumerate() {
                            let key = keys.start + j;
                            *score = if j >= limit {
                                f32::NEG_INFINITY
                            } else {
                                logit(
                                    q_row,
                                    launch.k.values.row(0, kv_h, key),
                                    q_scale,
                                    launch.k.scale_of(cu_k, b, key, kv_h),
                                    rows.scale_log2,
                                )
                            };
                        }
                        let row_out = &mut out[h * dim..(h + 1) * dim];
                        rows.attend(&scores, row_out, |j, d| {
                            launch.v.get(0, kv_h, keys.start + j, d)
                        });
                    }
                });
        }
        Ok(())
    }
}

/// Base-2 attention logit from an INT8 dot product.
#[inline]
fn logit(q: &[i8], k: &[i8], q_scale: f32, k_scale: f32, scale_log2: f32) -> f32 {
    let dot: i32 = q.iter().zip(k).map(|(&a, &b)| a as i32 * b as i32).sum();
    dot as f32 * (q_scale * k_scale) * scale_log2
}

#[derive(Debug, Clone, Copy)]
struct RowParams {
    accumulator: AccumulatorMode,
    precision: PvPrecision,
    /// Keys per flush of the narrow buffer under the hybrid accumulator.
    flush_every: usize,
    scale_log2: f32,
}

impl RowParams {
    /// Softmax-weighted sum of V rows for one query; returns the raw base-2
    /// LSE `m + log2(l)`. A fully masked row yields zeros and `-inf`.
    fn attend(&self, scores: &[f32], out: &mut [f32], value: impl Fn(usize, usize) -> f32) -> f32 {
        let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if max == f32::NEG_INFINITY {
            out.fill(0.0);
            return f32::NEG_INFINITY;
        }

        let mut wide = vec![0f32; out.len()];
        let mut narrow = vec![0f32; out.len()];
        let mut sum = 0f32;
        for (j, &score) in scores.iter().enumerate() {
            let p = (score - max).exp2();
            if p > 0.0 {
                sum += p;
                let p = self.round_probability(p);
                for (d, (w, n)) in wide.iter_mut().zip(narrow.iter_mut()).enumerate() {
                    let term = p * value(j, d);
                    match self.accumulator {
                        AccumulatorMode::Wide => *w += term,
                        AccumulatorMode::Narrow | AccumulatorMode::Hybrid => {
                            *n = self.round_accumulator(*n + term)
                        }
                    }
                }
            }
            if self.accumulator == AccumulatorMode::Hybrid && (j + 1) % self.flush_every == 0 {
                for (w, n) in wide.iter_mut().zip(narrow.iter_mut()) {
                    *w += *n;
                    *n = 0.0;
                }
            }
        }

        for (o, (w, n)) in out.iter_mut().zip(wide.iter().zip(&narrow)) {
            *o = (w + n) / sum;
        }
        max + sum.log2()
    }

    fn round_probability(&self, p: f32) -> f32 {
        match self.precision {
            PvPrecision::F16 => half::f16::from_f32(p).to_f32(),
            // P is scaled into the full FP8 range before the cast.
            PvPrecision::F8 => Fp8E4M3::from_f32(p * FP8_E4M3_MAX).to_f32() / FP8_E4M3_MAX,
        }
    }

    fn round_accumulator(&self, x: f32) -> f32 {
        match self.precision {
            PvPrecision::F16 => half::f16::from_f32(x).to_f32(),
            // FP8 MMA accumulates in fp22: 13 mantissa bits survive.
            PvPrecision::F8 => f32::from_bits(x.to_bits() & !0x3FF),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(accumulator: AccumulatorMode, precision: PvPrecision) -> RowParams {
        RowParams {
            accumulator,
            precision,
            flush_every: 2,
            scale_log2: 1.0,
        }
    }

    #[test]
    fn uniform_scores_average_the_values() {
        let scores = [0.0f32; 4];
        let mut out = [0f32; 1];
        let lse = params(AccumulatorMode::Wide, PvPrecision::F16)
            .attend(&scores, &mut out, |j, _| j as f32);
        assert!((out[0] - 1.5).abs() < 1e-6);
        assert!((lse - 2.0).abs() < 1e-6);
    }

    #[test]
    fn masked_keys_do_not_contribute() {
        let scores = [0.0, f32::NEG_INFINITY, f32::NEG_INFINITY];
        let mut out = [0f32; 2];
        let lse = params(AccumulatorMode::Hybrid, PvPrecision::F8)
            .attend(&scores, &mut out, |j, d| (j * 10 + d) as f32);
        assert_eq!(out, [0.0, 1.0]);
        assert_eq!(lse, 0.0);
    }

    #[test]
    fn fully_masked_row_is_zero() {
        let scores = [f32::NEG_INFINITY; 3];
        let mut out = [7f32; 2];
        let lse = params(AccumulatorMode::Narrow, PvPrecision::F16)
            .attend(&scores, &mut out, |_, _| 1.0);
        assert_eq!(out, [0.0, 0.0]);
        assert_eq!(lse, f32::NEG_INFINITY);
    }

    #[test]
    fn accumulator_modes_agree_on_small_rows() {
        let scores = [0.3f32, -1.2, 0.8, 0.1, -0.4];
        let value = |j: usize, d: usize| ((j + 1) as f32 * 0.37 - d as f32 * 0.11).sin();
        let mut reference = [0f32; 3];
        params(AccumulatorMode::Wide, PvPrecision::F16).attend(&scores, &mut reference, value);
        for mode in [AccumulatorMode::Narrow, AccumulatorMode::Hybrid] {
            for precision in [PvPrecision::F16, PvPrecision::F8] {
                let mut out = [0f32; 3];
                params(mode, precision).attend(&scores, &mut out, value);
                for (a, b) in out.iter().zip(&reference) {
                    assert!((a - b).abs() < 1e-1, "{mode:?}/{precision:?}: {a} vs {b}");
                }
            }
        }
    }

    #[test]
    fn integer_logits_apply_both_scales() {
        let q = [2i8, -3, 1];
        let k = [4i8, 1, -5];
        // dot = 8 - 3 - 5 = 0
        assert_eq!(logit(&q, &k, 0.5, 0.25, 2.0), 0.0);
        let k = [4i8, 1, 5];
        // dot = 8 - 3 + 5 = 10
        assert!((logit(&q, &k, 0.5, 0.25, 2.0) - 2.5).abs() < 1e-6);
    }
}
