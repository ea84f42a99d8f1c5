//! Full-precision attention used as the accuracy baseline.
//!
//! The exact path mirrors the semantics of the [`Attention`] trait with every
//! reduction in `f32`: same layouts, grouped-query heads, causal alignment,
//! default softmax scale and natural-log LSE as the quantized path.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::softmax_last_dim;

use crate::core::config::TensorLayout;
use crate::core::{Attention, AttentionOutput, Config, Result};
use crate::interop::REFERENCE_DTYPES;
use crate::layout::validate_inputs;
use crate::masks::build_causal_mask;

/// Numerically stable, portable attention in `f32`.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Attention for ExactAttention {
    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor, config: &Config) -> Result<AttentionOutput> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "sage_attention::reference init layout={} causal={} return_lse={}",
                config.layout,
                config.causal,
                config.return_lse
            );
        }

        let layout = config.layout;
        let shape = validate_inputs(q, k, v, layout, REFERENCE_DTYPES)?;
        let dtype = q.dtype();
        let group = shape.group_size();

        let q_work = to_hnd_f32(q, layout)?;
        let k_work = repeat_kv(&to_hnd_f32(k, layout)?, group)?;
        let v_work = repeat_kv(&to_hnd_f32(v, layout)?, group)?;

        let (batch, heads, q_len, kv_len, head_dim) = (
            shape.batch,
            shape.q_heads,
            shape.q_len,
            shape.kv_len,
            shape.head_dim,
        );
        let merged = batch * heads;
        let scale = config
            .softmax_scale
            .unwrap_or_else(|| 1.0 / (head_dim as f32).sqrt());

        let q_view = q_work.reshape((merged, q_len, head_dim))?;
        let k_t = k_work.reshape((merged, kv_len, head_dim))?.transpose(1, 2)?;
        let mut scores = q_view
            .matmul(&k_t)?
            .affine(scale as f64, 0.0)?
            .reshape((batch, heads, q_len, kv_len))?;
        if config.causal {
            let mask = build_causal_mask(q.device(), q_len, kv_len)?;
            scores = scores.broadcast_add(&mask)?;
        }

        let lse = if config.return_lse {
            let max = scores.max_keepdim(3)?;
            let lse = scores
                .broadcast_sub(&max)?
                .exp()?
                .sum_keepdim(3)?
                .log()?
                .add(&max)?
                .squeeze(3)?;
            Some(lse)
        } else {
            None
        };

        let probs = softmax_last_dim(&scores.reshape((merged, q_len, kv_len))?)?;
        let v_view = v_work.reshape((merged, kv_len, head_dim))?;
        let output = probs
            .matmul(&v_view)?
            .reshape((batch, heads, q_len, head_dim))?;
        let output = match layout {
            TensorLayout::Hnd => output,
            TensorLayout::Nhd => output.transpose(1, 2)?.contiguous()?,
        };

        Ok(AttentionOutput {
            output: output.to_dtype(dtype)?,
            lse,
        })
    }
}

fn to_hnd_f32(t: &Tensor, layout: TensorLayout) -> Result<Tensor> {
    let t = t.to_dtype(DType::F32)?;
    Ok(match layout {
        TensorLayout::Hnd => t.contiguous()?,
        TensorLayout::Nhd => t.transpose(1, 2)?.contiguous()?,
    })
}

/// Expand `[b, kv_heads, s, d]` so each KV head serves `group` query heads.
fn repeat_kv(t: &Tensor, group: usize) -> Result<Tensor> {
    if group == 1 {
        return Ok(t.clone());
    }
    let (b, kv_heads, s, d) = t.dims4()?;
    Ok(t.unsqueeze(2)?
        .broadcast_as((b, kv_heads, group, s, d))?
        .reshape((b, kv_heads * group, s, d))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AttentionError;
    use crate::masks::causal_key_limit;
    use candle_core::{Device, Result as CandleResult};

    fn build_inputs(device: &Device) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let data: Vec<f32> = (0..64).map(|i| ((i as f32) * 0.37).sin()).collect();
        let q = Tensor::from_vec(data.clone(), (1, 2, 4, 8), device)?;
        let k = Tensor::from_vec(data.iter().map(|x| x * 0.5).collect::<Vec<_>>(), (1, 2, 4, 8), device)?;
        let v = Tensor::from_vec(data, (1, 2, 4, 8), device)?;
        Ok((q, k, v))
    }

    /// Scalar attention with GQA, causal alignment and base-e LSE.
    fn naive_attention(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        causal: bool,
    ) -> CandleResult<(Vec<f32>, Vec<f32>)> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let (_, kv_heads, k_len, _) = k.dims4()?;
        let group = heads / kv_heads;
        let q_vec = q.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let scale = 1.0 / (head_dim as f32).sqrt();
        let mut output = vec![0f32; batch * heads * q_len * head_dim];
        let mut lse = vec![0f32; batch * heads * q_len];

        for b in 0..batch {
            for h in 0..heads {
                let kvh = h / group;
                for i in 0..q_len {
                    let limit = if causal {
                        causal_key_limit(i, q_len, k_len)
                    } else {
                        k_len
                    };
                    let row: Vec<f32> = (0..limit)
                        .map(|j| {
                            (0..head_dim)
                                .map(|d| {
                                    q_vec[((b * heads + h) * q_len + i) * head_dim + d]
                                        * k_vec[((b * kv_heads + kvh) * k_len + j) * head_dim + d]
                                })
                                .sum::<f32>()
                                * scale
                        })
                        .collect();
                    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let denom: f32 = row.iter().map(|s| (s - max).exp()).sum();
                    lse[(b * heads + h) * q_len + i] = max + denom.ln();
                    for d in 0..head_dim {
                        let acc: f32 = row
                            .iter()
                            .enumerate()
                            .map(|(j, s)| {
                                (s - max).exp() / denom
                                    * v_vec[((b * kv_heads + kvh) * k_len + j) * head_dim + d]
                            })
                            .sum();
                        output[((b * heads + h) * q_len + i) * head_dim + d] = acc;
                    }
                }
            }
        }
        Ok((output, lse))
    }

    fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f32::max)
    }

    #[test]
    fn exact_attention_matches_naive() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        for causal in [false, true] {
            let config = Config {
                causal,
                return_lse: true,
                ..Config::default()
            };
            let out = ExactAttention::default().attend(&q, &k, &v, &config)?;
            let (expected, expected_lse) = naive_attention(&q, &k, &v, causal)?;
            let output = out.output.flatten_all()?.to_vec1::<f32>()?;
            assert!(max_abs_diff(&output, &expected) < 1e-5);
            let lse = out.lse.expect("lse requested").flatten_all()?.to_vec1::<f32>()?;
            assert!(max_abs_diff(&lse, &expected_lse) < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn grouped_query_heads_share_kv() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let data: Vec<f32> = (0..4 * 3 * 8).map(|i| ((i as f32) * 0.11).cos()).collect();
        let q = Tensor::from_vec(data.clone(), (1, 4, 3, 8), &device)?;
        let k = Tensor::from_vec(data[..2 * 3 * 8].to_vec(), (1, 2, 3, 8), &device)?;
        let v = k.affine(2.0, 0.1)?;
        let out = ExactAttention::default().attend(&q, &k, &v, &Config::default())?;
        let (expected, _) = naive_attention(&q, &k, &v, false)?;
        let output = out.output.flatten_all()?.to_vec1::<f32>()?;
        assert!(max_abs_diff(&output, &expected) < 1e-5);
        Ok(())
    }

    #[test]
    fn nhd_layout_matches_hnd() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let hnd = ExactAttention::default().attend(&q, &k, &v, &Config::default())?;
        let to_nhd = |t: &Tensor| t.transpose(1, 2).and_then(|t| t.contiguous());
        let config = Config {
            layout: TensorLayout::Nhd,
            ..Config::default()
        };
        let nhd = ExactAttention::default().attend(&to_nhd(&q)?, &to_nhd(&k)?, &to_nhd(&v)?, &config)?;
        let back = nhd.output.transpose(1, 2)?.contiguous()?;
        let a = hnd.output.flatten_all()?.to_vec1::<f32>()?;
        let b = back.flatten_all()?.to_vec1::<f32>()?;
        assert!(max_abs_diff(&a, &b) < 1e-6);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 2, 5, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let err = ExactAttention::default()
            .attend(&q, &k, &v, &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn dtype_matrix() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let reference = ExactAttention::default()
            .attend(&q, &k, &v, &Config::default())?
            .output;
        for dtype in [DType::F32, DType::BF16, DType::F16] {
            let out = ExactAttention::default()
                .attend(
                    &q.to_dtype(dtype)?,
                    &k.to_dtype(dtype)?,
                    &v.to_dtype(dtype)?,
                    &Config::default(),
                )?
                .output;
            assert_eq!(out.dtype(), dtype);
            let diff = out.to_dtype(DType::F32)?.sub(&reference)?.abs()?;
            let max = diff.max_all()?.to_vec0::<f32>()?;
            assert!(max < 5e-2, "dtype {dtype:?} diverged by {max}");
        }
        Ok(())
    }

    #[test]
    fn numerical_stability() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let q = Tensor::full(10_000.0f32, (1, 1, 4, 4), &device)?;
        let k = Tensor::full(-10_000.0f32, (1, 1, 4, 4), &device)?;
        let v = Tensor::ones((1, 1, 4, 4), DType::F32, &device)?;
        let config = Config {
            return_lse: true,
            ..Config::default()
        };
        let out = ExactAttention::default().attend(&q, &k, &v, &config)?;
        let values = out.output.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|value| value.is_finite()));
        let lse = out.lse.expect("lse requested").flatten_all()?.to_vec1::<f32>()?;
        assert!(lse.iter().all(|value| value.is_finite()));
        Ok(())
    }
}
