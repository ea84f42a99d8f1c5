//! Validation and head-dim padding for attention inputs.

use candle_core::{DType, Tensor};

use crate::core::config::TensorLayout;
use crate::core::errors::{AttentionError, Result};
use crate::interop::AttentionShape;

/// Largest head dimension any kernel handles.
pub const MAX_HEAD_DIM: usize = 128;

/// Kernel head dimension for `head_dim`: 64 or 128.
pub fn padded_head_dim(head_dim: usize) -> Result<usize> {
    match head_dim {
        0 => Err(AttentionError::InvalidShape {
            context: "head_dim must be non-zero".to_string(),
        }),
        1..=64 => Ok(64),
        65..=MAX_HEAD_DIM => Ok(MAX_HEAD_DIM),
        _ => Err(AttentionError::UnsupportedHeadDim { head_dim }),
    }
}

/// Zero-pad the last axis of `tensor` to `target`. Returns the input
/// untouched when it already has that size.
pub fn pad_head_dim(tensor: &Tensor, target: usize) -> Result<Tensor> {
    let axis = tensor.rank() - 1;
    let current = tensor.dim(axis)?;
    if current == target {
        return Ok(tensor.clone());
    }
    Ok(tensor.pad_with_zeros(axis, 0, target - current)?)
}

/// Drop padded channels from the last axis of `tensor`.
pub fn trim_head_dim(tensor: &Tensor, original: usize) -> Result<Tensor> {
    let axis = tensor.rank() - 1;
    if tensor.dim(axis)? == original {
        return Ok(tensor.clone());
    }
    Ok(tensor.narrow(axis, 0, original)?)
}

/// Check Q, K and V for a fixed-length call and return the logical problem
/// shape. `dtypes` lists the element types the caller accepts.
pub fn validate_inputs(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    layout: TensorLayout,
    dtypes: &[DType],
) -> Result<AttentionShape> {
    check_common(q, k, v, dtypes)?;

    let dims4 = |t: &Tensor, name: &str| {
        t.dims4().map_err(|_| AttentionError::InvalidShape {
            context: format!("{name} must be rank 4 ({layout}), got {:?}", t.dims()),
        })
    };
    let (batch, q_heads, q_len, head_dim) = layout.logical_dims(dims4(q, "q")?);
    let (kb, kv_heads, kv_len, kd) = layout.logical_dims(dims4(k, "k")?);
    let v_dims = layout.logical_dims(dims4(v, "v")?);

    if kb != batch || kd != head_dim {
        return Err(AttentionError::InvalidShape {
            context: format!(
                "k shape mismatch: expected batch {batch} and head_dim {head_dim}, got {:?}",
                k.dims()
            ),
        });
    }
    if v_dims != (kb, kv_heads, kv_len, kd) {
        return Err(AttentionError::InvalidShape {
            context: format!(
                "v shape {:?} must match k shape {:?}",
                v.dims(),
                k.dims()
            ),
        });
    }
    if kv_len == 0 {
        return Err(AttentionError::InvalidShape {
            context: "kv_len must be non-zero".to_string(),
        });
    }

    let shape = AttentionShape {
        batch,
        q_heads,
        kv_heads,
        q_len,
        kv_len,
        head_dim,
    };
    check_heads(&shape)?;
    padded_head_dim(head_dim)?;
    Ok(shape)
}

/// Check packed `[total, heads, head_dim]` inputs for a variable-length call.
///
/// The returned shape has batch 1 and the packed token counts as lengths.
pub fn validate_packed(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    dtypes: &[DType],
) -> Result<AttentionShape> {
    check_common(q, k, v, dtypes)?;

    let dims3 = |t: &Tensor, name: &str| {
        t.dims3().map_err(|_| AttentionError::InvalidShape {
            context: format!(
                "{name} must be packed [total, heads, head_dim], got {:?}",
                t.dims()
            ),
        })
    };
    let (total_q, q_heads, head_dim) = dims3(q, "q")?;
    let (total_kv, kv_heads, kd) = dims3(k, "k")?;
    if kd != head_dim {
        return Err(AttentionError::InvalidShape {
            context: format!("k head_dim {kd} does not match q head_dim {head_dim}"),
        });
    }
    if dims3(v, "v")? != (total_kv, kv_heads, kd) {
        return Err(AttentionError::InvalidShape {
            context: format!(
                "v shape {:?} must match k shape {:?}",
                v.dims(),
                k.dims()
            ),
        });
    }

    let shape = AttentionShape {
        batch: 1,
        q_heads,
        kv_heads,
        q_len: total_q,
        kv_len: total_kv,
        head_dim,
    };
    check_heads(&shape)?;
    padded_head_dim(head_dim)?;
    Ok(shape)
}

fn check_common(q: &Tensor, k: &Tensor, v: &Tensor, dtypes: &[DType]) -> Result<()> {
    let device = q.device();
    if !device.same_device(k.device()) || !device.same_device(v.device()) {
        return Err(AttentionError::DeviceMismatch);
    }

    let dtype = q.dtype();
    if dtype != k.dtype() || dtype != v.dtype() {
        return Err(AttentionError::UnsupportedDType {
            requested: format!(
                "q, k, v must share one dtype, got {:?}/{:?}/{:?}",
                dtype,
                k.dtype(),
                v.dtype()
            ),
        });
    }
    if !dtypes.contains(&dtype) {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("{dtype:?}, expected one of {dtypes:?}"),
        });
    }

    for (name, tensor) in [("q", q), ("k", k), ("v", v)] {
        let rank = tensor.rank();
        if rank == 0 {
            return Err(AttentionError::InvalidShape {
                context: format!("{name} must not be a scalar"),
            });
        }
        let stride = tensor.stride()[rank - 1];
        if stride != 1 && tensor.dims()[rank - 1] > 1 {
            return Err(AttentionError::NonContiguous {
                tensor: name,
                stride,
            });
        }
    }
    Ok(())
}

fn check_heads(shape: &AttentionShape) -> Result<()> {
    if shape.kv_heads == 0 || shape.q_heads % shape.kv_heads != 0 {
        return Err(AttentionError::InvalidShape {
            context: format!(
                "q heads ({}) must be a multiple of kv heads ({})",
                shape.q_heads, shape.kv_heads
            ),
        });
    }
    Ok(())
}
