//! Host-side views of attention operands.
//!
//! A [`HostView`] holds the elements of one 4D operand as `f32` in its
//! physical layout, with the head_dim axis always innermost. Quantizers and
//! the emulated kernels address it through logical `(b, h, s, d)` indices so
//! HND and NHD inputs share one code path.

use candle_core::{DType, Tensor};

use crate::core::config::TensorLayout;
use crate::core::errors::{AttentionError, Result};

/// Dense `f32` copy of a 4D tensor in `layout` order.
#[derive(Debug, Clone, PartialEq)]
pub struct HostView {
    data: Vec<f32>,
    /// Logical `[batch, heads, seq, head_dim]`.
    dims: [usize; 4],
    layout: TensorLayout,
}

impl HostView {
    /// Copy `tensor` to the host, interpreting its dims through `layout`.
    pub fn from_tensor(tensor: &Tensor, layout: TensorLayout) -> Result<Self> {
        let physical = tensor.dims4().map_err(|_| AttentionError::InvalidShape {
            context: format!("expected a rank-4 tensor, got {:?}", tensor.dims()),
        })?;
        let (b, h, s, d) = layout.logical_dims(physical);
        let data = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        Ok(Self {
            data,
            dims: [b, h, s, d],
            layout,
        })
    }

    /// Wrap a packed `[total, heads, head_dim]` tensor as a batch-1 NHD view.
    pub fn from_packed(tensor: &Tensor) -> Result<Self> {
        let (total, heads, dim) = tensor.dims3().map_err(|_| AttentionError::InvalidShape {
            context: format!(
                "expected packed [total, heads, head_dim], got {:?}",
                tensor.dims()
            ),
        })?;
        let data = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        Ok(Self {
            data,
            dims: [1, heads, total, dim],
            layout: TensorLayout::Nhd,
        })
    }

    pub fn from_vec(data: Vec<f32>, dims: [usize; 4], layout: TensorLayout) -> Result<Self> {
        let expected: usize = dims.iter().product();
        if data.len() != expected {
            return Err(AttentionError::InvalidShape {
                context: format!("buffer of {} elements for dims {dims:?}", data.len()),
            });
        }
        Ok(Self { data, dims, layout })
    }

    pub fn dims(&self) -> [usize; 4] {
        self.dims
    }

    pub fn batch(&self) -> usize {
        self.dims[0]
    }

    pub fn heads(&self) -> usize {
        self.dims[1]
    }

    pub fn seq_len(&self) -> usize {
        self.dims[2]
    }

    pub fn head_dim(&self) -> usize {
        self.dims[3]
    }

    pub fn layout(&self) -> TensorLayout {
        self.layout
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn offset(&self, b: usize, h: usize, s: usize, d: usize) -> usize {
        self.layout
            .offset((self.dims[1], self.dims[2], self.dims[3]), b, h, s, d)
    }

    #[inline]
    pub fn get(&self, b: usize, h: usize, s: usize, d: usize) -> f32 {
        self.data[self.offset(b, h, s, d)]
    }

    /// Round every element through `f16`, matching what a half-precision
    /// operand would hold on the device.
    pub fn round_to_f16(mut self) -> Self {
        for x in &mut self.data {
            *x = half::f16::from_f32(*x).to_f32();
        }
        self
    }
}

/// Unit of parallel work over a contiguous layout buffer.
///
/// For HND every `(batch, head)` slab is contiguous; for NHD only whole batch
/// entries are, so one unit covers all heads of one batch entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ParallelUnit {
    pub layout: TensorLayout,
    pub heads: usize,
    pub seq: usize,
    pub dim: usize,
}

impl ParallelUnit {
    pub fn new(layout: TensorLayout, heads: usize, seq: usize, dim: usize) -> Self {
        Self {
            layout,
            heads,
            seq,
            dim,
        }
    }

    /// Heads covered by one unit.
    pub fn heads_per_unit(&self) -> usize {
        match self.layout {
            TensorLayout::Hnd => 1,
            TensorLayout::Nhd => self.heads,
        }
    }

    /// Elements covered by one unit.
    pub fn elems(&self) -> usize {
        self.heads_per_unit() * self.seq * self.dim
    }

    /// `(batch, head)` of the `local`-th head in unit `unit`.
    pub fn coords(&self, unit: usize, local: usize) -> (usize, usize) {
        match self.layout {
            TensorLayout::Hnd => (unit / self.heads, unit % self.heads),
            TensorLayout::Nhd => (unit, local),
        }
    }

    /// Offset of `(local head, s, d)` inside one unit.
    #[inline]
    pub fn local_offset(&self, local: usize, s: usize, d: usize) -> usize {
        match self.layout {
            TensorLayout::Hnd => s * self.dim + d,
            TensorLayout::Nhd => (s * self.heads + local) * self.dim + d,
        }
    }
}
