//! Containers for quantized operands and their scales.

use crate::core::config::TensorLayout;
use crate::core::errors::{AttentionError, Result};

/// Quantized elements laid out like the source operand.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedTensor<E> {
    data: Vec<E>,
    /// Logical `[batch, heads, seq, head_dim]`.
    dims: [usize; 4],
    layout: TensorLayout,
}

impl<E: Copy> QuantizedTensor<E> {
    pub(crate) fn new(data: Vec<E>, dims: [usize; 4], layout: TensorLayout) -> Self {
        debug_assert_eq!(data.len(), dims.iter().product::<usize>());
        Self { data, dims, layout }
    }

    pub fn data(&self) -> &[E] {
        &self.data
    }

    pub fn dims(&self) -> [usize; 4] {
        self.dims
    }

    pub fn layout(&self) -> TensorLayout {
        self.layout
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

    #[inline]
    pub fn offset(&self, b: usize, h: usize, s: usize, d: usize) -> usize {
        self.layout
            .offset((self.dims[1], self.dims[2], self.dims[3]), b, h, s, d)
    }

    #[inline]
    pub fn get(&self, b: usize, h: usize, s: usize, d: usize) -> E {
        self.data[self.offset(b, h, s, d)]
    }

    /// Contiguous head_dim row at `(b, h, s)`.
    #[inline]
    pub fn row(&self, b: usize, h: usize, s: usize) -> &[E] {
        let start = self.offset(b, h, s, 0);
        &self.data[start..start + self.dims[3]]
    }
}

/// Dense `f32` scales with an explicit shape.
///
/// Fixed-length Q/K scales are `[batch, heads, groups]`, V scales are
/// `[batch, kv_heads, head_dim]`, and variable-length Q/K scales are
/// `[total_groups, heads]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleTensor {
    values: Vec<f32>,
    shape: Vec<usize>,
}

impl ScaleTensor {
    pub fn new(values: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if values.len() != expected {
            return Err(AttentionError::InvalidShape {
                context: format!("{} scales for shape {shape:?}", values.len()),
            });
        }
        Ok(Self {
            values,
            shape: shape.to_vec(),
        })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Scale of group `group` in `(b, h)` of a `[batch, heads, groups]` table.
    #[inline]
    pub fn per_head(&self, b: usize, h: usize, group: usize) -> f32 {
        let heads = self.shape[1];
        let groups = self.shape[2];
        self.values[(b * heads + h) * groups + group]
    }
}
