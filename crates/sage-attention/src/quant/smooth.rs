//! Per-channel means used to smooth K and V before quantization.
//!
//! Subtracting the K mean shifts every score in a row by the same amount, so
//! softmax is unchanged; only the LSE needs the shift added back. The V mean is
//! added back by the kernel epilogue.

use candle_core::{Device, Tensor};
use rayon::prelude::*;

use crate::core::errors::Result;
use crate::layout::HostView;

/// Mean over the sequence axis for every `(batch, head, channel)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMean {
    values: Vec<f32>,
    batch: usize,
    heads: usize,
    dim: usize,
}

impl ChannelMean {
    /// Mean of `view` over its sequence axis, accumulated in `f32`.
    ///
    /// A packed variable-length view has batch 1, so this yields one mean
    /// shared by every sequence in the pack.
    pub fn over_sequence(view: &HostView) -> Self {
        let [batch, heads, seq, dim] = view.dims();
        let mut values = vec![0f32; batch * heads * dim];
        if dim > 0 {
            values
                .par_chunks_mut(dim)
                .enumerate()
                .for_each(|(bh, row)| {
                    let (b, h) = (bh / heads, bh % heads);
                    for s in 0..seq {
                        for (d, acc) in row.iter_mut().enumerate() {
                            *acc += view.get(b, h, s, d);
                        }
                    }
                    if seq > 0 {
                        row.iter_mut().for_each(|acc| *acc /= seq as f32);
                    }
                });
        }
        Self {
            values,
            batch,
            heads,
            dim,
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    /// Channel means of head `(b, h)`.
    #[inline]
    pub fn row(&self, b: usize, h: usize) -> &[f32] {
        let start = (b * self.heads + h) * self.dim;
        &self.values[start..start + self.dim]
    }

    /// Subtract the mean from every position of `view`.
    pub fn center(&self, mut view: HostView) -> HostView {
        let [batch, heads, seq, dim] = view.dims();
        let layout = view.layout();
        let data = view.data_mut();
        for b in 0..batch {
            for h in 0..heads {
                let mean = self.row(b, h);
                for s in 0..seq {
                    let start = layout.offset((heads, seq, dim), b, h, s, 0);
                    data[start..start + dim]
                        .iter_mut()
                        .zip(mean)
                        .for_each(|(x, m)| *x -= m);
                }
            }
        }
        view
    }

    /// `[batch, heads, 1, head_dim]` tensor in `f32`.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(
            &self.values,
            (self.batch, self.heads, 1, self.dim),
            device,
        )?)
    }
}
