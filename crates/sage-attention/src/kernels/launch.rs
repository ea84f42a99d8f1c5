//! Launch contract between the dispatcher and a fused kernel family.
//!
//! The dispatcher hands a kernel fully prepared operands: INT8 Q/K with the
//! scale tables and the [`GroupPlan`] they were built with, V in the family's
//! P·V precision, a pre-allocated output buffer in Q's layout, and the softmax
//! scale. Kernels report the raw base-2 log-sum-exp of every row; the
//! dispatcher converts it.

use crate::core::errors::Result;
use crate::device::tier::TileShape;
use crate::interop::AttentionShape;
use crate::kernels::selector::KernelEntry;
use crate::layout::HostView;
use crate::quant::{ChannelMean, CuSeqlens, Fp8E4M3, GroupPlan, QuantizedTensor, ScaleTensor, VarlenInt8};

/// Quantized Q or K as the kernel sees it.
#[derive(Debug, Clone, Copy)]
pub struct QkOperand<'a> {
    pub values: &'a QuantizedTensor<i8>,
    /// `[batch, heads, groups]`, indexed through `plan`.
    pub scales: &'a ScaleTensor,
    pub plan: GroupPlan,
}

impl QkOperand<'_> {
    #[inline]
    pub fn scale(&self, b: usize, h: usize, pos: usize) -> f32 {
        self.scales.per_head(b, h, self.plan.group_of(pos))
    }
}

/// V in the precision the family multiplies P with.
#[derive(Debug, Clone, Copy)]
pub enum ValueOperand<'a> {
    /// Half-precision values (already centered when the entry fuses a mean).
    Half(&'a HostView),
    /// FP8 values with `[batch, kv_heads, head_dim]` scales.
    Fp8 {
        values: &'a QuantizedTensor<Fp8E4M3>,
        scales: &'a ScaleTensor,
    },
}

/// Arguments of one fixed-length launch.
#[derive(Debug, Clone, Copy)]
pub struct KernelLaunch<'a> {
    pub entry: KernelEntry,
    /// Problem shape with the padded head dimension.
    pub shape: AttentionShape,
    pub tiles: TileShape,
    pub q: QkOperand<'a>,
    pub k: QkOperand<'a>,
    pub v: ValueOperand<'a>,
    /// Per-channel V mean the epilogue adds back.
    pub v_mean: Option<&'a ChannelMean>,
    pub causal: bool,
    pub sm_scale: f32,
    pub return_lse: bool,
}

/// Arguments of one variable-length launch over packed sequences.
#[derive(Debug, Clone, Copy)]
pub struct VarlenLaunch<'a> {
    pub entry: KernelEntry,
    /// Packed shape: batch 1, lengths are total token counts.
    pub shape: AttentionShape,
    pub q: &'a VarlenInt8,
    pub k: &'a VarlenInt8,
    /// Packed half-precision V.
    pub v: &'a HostView,
    pub cu_seqlens_q: &'a CuSeqlens,
    pub cu_seqlens_k: &'a CuSeqlens,
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
    pub causal: bool,
    pub sm_scale: f32,
}

/// A kernel family able to run the entry points of its profile.
pub trait FusedAttentionKernel: Send + Sync {
    fn name(&self) -> &str;

    /// Run a fixed-length entry. `output` has Q's layout and padded head
    /// dimension; returns the raw `[batch, heads, q_len]` base-2 LSE when
    /// `return_lse` is set.
    fn launch(&self, launch: &KernelLaunch<'_>, output: &mut [f32]) -> Result<Option<Vec<f32>>>;

    /// Run a variable-length entry. `output` is packed `[total_q, heads,
    /// head_dim]`.
    fn launch_varlen(&self, launch: &VarlenLaunch<'_>, output: &mut [f32]) -> Result<()>;
}
