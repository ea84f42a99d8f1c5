//! Quantized attention with INT8 `Q·Kᵀ` and half or FP8 `P·V`.
//!
//! The crate takes Q, K and V in `f16` or `bf16`, in either `HND`
//! (`[batch, heads, seq, head_dim]`) or `NHD` (`[batch, seq, heads,
//! head_dim]`) layout, and:
//!
//! 1. validates the call and picks a kernel entry for the active hardware
//!    tier ([`device`], [`kernels::select_kernel`]),
//! 2. optionally centers K on its per-channel mean and quantizes Q and K to
//!    INT8 at block, warp or thread granularity ([`quant`]),
//! 3. prepares V in the family's `P·V` precision, rounding to `f16` or
//!    quantizing per channel to FP8 E4M3,
//! 4. launches the fused kernel and corrects its raw base-2 LSE back to the
//!    natural log of the unsmoothed problem ([`correct`]).
//!
//! Packed variable-length batches go through
//! [`SageAttention::attend_varlen`]. [`ExactAttention`] computes the same
//! contract in full precision and serves as the accuracy baseline.
//!
//! With the default `emulated` feature every kernel family is served by a
//! host-side emulation that reproduces the device numerics.

pub mod core;
pub mod correct;
pub mod device;
pub mod dispatch;
pub mod interop;
pub mod kernels;
pub mod layout;
pub mod masks;
pub mod quant;
pub mod reference;

pub use crate::core::{
    AccumulatorMode, Attention, AttentionError, AttentionOutput, Config, Granularity, TensorLayout,
    VarlenConfig,
};
pub use device::{Capabilities, HardwareTier};
pub use dispatch::{attention, attention_varlen, SageAttention};
pub use reference::ExactAttention;
