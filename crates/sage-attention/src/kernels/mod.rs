//! Kernel families, entry-point selection and the launch contract.

#[cfg(feature = "emulated")]
pub mod emulated;
pub mod launch;
pub mod selector;

#[cfg(feature = "emulated")]
pub use emulated::EmulatedKernel;
pub use launch::{FusedAttentionKernel, KernelLaunch, QkOperand, ValueOperand, VarlenLaunch};
pub use selector::{
    select_kernel, select_varlen_kernel, KernelEntry, KernelFamily, KernelSelection, PvPrecision,
};
