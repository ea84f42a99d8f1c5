//! Full-precision attention with the same contract as the quantized path.
//!
//! Clarity over speed; used to measure the error of the quantized kernels.

pub mod exact;

pub use exact::ExactAttention;
