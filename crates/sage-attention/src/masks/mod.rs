//! Mask utilities shared by attention implementations.
//!
//! Masks produced here are additive `f32` tensors holding `0.0` (keep) or
//! `f32::NEG_INFINITY` (discard), matching Candle's softmax-friendly masking.

pub mod causal;

use candle_core::DType;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use causal::{build_causal_mask, causal_key_limit};
