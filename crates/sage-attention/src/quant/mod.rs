//! Quantization engine: INT8 for Q/K, FP8 for V, and the group mapping both
//! the quantizers and the kernels index scales through.

pub mod fp8;
pub mod groups;
pub mod int8;
pub mod smooth;
pub mod tensors;
pub mod varlen;

pub use fp8::{quantize_value_fp8, Fp8E4M3, Fp8Value, FP8_E4M3_MAX};
pub use groups::GroupPlan;
pub use int8::{quantize_int8, round_half_away_from_zero, Int8Quantized, SCALE_EPSILON};
pub use smooth::ChannelMean;
pub use tensors::{QuantizedTensor, ScaleTensor};
pub use varlen::{quantize_int8_varlen, CuSeqlens, VarlenInt8};
