//! Types shared by the quantized path and the full-precision reference.

pub mod types;

pub use types::{AttentionShape, HALF_DTYPES, REFERENCE_DTYPES};
