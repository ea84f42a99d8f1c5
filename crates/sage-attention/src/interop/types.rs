//! Shape descriptors shared between validation, quantization and dispatch.

use candle_core::DType;

/// Logical description of one attention problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionShape {
    /// Batch size (1 for packed variable-length inputs).
    pub batch: usize,
    /// Query heads.
    pub q_heads: usize,
    /// Key/value heads; divides `q_heads`.
    pub kv_heads: usize,
    /// Query length, or total packed query tokens.
    pub q_len: usize,
    /// Key/value length, or total packed key tokens.
    pub kv_len: usize,
    /// Unpadded per-head dimension.
    pub head_dim: usize,
}

impl AttentionShape {
    /// Query heads sharing one key/value head.
    pub fn group_size(&self) -> usize {
        self.q_heads / self.kv_heads
    }

    /// Key/value head serving query head `h`.
    #[inline]
    pub fn kv_head(&self, h: usize) -> usize {
        h / self.group_size()
    }
}

/// Element types accepted by the quantized path.
pub const HALF_DTYPES: &[DType] = &[DType::F16, DType::BF16];

/// Element types accepted by the full-precision reference.
pub const REFERENCE_DTYPES: &[DType] = &[DType::F32, DType::F16, DType::BF16];
