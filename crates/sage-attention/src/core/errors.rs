//! Error types emitted by the quantized attention pipeline.
//!
//! Variants fall into two caller-visible classes: configuration errors (the
//! caller asked for something this layer cannot do) and environment errors
//! (the kernel family needed for the request is not available in this build).
//! Both are raised before any quantization work starts.

use thiserror::Error;

use crate::core::config::{AccumulatorMode, Granularity};
use crate::device::HardwareTier;
use crate::kernels::KernelFamily;

pub type Result<T> = std::result::Result<T, AttentionError>;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },

    /// Q, K and V must be `f16` or `bf16` and share one dtype.
    #[error("unsupported dtype: {requested}")]
    UnsupportedDType { requested: String },

    /// Head dimensions above 128 have no kernel.
    #[error("unsupported head_dim {head_dim}: must be at most 128")]
    UnsupportedHeadDim { head_dim: usize },

    /// The innermost (head_dim) axis of an input is strided.
    #[error("last dim of {tensor} must be contiguous (stride {stride})")]
    NonContiguous { tensor: &'static str, stride: usize },

    /// Q, K and V live on different devices.
    #[error("q, k, v must reside on the same device")]
    DeviceMismatch,

    /// The device maps to no known hardware tier.
    #[error("unsupported hardware tier: {detail}")]
    UnsupportedTier { detail: String },

    /// The requested granularity / accumulator combination is not eligible on
    /// the active tier.
    #[error(
        "invalid combination on {tier}: granularity={granularity} accumulator={accumulator} ({reason})"
    )]
    InvalidCombination {
        tier: HardwareTier,
        granularity: Granularity,
        accumulator: AccumulatorMode,
        reason: String,
    },

    /// Feature not offered on the active tier (e.g. variable-length on sm120).
    #[error("{feature} is not supported on {tier}")]
    UnsupportedFeature {
        tier: HardwareTier,
        feature: &'static str,
    },

    /// Cumulative sequence-length tables are malformed.
    #[error("invalid cu_seqlens: {context}")]
    InvalidSeqlens { context: String },

    /// The kernel family required by the tier was not built or registered.
    #[error("kernel family {family} is not available in this build")]
    KernelUnavailable { family: KernelFamily },

    /// A backend-specific failure propagated to the caller.
    #[error("backend error: {message}")]
    Backend { message: String },
}

impl AttentionError {
    /// Caller logic errors: shape, dtype, layout, tier or combination problems.
    pub fn is_configuration(&self) -> bool {
        !matches!(
            self,
            AttentionError::KernelUnavailable { .. } | AttentionError::Backend { .. }
        )
    }

    /// Build/environment issues, distinct from caller mistakes.
    pub fn is_environment(&self) -> bool {
        matches!(self, AttentionError::KernelUnavailable { .. })
    }
}

impl From<candle_core::Error> for AttentionError {
    fn from(err: candle_core::Error) -> Self {
        AttentionError::Backend {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_separates_environment_from_configuration() {
        let unavailable = AttentionError::KernelUnavailable {
            family: KernelFamily::Sm90,
        };
        assert!(unavailable.is_environment());
        assert!(!unavailable.is_configuration());

        let head_dim = AttentionError::UnsupportedHeadDim { head_dim: 200 };
        assert!(head_dim.is_configuration());
        assert!(!head_dim.is_environment());
        assert!(head_dim.to_string().contains("200"));
    }

    #[test]
    fn combination_message_names_every_part() {
        let err = AttentionError::InvalidCombination {
            tier: HardwareTier::Sm86,
            granularity: Granularity::PerThread,
            accumulator: AccumulatorMode::Wide,
            reason: "granularity not eligible".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("sm86"));
        assert!(message.contains("per_thread"));
        assert!(message.contains("wide"));
    }
}
