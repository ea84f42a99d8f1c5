//! Core traits and types shared across attention implementations.
//!
//! Implementations take Q, K and V in the layout named by
//! [`Config::layout`](config::Config::layout) (`HND` or `NHD`), with K and V
//! possibly carrying fewer heads than Q (grouped-query attention). The output
//! mirrors Q's shape, layout and dtype.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::{AccumulatorMode, Config, Granularity, TensorLayout, VarlenConfig};
pub use errors::{AttentionError, Result};

/// Attention output plus the optional per-row log-sum-exp.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// Same shape, layout and dtype as Q.
    pub output: Tensor,
    /// Natural-log LSE, `[batch, q_heads, q_len]` in `f32`, when requested.
    pub lse: Option<Tensor>,
}

/// Unified interface for attention implementations.
///
/// * `q` is `[batch, q_heads, q_len, head_dim]` (HND) or
///   `[batch, q_len, q_heads, head_dim]` (NHD); `k` and `v` match with
///   `kv_heads` dividing `q_heads`.
/// * With `causal`, query `i` sees keys `j <= i + (kv_len - q_len)`.
/// * The softmax scale defaults to `1/sqrt(head_dim)`.
pub trait Attention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        config: &Config,
    ) -> Result<AttentionOutput>;
}
