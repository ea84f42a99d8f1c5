//! Causal masking shared by the reference path and the kernels.
//!
//! When `kv_len > q_len` the queries are the most recent `q_len` positions, so
//! query `i` sees keys `0..=i + (kv_len - q_len)`. When `kv_len <= q_len` the
//! offset is zero and query `i` sees keys `0..=i`.

use candle_core::{Device, Result, Tensor};

/// Exclusive upper bound of the keys visible to query `i`.
#[inline]
pub fn causal_key_limit(i: usize, q_len: usize, kv_len: usize) -> usize {
    (i + kv_len.saturating_sub(q_len) + 1).min(kv_len)
}

/// Additive `[1, 1, q_len, kv_len]` mask, broadcastable over batch and heads.
///
/// Entries are `0.0` where attention is permitted and `f32::NEG_INFINITY`
/// otherwise.
pub fn build_causal_mask(device: &Device, q_len: usize, kv_len: usize) -> Result<Tensor> {
    let mut data = vec![0f32; q_len * kv_len];
    for (i, row) in data.chunks_mut(kv_len.max(1)).take(q_len).enumerate() {
        let limit = causal_key_limit(i, q_len, kv_len);
        row[limit..].fill(f32::NEG_INFINITY);
    }
    Tensor::from_vec(data, (1, 1, q_len, kv_len), device)
}
