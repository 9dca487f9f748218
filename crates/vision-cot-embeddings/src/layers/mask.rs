//! Attention masks.

use candle_core::{Device, Tensor};

/// Causal mask for `q_len` new positions following `past_len` cached ones.
///
/// Shape `[1, 1, q_len, past_len + q_len]`; 0 where attention is allowed,
/// `-inf` where query `i` would see a key beyond position `past_len + i`.
pub fn causal_mask(q_len: usize, past_len: usize, device: &Device) -> candle_core::Result<Tensor> {
    let kv_len = past_len + q_len;
    let mask: Vec<f32> = (0..q_len)
        .flat_map(|i| {
            (0..kv_len).map(move |j| {
                if j > past_len + i {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    Tensor::from_slice(&mask, (1, 1, q_len, kv_len), device)
}
