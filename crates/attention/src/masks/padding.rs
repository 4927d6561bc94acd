//! Builders for padding masks used to drop padded memory positions.
//!
//! All padding masks share the dtype and layout described in
//! [`super::MASK_DTYPE`](super::MASK_DTYPE).

use candle_core::{Device, Tensor};

use crate::core::AttentionError;

/// Construct padding masks from per-batch valid key lengths.
///
/// Every length must lie in `1..=k_len`; a row with no valid key would make
/// the softmax undefined.
pub fn padding_mask_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor, AttentionError> {
    for (b, &len) in key_lengths.iter().enumerate() {
        if len == 0 || len > k_len {
            return Err(AttentionError::InvalidShape {
                context: format!("key length {len} for batch entry {b} outside 1..={k_len}"),
            });
        }
    }

    let batch = key_lengths.len();
    let total = batch * num_heads * q_len * k_len;
    let mut data = vec![0f32; total];

    for (b, &valid) in key_lengths.iter().enumerate() {
        for h in 0..num_heads {
            for q in 0..q_len {
                let row_start = ((((b * num_heads) + h) * q_len) + q) * k_len;
                for k in valid..k_len {
                    data[row_start + k] = f32::NEG_INFINITY;
                }
            }
        }
    }

    Ok(Tensor::from_vec(data, (batch, num_heads, q_len, k_len), device)?)
}
