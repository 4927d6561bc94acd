//! Public traits describing key/value cache behaviour.

use candle_core::Tensor;

use crate::core::AttentionError;
use crate::kv_cache::CacheLayout;

/// Caller-owned pair of key/value buffers addressed by position.
pub trait KeyValueCache {
    fn layout(&self) -> &CacheLayout;

    fn keys(&self) -> &Tensor;

    fn values(&self) -> &Tensor;

    /// Keys and values for positions `0..len`, split into heads.
    fn heads(&self, len: usize) -> Result<(Tensor, Tensor), AttentionError> {
        let layout = self.layout();
        if len == 0 || len > layout.max_seq_len {
            return Err(AttentionError::OutOfBounds {
                position: len,
                capacity: layout.max_seq_len,
            });
        }
        Ok((
            layout.split_heads(self.keys(), len)?,
            layout.split_heads(self.values(), len)?,
        ))
    }
}
