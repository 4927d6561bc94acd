//! Self-attention cache written one position per decode step.

use candle_core::Tensor;

use crate::core::AttentionError;
use crate::kv_cache::{api::KeyValueCache, CacheLayout};

/// Handle over the caller's self-attention key/value buffers.
///
/// The handle shares storage with the caller's tensors, so a slot written
/// through it is visible to every other handle on the same buffers.
#[derive(Debug, Clone)]
pub struct SelfKvCache {
    layout: CacheLayout,
    keys: Tensor,
    values: Tensor,
}

impl SelfKvCache {
    pub fn new(layout: CacheLayout, keys: &Tensor, values: &Tensor) -> Result<Self, AttentionError> {
        layout.validate("self key cache", keys)?;
        layout.validate("self value cache", values)?;
        if keys.dtype() != values.dtype() {
            return Err(AttentionError::UnsupportedDType {
                requested: format!(
                    "key cache {:?} and value cache {:?} must share a dtype",
                    keys.dtype(),
                    values.dtype()
                ),
            });
        }
        Ok(Self {
            layout,
            keys: keys.clone(),
            values: values.clone(),
        })
    }

    /// Stores `[batch, hidden]` key/value rows at `step`; other slots are left
    /// untouched.
    pub fn write_step(&self, step: usize, key: &Tensor, value: &Tensor) -> Result<(), AttentionError> {
        if step >= self.layout.max_seq_len {
            return Err(AttentionError::OutOfBounds {
                position: step,
                capacity: self.layout.max_seq_len,
            });
        }
        let row = (self.layout.batch, 1, self.layout.hidden());
        let key = key.reshape(row)?.to_dtype(self.keys.dtype())?.contiguous()?;
        let value = value.reshape(row)?.to_dtype(self.values.dtype())?.contiguous()?;
        self.keys.slice_set(&key, 1, step)?;
        self.values.slice_set(&value, 1, step)?;
        log::trace!("self kv cache wrote slot {step}");
        Ok(())
    }
}

impl KeyValueCache for SelfKvCache {
    fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    fn keys(&self) -> &Tensor {
        &self.keys
    }

    fn values(&self) -> &Tensor {
        &self.values
    }
}
