//! Cross-attention cache filled once from the encoder output.

use candle_core::Tensor;

use crate::core::AttentionError;
use crate::kv_cache::{api::KeyValueCache, CacheLayout};

/// Handle over the caller's memory key/value buffers.
#[derive(Debug, Clone)]
pub struct MemoryKvCache {
    layout: CacheLayout,
    keys: Tensor,
    values: Tensor,
}

impl MemoryKvCache {
    pub fn new(layout: CacheLayout, keys: &Tensor, values: &Tensor) -> Result<Self, AttentionError> {
        layout.validate("memory key cache", keys)?;
        layout.validate("memory value cache", values)?;
        Ok(Self {
            layout,
            keys: keys.clone(),
            values: values.clone(),
        })
    }

    /// Overwrites every slot with projected memory of shape
    /// `[batch, max_seq_len, hidden]`.
    pub fn fill(&self, keys: &Tensor, values: &Tensor) -> Result<(), AttentionError> {
        let dims = self.layout.dims();
        for (name, tensor) in [("memory keys", keys), ("memory values", values)] {
            if tensor.dims() != dims {
                return Err(AttentionError::InvalidShape {
                    context: format!("{name} must be {dims:?}, got {:?}", tensor.dims()),
                });
            }
        }
        let keys = keys.to_dtype(self.keys.dtype())?.contiguous()?;
        let values = values.to_dtype(self.values.dtype())?.contiguous()?;
        self.keys.slice_set(&keys, 1, 0)?;
        self.values.slice_set(&values, 1, 0)?;
        log::debug!("memory kv cache filled: {:?}", dims);
        Ok(())
    }
}

impl KeyValueCache for MemoryKvCache {
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
