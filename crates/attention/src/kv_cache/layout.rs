//! Layout definitions for key/value caches.
//!
//! Caches are stored token-major as `[batch, max_seq_len, hidden]` where
//! `hidden = num_heads * head_dim`. A slot for one position is therefore a
//! contiguous `[batch, 1, hidden]` strip per batch entry, which is what a
//! decode step writes.

use candle_core::Tensor;

use crate::core::{AttentionConfig, AttentionError};

/// Declarative description of a cache layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLayout {
    /// Batch entries stored in the cache.
    pub batch: usize,
    /// Maximum sequence length captured by the cache.
    pub max_seq_len: usize,
    /// Number of attention heads stored in the cache.
    pub num_heads: usize,
    /// Dimensionality of each head.
    pub head_dim: usize,
}

impl CacheLayout {
    pub fn new(batch: usize, max_seq_len: usize, attention: AttentionConfig) -> Self {
        Self {
            batch,
            max_seq_len,
            num_heads: attention.num_heads,
            head_dim: attention.head_dim,
        }
    }

    pub fn hidden(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// `[batch, max_seq_len, hidden]`.
    pub fn dims(&self) -> [usize; 3] {
        [self.batch, self.max_seq_len, self.hidden()]
    }

    /// Checks a caller-owned cache buffer against the layout.
    pub fn validate(&self, name: &str, tensor: &Tensor) -> Result<(), AttentionError> {
        if tensor.dims() != self.dims() {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "{name} must be {:?} (batch, max_seq_len, hidden), got {:?}",
                    self.dims(),
                    tensor.dims()
                ),
            });
        }
        if !tensor.is_contiguous() {
            return Err(AttentionError::InvalidShape {
                context: format!("{name} must be contiguous to accept in-place writes"),
            });
        }
        Ok(())
    }

    /// `[batch, len, hidden]` prefix -> `[batch, num_heads, len, head_dim]`.
    pub fn split_heads(&self, tensor: &Tensor, len: usize) -> Result<Tensor, AttentionError> {
        let heads = tensor
            .narrow(1, 0, len)?
            .reshape((self.batch, len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        Ok(heads)
    }
}
