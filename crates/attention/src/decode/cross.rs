//! Cross-attention against the encoder memory.

use candle_core::Tensor;
use layers::{linear::add_bias, GemmAlgorithm, PrecisionPolicy};

use super::{merge_heads, query_heads, AttentionWeights};
use crate::core::{Attention, AttentionConfig, AttentionError};
use crate::kv_cache::{KeyValueCache, MemoryKvCache};
use crate::masks::padding_mask_from_lengths;
use crate::reference::ExactAttention;

/// Attention from the decoder state to a padded encoder memory.
#[derive(Debug)]
pub struct CrossAttention<A: Attention = ExactAttention> {
    config: AttentionConfig,
    kernel: A,
}

impl CrossAttention<ExactAttention> {
    pub fn new(config: AttentionConfig) -> Self {
        Self::with_kernel(config, ExactAttention::new())
    }
}

impl<A: Attention> CrossAttention<A> {
    pub fn with_kernel(config: AttentionConfig, kernel: A) -> Self {
        Self { config, kernel }
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    /// Projects `memory` (`[batch, max_seq_len, memory_width]`) through the
    /// key/value kernels, biases included, and fills the memory cache.
    ///
    /// Runs once per generation, at the first decode step.
    pub fn fill_memory(
        &self,
        memory: &Tensor,
        weights: &AttentionWeights,
        cache: &MemoryKvCache,
        algorithm: GemmAlgorithm,
        policy: &PrecisionPolicy,
    ) -> Result<(), AttentionError> {
        let (batch, seq, width) = memory.dims3().map_err(|_| AttentionError::InvalidShape {
            context: format!(
                "memory must be [batch, max_seq_len, memory_width], got {:?}",
                memory.dims()
            ),
        })?;
        let layout = cache.layout();
        if batch != layout.batch || seq != layout.max_seq_len {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "memory {:?} does not match cache batch {} and length {}",
                    memory.dims(),
                    layout.batch,
                    layout.max_seq_len
                ),
            });
        }
        let rows = memory.reshape((batch * seq, width))?;
        let keys = weights.key.forward(&rows, algorithm, policy)?;
        let values = weights.value.forward(&rows, algorithm, policy)?;
        let hidden = self.config.hidden();
        cache.fill(
            &keys.reshape((batch, seq, hidden))?,
            &values.reshape((batch, seq, hidden))?,
        )
    }

    /// Adds the query bias and attends over the valid prefix of each batch
    /// entry's memory, `0..memory_lengths[b]`.
    pub fn attend_step(
        &self,
        projected_query: &Tensor,
        weights: &AttentionWeights,
        cache: &MemoryKvCache,
        memory_lengths: &[usize],
        policy: &PrecisionPolicy,
    ) -> Result<Tensor, AttentionError> {
        let layout = *cache.layout();
        if memory_lengths.len() != layout.batch {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "expected {} memory lengths, got {}",
                    layout.batch,
                    memory_lengths.len()
                ),
            });
        }
        let query = add_bias(projected_query, weights.query.require_bias("cross query")?, policy)?;
        let q = query_heads(&query, &self.config)?;
        let (keys, values) = cache.heads(layout.max_seq_len)?;
        let keys = policy.cast_to_storage(&keys)?;
        let values = policy.cast_to_storage(&values)?;
        let mask = padding_mask_from_lengths(
            q.device(),
            memory_lengths,
            1,
            1,
            layout.max_seq_len,
        )?;
        let context = self.kernel.attend(&q, &keys, &values, Some(&mask))?;
        merge_heads(&context, &self.config, policy)
    }
}
