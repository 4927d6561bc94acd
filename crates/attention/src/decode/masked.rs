//! Masked self-attention for one decode position.

use candle_core::Tensor;
use layers::{linear::add_bias, PrecisionPolicy};

use super::{merge_heads, query_heads, AttentionWeights, QkvProjections};
use crate::core::{Attention, AttentionConfig, AttentionError};
use crate::kv_cache::{KeyValueCache, SelfKvCache};
use crate::reference::ExactAttention;

/// Self-attention over the cache prefix `0..=step`.
#[derive(Debug)]
pub struct MaskedSelfAttention<A: Attention = ExactAttention> {
    config: AttentionConfig,
    kernel: A,
}

impl MaskedSelfAttention<ExactAttention> {
    pub fn new(config: AttentionConfig) -> Self {
        Self::with_kernel(config, ExactAttention::new())
    }
}

impl<A: Attention> MaskedSelfAttention<A> {
    pub fn with_kernel(config: AttentionConfig, kernel: A) -> Self {
        Self { config, kernel }
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    /// Adds the Q/K/V biases, stores this step's key and value at slot
    /// `step`, and attends the query over slots `0..=step`.
    ///
    /// Returns the context `[batch, hidden]` before the output projection.
    pub fn attend_step(
        &self,
        projected: &QkvProjections,
        weights: &AttentionWeights,
        cache: &SelfKvCache,
        step: usize,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor, AttentionError> {
        let query = add_bias(&projected.query, weights.query.require_bias("query")?, policy)?;
        let key = add_bias(&projected.key, weights.key.require_bias("key")?, policy)?;
        let value = add_bias(&projected.value, weights.value.require_bias("value")?, policy)?;

        cache.write_step(step, &key, &value)?;
        let (keys, values) = cache.heads(step + 1)?;
        let keys = policy.cast_to_storage(&keys)?;
        let values = policy.cast_to_storage(&values)?;

        let q = query_heads(&query, &self.config)?;
        let context = self.kernel.attend(&q, &keys, &values, None)?;
        log::trace!("masked self-attention step={step} keys={}", step + 1);
        merge_heads(&context, &self.config, policy)
    }
}
