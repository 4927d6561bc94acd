//! Decode-time attention sublayers.
//!
//! A decoder step projects its normalised input itself (so it can choose the
//! GEMM algorithm and destination buffer), then hands the raw projections to
//! these sublayers. They add the projection biases, update the caches and
//! attend, returning the per-step context `[batch, hidden]` ready for the
//! output projection.

pub mod cross;
pub mod masked;

use candle_core::Tensor;
use layers::{checks, Dense, GemmAlgorithm, PrecisionPolicy};

use crate::core::{AttentionConfig, AttentionError};

pub use cross::CrossAttention;
pub use masked::MaskedSelfAttention;

/// Projection weights of one attention sublayer.
///
/// Every projection carries a bias. Key and value kernels of a
/// cross-attention sublayer map the memory width onto `hidden`.
#[derive(Debug, Clone)]
pub struct AttentionWeights {
    pub query: Dense,
    pub key: Dense,
    pub value: Dense,
    pub output: Dense,
}

impl AttentionWeights {
    /// Validates that the projections agree on `hidden` and that `key` and
    /// `value` read `source_width` features.
    pub fn new(
        query: Dense,
        key: Dense,
        value: Dense,
        output: Dense,
        source_width: usize,
    ) -> Result<Self, AttentionError> {
        let hidden = query.config().output_dim;
        let expect = |name: &str, dense: &Dense, input: usize| -> Result<(), AttentionError> {
            let config = dense.config();
            if config.input_dim != input || config.output_dim != hidden {
                return Err(AttentionError::InvalidShape {
                    context: format!(
                        "{name} projection must map {input} -> {hidden}, got {} -> {}",
                        config.input_dim, config.output_dim
                    ),
                });
            }
            dense.require_bias(name)?;
            Ok(())
        };
        expect("query", &query, hidden)?;
        expect("key", &key, source_width)?;
        expect("value", &value, source_width)?;
        expect("attention output", &output, hidden)?;
        Ok(Self {
            query,
            key,
            value,
            output,
        })
    }

    pub fn hidden(&self) -> usize {
        self.query.config().output_dim
    }

    /// Three independent projections of `input` without their biases.
    pub fn project_qkv(
        &self,
        input: &Tensor,
        algorithm: GemmAlgorithm,
        policy: &PrecisionPolicy,
    ) -> Result<QkvProjections, AttentionError> {
        Ok(QkvProjections {
            query: self.query.forward_without_bias(input, algorithm, policy)?,
            key: self.key.forward_without_bias(input, algorithm, policy)?,
            value: self.value.forward_without_bias(input, algorithm, policy)?,
        })
    }
}

/// Query/key/value rows of one decode step, biases not yet applied.
#[derive(Debug, Clone)]
pub struct QkvProjections {
    pub query: Tensor,
    pub key: Tensor,
    pub value: Tensor,
}

/// `[batch, hidden]` -> `[batch, num_heads, 1, head_dim]`.
pub(crate) fn query_heads(
    query: &Tensor,
    config: &AttentionConfig,
) -> Result<Tensor, AttentionError> {
    let batch = checks::expect_rows_hidden("attention.query", query, config.hidden())?;
    Ok(query
        .reshape((batch, config.num_heads, 1, config.head_dim))?
        .contiguous()?)
}

/// `[batch, num_heads, 1, head_dim]` -> `[batch, hidden]` in storage dtype.
pub(crate) fn merge_heads(
    context: &Tensor,
    config: &AttentionConfig,
    policy: &PrecisionPolicy,
) -> Result<Tensor, AttentionError> {
    let batch = context.dims()[0];
    let merged = context.reshape((batch, config.hidden()))?;
    Ok(policy.cast_to_storage(&merged)?)
}

#[cfg(test)]
mod tests;
