//! Core traits and types shared across attention implementations.
//!
//! Kernels operate on tensors with layout `[batch, n_heads, seq_len, head_dim]`.
//! During incremental decoding the query length is always one. The output
//! mirrors the query layout and dtype, and reductions accumulate in `f32`
//! regardless of the incoming dtype.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::AttentionConfig;
pub use errors::AttentionError;

/// Unified interface for attention kernels.
///
/// * `q` is `[batch, n_heads, q_len, head_dim]`; `k` and `v` are
///   `[batch, n_heads, k_len, head_dim]`.
/// * The returned tensor mirrors the layout and dtype of `q`.
/// * Masks, when present, are additive and shaped
///   `[batch, 1 or n_heads, q_len, k_len]`.
pub trait Attention: Send + Sync {
    /// Scaled dot-product attention with an optional additive mask.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor, AttentionError>;
}
