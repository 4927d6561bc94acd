//! Decode-time attention primitives.
//!
//! The crate covers what one decoder layer needs to attend during incremental
//! generation: caller-owned key/value caches written in place (one slot per
//! step for self-attention, a single fill for the encoder memory), additive
//! padding masks built from memory lengths, an exact reference kernel behind
//! the [`Attention`] trait, and the masked self-attention and cross-attention
//! sublayers that tie them together.
//!
//! Kernels consume `[batch, n_heads, seq_len, head_dim]` tensors in bf16, f16
//! or f32. Scores and the softmax are evaluated in `f32` and the output is
//! cast back to the input dtype.

pub mod core;
pub mod decode;
pub mod kv_cache;
pub mod masks;
pub mod reference;

pub use core::{Attention, AttentionConfig, AttentionError};
pub use decode::{AttentionWeights, CrossAttention, MaskedSelfAttention, QkvProjections};
pub use kv_cache::{CacheLayout, KeyValueCache, MemoryKvCache, SelfKvCache};
