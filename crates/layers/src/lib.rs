//! Dense building blocks for single-step transformer decoding.
//!
//! Per-step tensors follow the `(rows, hidden)` convention where `rows` is the
//! batch size during incremental decoding. Projection kernels are stored in the
//! GEMM-friendly `[in, out]` layout so `y = x · W` maps onto a single
//! matrix multiply. Every public routine takes a [`dtypes::PrecisionPolicy`]
//! and casts between storage, compute, and reduction dtypes on its own.

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod residual;

pub use activations::ActivationKind;
pub use dtypes::{Fp16, Fp32, OperationType, Precision, PrecisionPolicy};
pub use linear::{Dense, GemmAlgorithm, LinearConfig, LinearInit};
pub use mlp::{FeedForward, FeedForwardAlgorithms, FeedForwardConfig, FeedForwardLayer, FeedForwardOutput};
pub use norm::{LayerNorm, NormConfig, NormalizationLayer, ResidualNormOutput};
pub use residual::add_bias_residual;
