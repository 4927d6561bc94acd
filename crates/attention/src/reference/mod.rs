//! Portable, exact attention kernels.
//!
//! These paths favour clarity over absolute performance and back the decode
//! sublayers unless a caller injects another [`Attention`](crate::Attention)
//! implementation.

pub mod exact;

pub use exact::ExactAttention;
