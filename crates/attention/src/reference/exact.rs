//! Reference attention kernel.
//!
//! The exact path prioritises numerical fidelity and mirrors the semantics
//! described by the [`Attention`](crate::core::Attention) trait: scores and
//! the softmax are evaluated in `f32` whatever the storage dtype.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::softmax_last_dim;

use crate::core::{Attention, AttentionError};
use crate::masks::MASK_DTYPE;

/// Numerically stable, portable attention kernel.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor, AttentionError> {
        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::InvalidShape {
                context: "q, k, v must reside on the same device".to_string(),
            });
        }

        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(AttentionError::InvalidShape {
                context: "q, k, v must share the same dtype".to_string(),
            });
        }
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        let (batch, heads, q_len, head_dim) =
            q.dims4().map_err(|_| AttentionError::InvalidShape {
                context: "q must have shape [batch, heads, seq_len, head_dim]".to_string(),
            })?;
        let (kb, kh, k_len, kd) = k.dims4().map_err(|_| AttentionError::InvalidShape {
            context: "k must have shape [batch, heads, seq_len, head_dim]".to_string(),
        })?;
        let (vb, vh, vk, vd) = v.dims4().map_err(|_| AttentionError::InvalidShape {
            context: "v must have shape [batch, heads, seq_len, head_dim]".to_string(),
        })?;

        if kb != batch || kh != heads || kd != head_dim {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
                ),
            });
        }
        if vb != batch || vh != heads || vk != k_len || vd != head_dim {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "v shape mismatch: expected [{batch}, {heads}, {k_len}, {head_dim}] got [{vb}, {vh}, {vk}, {vd}]"
                ),
            });
        }

        if self.first_call.set(()).is_ok() {
            log::debug!(
                "attention::reference first call dtype={dtype:?} heads={heads} head_dim={head_dim}"
            );
        }

        let merged = batch * heads;
        let q_view = q
            .to_dtype(DType::F32)?
            .reshape((merged, q_len, head_dim))?;
        let k_view = k
            .to_dtype(DType::F32)?
            .reshape((merged, k_len, head_dim))?;
        let v_view = v
            .to_dtype(DType::F32)?
            .reshape((merged, k_len, head_dim))?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let scores = q_view
            .matmul(&k_view.t()?.contiguous()?)?
            .affine(scale, 0.0)?;
        let mut scores = scores.reshape((batch, heads, q_len, k_len))?;

        if let Some(mask) = mask {
            if !device.same_device(mask.device()) {
                return Err(AttentionError::InvalidShape {
                    context: "mask must reside on the same device as q".to_string(),
                });
            }
            if mask.dtype() != MASK_DTYPE {
                return Err(AttentionError::UnsupportedDType {
                    requested: format!("mask expects dtype {MASK_DTYPE:?}, got {:?}", mask.dtype()),
                });
            }
            let (mb, mh, mq, mk) = mask.dims4().map_err(|_| AttentionError::InvalidShape {
                context: "mask must have shape [batch, heads|1, q_len, k_len]".to_string(),
            })?;
            if mb != batch || mq != q_len || mk != k_len {
                return Err(AttentionError::InvalidShape {
                    context: format!(
                        "mask shape mismatch: expected [{batch}, 1|{heads}, {q_len}, {k_len}] got [{mb}, {mh}, {mq}, {mk}]"
                    ),
                });
            }
            if mh != 1 && mh != heads {
                return Err(AttentionError::InvalidShape {
                    context: format!("mask head dimension must be 1 or {heads}, got {mh}"),
                });
            }
            scores = scores.broadcast_add(mask)?;
        }

        let probs = softmax_last_dim(&scores.reshape((merged, q_len, k_len))?)?;
        let output = probs
            .matmul(&v_view)?
            .reshape((batch, heads, q_len, head_dim))?;
        Ok(output.to_dtype(dtype)?)
    }
}
