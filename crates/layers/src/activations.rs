//! Activations used between the two feed-forward projections.
//!
//! The decoder picks the activation from its attention pattern rather than
//! from per-call configuration: encoder-decoder layers use ReLU, decoder-only
//! layers use GELU.
//!
//! # Built-in formulas
//!
//! * **ReLU** clamps negative pre-activations to zero.
//! * **GELU** uses the tanh approximation
//!   `0.5 * x * (1 + tanh(sqrt(2 / pi) * (x + 0.044715 * x^3)))`, which keeps a
//!   small negative response for small negative inputs.
//!
//! Both are evaluated in [`PrecisionPolicy::reduction`] precision and cast back
//! to storage.

use std::sync::Arc;

use candle_core::{Result, Tensor};

use crate::{dtypes::PrecisionPolicy, linear::add_bias};

/// Identifies which non-linearity is implemented by an [`Activation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    /// Rectified linear unit.
    Relu,
    /// GeLU with the tanh approximation used by GPT style models.
    Gelu,
}

/// Common interface shared by feed-forward activation functions.
pub trait Activation: Send + Sync {
    /// Returns the [`ActivationKind`] for introspection.
    fn kind(&self) -> ActivationKind;

    /// Applies the activation to `input` using the precision rules in `policy`.
    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

struct BuiltinActivation {
    kind: ActivationKind,
}

impl Activation for BuiltinActivation {
    fn kind(&self) -> ActivationKind {
        self.kind
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let compute = policy.cast_for_reduction(input)?;
        let activated = match self.kind {
            ActivationKind::Relu => compute.relu()?,
            ActivationKind::Gelu => compute.gelu()?,
        };
        policy.cast_to_storage(&activated)
    }
}

/// Returns a shared built-in activation implementation.
pub fn builtin(kind: ActivationKind) -> Arc<dyn Activation> {
    Arc::new(BuiltinActivation { kind })
}

/// `act(input + bias)`, the fused epilogue of the feed-forward expansion.
pub fn add_bias_act(
    input: &Tensor,
    bias: &Tensor,
    activation: &dyn Activation,
    policy: &PrecisionPolicy,
) -> Result<Tensor> {
    let biased = add_bias(input, bias, policy)?;
    activation.forward(&biased, policy)
}
