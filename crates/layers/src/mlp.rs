//! Position-wise feed-forward block: expand, activate, contract.
//!
//! Inputs are `(rows, hidden)`; the expansion produces
//! `(rows, intermediate_size)` and the contraction returns to `hidden`. The
//! contraction bias is left for the caller's residual add, so
//! [`FeedForwardOutput::output`] is `act(x · W1 + b1) · W2` without `b2`.

use candle_core::{Error, Result, Tensor};

use crate::{
    activations::{add_bias_act, builtin, ActivationKind},
    checks,
    dtypes::PrecisionPolicy,
    linear::{Dense, GemmAlgorithm},
};

/// Expansion factor between the hidden width and the inner activation.
pub const FFN_EXPANSION: usize = 4;

/// Shape metadata of a feed-forward block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedForwardConfig {
    /// Model hidden size.
    pub hidden_size: usize,
    /// Width of the activation space.
    pub intermediate_size: usize,
}

impl FeedForwardConfig {
    /// Standard transformer block with a 4x expansion.
    pub fn standard(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            intermediate_size: FFN_EXPANSION * hidden_size,
        }
    }
}

/// GEMM algorithms for the two projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedForwardAlgorithms {
    pub inner: GemmAlgorithm,
    pub output: GemmAlgorithm,
}

/// Both products of a feed-forward pass.
#[derive(Debug, Clone)]
pub struct FeedForwardOutput {
    /// `act(x · W1 + b1)`, shaped `(rows, intermediate_size)`.
    pub inner: Tensor,
    /// `inner · W2`, shaped `(rows, hidden_size)`, without the output bias.
    pub output: Tensor,
}

/// Shared interface for feed-forward stacks.
pub trait FeedForwardLayer: Send + Sync {
    /// Configuration metadata used during binding.
    fn config(&self) -> &FeedForwardConfig;

    /// Performs the forward pass through the block.
    fn forward(
        &self,
        hidden: &Tensor,
        activation: ActivationKind,
        algorithms: FeedForwardAlgorithms,
        policy: &PrecisionPolicy,
    ) -> Result<FeedForwardOutput>;
}

/// Two-projection feed-forward block.
#[derive(Debug, Clone)]
pub struct FeedForward {
    config: FeedForwardConfig,
    intermediate: Dense,
    output: Dense,
}

impl FeedForward {
    /// Pairs an expansion and a contraction projection.
    pub fn new(intermediate: Dense, output: Dense) -> Result<Self> {
        let hidden_size = intermediate.config().input_dim;
        let intermediate_size = intermediate.config().output_dim;
        if output.config().input_dim != intermediate_size || output.config().output_dim != hidden_size {
            return Err(Error::Msg(format!(
                "ffn output projection must map {intermediate_size} -> {hidden_size}, got {} -> {}",
                output.config().input_dim,
                output.config().output_dim
            )));
        }
        intermediate.require_bias("ffn.intermediate")?;
        output.require_bias("ffn.output")?;
        Ok(Self {
            config: FeedForwardConfig {
                hidden_size,
                intermediate_size,
            },
            intermediate,
            output,
        })
    }

    pub fn intermediate(&self) -> &Dense {
        &self.intermediate
    }

    pub fn output(&self) -> &Dense {
        &self.output
    }

    /// Bias of the contraction, applied by the caller's residual add.
    pub fn output_bias(&self) -> Result<&Tensor> {
        self.output.require_bias("ffn.output")
    }
}

impl FeedForwardLayer for FeedForward {
    fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    fn forward(
        &self,
        hidden: &Tensor,
        activation: ActivationKind,
        algorithms: FeedForwardAlgorithms,
        policy: &PrecisionPolicy,
    ) -> Result<FeedForwardOutput> {
        checks::expect_rows_hidden("ffn.input", hidden, self.config.hidden_size)?;
        let expanded = self
            .intermediate
            .forward_without_bias(hidden, algorithms.inner, policy)?;
        let bias = self.intermediate.require_bias("ffn.intermediate")?;
        let inner = add_bias_act(&expanded, bias, builtin(activation).as_ref(), policy)?;
        let output = self
            .output
            .forward_without_bias(&inner, algorithms.output, policy)?;
        Ok(FeedForwardOutput { inner, output })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtypes::{Fp32, Precision};
    use crate::linear::{LinearConfig, LinearInit};
    use candle_core::{DType, Device};

    fn block(hidden: usize) -> Result<FeedForward> {
        let device = Device::Cpu;
        let config = FeedForwardConfig::standard(hidden);
        let inner = Dense::with_init(
            LinearConfig::new(hidden, config.intermediate_size),
            &LinearInit::XavierUniform,
            &device,
            DType::F32,
        )?;
        let output = Dense::with_init(
            LinearConfig::new(config.intermediate_size, hidden),
            &LinearInit::XavierUniform,
            &device,
            DType::F32,
        )?;
        FeedForward::new(inner, output)
    }

    fn algorithms() -> FeedForwardAlgorithms {
        FeedForwardAlgorithms {
            inner: GemmAlgorithm::DEFAULT,
            output: GemmAlgorithm::DEFAULT,
        }
    }

    #[test]
    fn shapes_follow_expansion() -> Result<()> {
        let ffn = block(8)?;
        let input = Tensor::randn(0f32, 1.0, (3, 8), &Device::Cpu)?;
        let out = ffn.forward(&input, ActivationKind::Gelu, algorithms(), &Fp32::policy())?;
        assert_eq!(out.inner.dims(), &[3, 32]);
        assert_eq!(out.output.dims(), &[3, 8]);
        Ok(())
    }

    #[test]
    fn relu_inner_activation_is_non_negative() -> Result<()> {
        let ffn = block(8)?;
        let input = Tensor::randn(0f32, 1.0, (4, 8), &Device::Cpu)?;
        let out = ffn.forward(&input, ActivationKind::Relu, algorithms(), &Fp32::policy())?;
        let min = out.inner.min_all()?.to_vec0::<f32>()?;
        assert!(min >= 0.0);
        Ok(())
    }

    #[test]
    fn mismatched_projections_are_rejected() -> Result<()> {
        let device = Device::Cpu;
        let inner = Dense::with_init(LinearConfig::new(4, 16), &LinearInit::XavierUniform, &device, DType::F32)?;
        let output = Dense::with_init(LinearConfig::new(8, 4), &LinearInit::XavierUniform, &device, DType::F32)?;
        assert!(FeedForward::new(inner, output).is_err());
        Ok(())
    }
}
