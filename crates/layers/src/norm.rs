//! Layer normalisation, plain and fused with a bias + residual add.
//!
//! Inputs follow the `(rows, hidden)` convention. Statistics are promoted to
//! [`PrecisionPolicy::reduction`] before the output is cast back to storage.
//! The fused form mirrors the decoder's post-attention stage: the attention
//! branch receives its output-projection bias and the residual stream, the
//! sum replaces the branch in place, and its normalisation feeds the next
//! sublayer.

use candle_core::{DType, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy, linear::add_bias};

/// Configuration shared by normalisation layers.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser applied to the variance.
    pub epsilon: f64,
}

impl NormConfig {
    /// Creates a configuration with the decoder's default epsilon.
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-6,
        }
    }
}

/// Shared interface for normalisation layers used inside decoder steps.
pub trait NormalizationLayer: Send + Sync {
    /// Returns the configuration so callers can check shape compatibility.
    fn config(&self) -> &NormConfig;

    /// Applies the normalisation to a `(rows, hidden)` tensor.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Output of [`LayerNorm::forward_add_bias_residual`].
#[derive(Debug, Clone)]
pub struct ResidualNormOutput {
    /// `branch + bias + residual`, the updated residual stream.
    pub accumulated: Tensor,
    /// Normalised `accumulated`.
    pub normalized: Tensor,
}

/// LayerNorm with affine scale (`gamma`) and shift (`beta`).
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    gamma: Tensor,
    beta: Tensor,
}

impl LayerNorm {
    /// Constructs a LayerNorm from learnable scale and shift parameters.
    pub fn new(gamma: Tensor, beta: Tensor, config: NormConfig) -> Result<Self> {
        let allowed = [DType::F16, DType::BF16, DType::F32];
        checks::expect_shape("norm.gamma", &gamma, &[config.hidden_size])?;
        checks::expect_shape("norm.beta", &beta, &[config.hidden_size])?;
        checks::expect_dtype_in("norm.gamma", &gamma, &allowed)?;
        checks::expect_same_dtype("norm.gamma", &gamma, "norm.beta", &beta)?;
        Ok(Self {
            config,
            gamma,
            beta,
        })
    }

    /// Identity-affine LayerNorm (`gamma = 1`, `beta = 0`).
    pub fn identity(config: NormConfig, dtype: DType, device: &candle_core::Device) -> Result<Self> {
        let gamma = Tensor::ones(config.hidden_size, dtype, device)?;
        let beta = Tensor::zeros(config.hidden_size, dtype, device)?;
        Self::new(gamma, beta, config)
    }

    pub fn gamma(&self) -> &Tensor {
        &self.gamma
    }

    pub fn beta(&self) -> &Tensor {
        &self.beta
    }

    /// Normalises `branch + bias + residual` and also returns the sum.
    pub fn forward_add_bias_residual(
        &self,
        residual: &Tensor,
        branch: &Tensor,
        bias: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<ResidualNormOutput> {
        let rows = checks::expect_rows_hidden("norm.branch", branch, self.config.hidden_size)?;
        checks::expect_shape("norm.residual", residual, &[rows, self.config.hidden_size])?;
        let biased = add_bias(branch, bias, policy)?;
        let accumulated = policy.cast_to_storage(
            &policy
                .cast_for_matmul(&biased)?
                .add(&policy.cast_for_matmul(residual)?)?,
        )?;
        let normalized = self.normalize(&accumulated, policy)?;
        Ok(ResidualNormOutput {
            accumulated,
            normalized,
        })
    }

    fn normalize(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_rows_hidden("norm.input", hidden, self.config.hidden_size)?;

        let hidden_size = self.config.hidden_size as f64;
        let compute = policy.cast_for_reduction(hidden)?;
        let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let normalized = centered.broadcast_div(&denom)?;

        let gamma = self.gamma.to_dtype(normalized.dtype())?;
        let beta = self.beta.to_dtype(normalized.dtype())?;
        let scaled = normalized.broadcast_mul(&gamma)?.broadcast_add(&beta)?;
        policy.cast_to_storage(&scaled)
    }
}

impl NormalizationLayer for LayerNorm {
    fn config(&self) -> &NormConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.normalize(hidden, policy)
    }
}
