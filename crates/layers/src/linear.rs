//! Dense projections and the GEMM entry points they are issued through.
//!
//! Kernels are stored as `[in_dim, out_dim]` so that a projection is the plain
//! product `x · W` over a `(rows, in_dim)` input. Every multiply is tagged
//! with the [`GemmAlgorithm`] selected for its call site; the portable path
//! records the choice and lets candle pick the kernel, while device backends
//! honour it. Operands are promoted to [`PrecisionPolicy::compute`] before the
//! multiply and cast back with
//! [`PrecisionPolicy::cast_to_storage`](crate::dtypes::PrecisionPolicy::cast_to_storage).

use std::fmt;

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Identifier of a vendor GEMM algorithm.
///
/// Values mirror the cuBLAS numbering: `-1` is the default heuristic,
/// `0..=23` are explicit algorithms, `99` is the default tensor-op heuristic
/// and `100..=115` are explicit tensor-op algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GemmAlgorithm(i32);

impl GemmAlgorithm {
    pub const DEFAULT: Self = Self(-1);
    pub const ALGO23: Self = Self(23);
    pub const DEFAULT_TENSOR_OP: Self = Self(99);
    pub const ALGO15_TENSOR_OP: Self = Self(115);

    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Whether the identifier targets tensor-op matrix units.
    pub fn is_tensor_op(self) -> bool {
        self >= Self::DEFAULT_TENSOR_OP
    }
}

impl fmt::Display for GemmAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Single GEMM: `(m, k) · (k, n) -> (m, n)`.
pub fn gemm(
    input: &Tensor,
    kernel: &Tensor,
    algorithm: GemmAlgorithm,
    policy: &PrecisionPolicy,
) -> Result<Tensor> {
    let (m, k) = input.dims2()?;
    let (kernel_k, n) = kernel.dims2()?;
    if k != kernel_k {
        return Err(Error::Msg(format!(
            "gemm inner dimensions disagree: input ({m}, {k}) vs kernel ({kernel_k}, {n})"
        )));
    }
    log::trace!("gemm m={m} n={n} k={k} algo={algorithm}");
    let a = policy.cast_for_matmul(input)?;
    let b = policy.cast_for_matmul(kernel)?;
    policy.cast_to_storage(&a.matmul(&b)?)
}

/// Batched GEMM: `(batch, m, k) · (batch, k, n) -> (batch, m, n)` in one call.
pub fn batched_gemm(
    inputs: &Tensor,
    kernels: &Tensor,
    algorithm: GemmAlgorithm,
    policy: &PrecisionPolicy,
) -> Result<Tensor> {
    let (batch, m, k) = inputs.dims3()?;
    let (kernel_batch, kernel_k, n) = kernels.dims3()?;
    if batch != kernel_batch || k != kernel_k {
        return Err(Error::Msg(format!(
            "batched gemm operands disagree: inputs ({batch}, {m}, {k}) vs kernels ({kernel_batch}, {kernel_k}, {n})"
        )));
    }
    log::trace!("batched gemm batch={batch} m={m} n={n} k={k} algo={algorithm}");
    let a = policy.cast_for_matmul(&inputs.contiguous()?)?;
    let b = policy.cast_for_matmul(kernels)?;
    policy.cast_to_storage(&a.matmul(&b)?)
}

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a bias vector accompanies the kernel.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration for a biased projection.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }
}

/// Supported weight initialisation policies, used for synthetic weights in
/// tests and benchmarks.
#[derive(Debug, Clone)]
pub enum LinearInit {
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Xavier/Glorot normal initialisation.
    XavierNormal,
    /// Scales another policy.
    Scaled { base: Box<LinearInit>, scale: f64 },
}

impl LinearInit {
    /// Convenience helper to scale an existing policy.
    pub fn scaled(base: LinearInit, scale: f64) -> Self {
        Self::Scaled {
            base: Box::new(base),
            scale,
        }
    }

    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (in_dim, out_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        let weight_f32 = match self {
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::XavierNormal => {
                let std = (2.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::randn(0f32, std as f32, shape, device)?
            }
            LinearInit::Scaled { base, scale } => {
                base.sample(shape, device, DType::F32)?.affine(*scale, 0.0)?
            }
        };
        weight_f32.to_dtype(dtype)
    }
}

/// Dense projection: a `[in, out]` kernel and an optional `[out]` bias.
#[derive(Debug, Clone)]
pub struct Dense {
    config: LinearConfig,
    kernel: Tensor,
    bias: Option<Tensor>,
}

impl Dense {
    /// Wraps pre-existing parameters after validating their shapes.
    pub fn new(kernel: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (input_dim, output_dim) = kernel.dims2()?;
        checks::expect_contiguous("dense.kernel", &kernel)?;
        if let Some(bias) = &bias {
            checks::expect_shape("dense.bias", bias, &[output_dim])?;
            checks::expect_same_dtype("dense.bias", bias, "dense.kernel", &kernel)?;
        }
        let config = LinearConfig {
            input_dim,
            output_dim,
            bias: bias.is_some(),
        };
        Ok(Self {
            config,
            kernel,
            bias,
        })
    }

    /// Builds a projection with randomly initialised kernel and zero bias.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let kernel = init.sample((config.input_dim, config.output_dim), device, dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.output_dim, dtype, device)?)
        } else {
            None
        };
        Self::new(kernel, bias)
    }

    /// Replaces the bias vector, e.g. to load non-zero synthetic values.
    pub fn with_bias(mut self, bias: Tensor) -> Result<Self> {
        checks::expect_shape("dense.bias", &bias, &[self.config.output_dim])?;
        checks::expect_same_dtype("dense.bias", &bias, "dense.kernel", &self.kernel)?;
        self.bias = Some(bias);
        self.config.bias = true;
        Ok(self)
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    pub fn kernel(&self) -> &Tensor {
        &self.kernel
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// The bias, or an error naming the projection when it is absent.
    pub fn require_bias(&self, name: &str) -> Result<&Tensor> {
        self.bias
            .as_ref()
            .ok_or_else(|| Error::Msg(format!("{name} requires a bias vector")))
    }

    /// `x · W` without the bias; fused downstream stages add it.
    pub fn forward_without_bias(
        &self,
        input: &Tensor,
        algorithm: GemmAlgorithm,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        gemm(input, &self.kernel, algorithm, policy)
    }

    /// `x · W + b`.
    pub fn forward(
        &self,
        input: &Tensor,
        algorithm: GemmAlgorithm,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        let projected = self.forward_without_bias(input, algorithm, policy)?;
        match &self.bias {
            Some(bias) => add_bias(&projected, bias, policy),
            None => Ok(projected),
        }
    }
}

/// Broadcast-adds a `[n]` bias onto a `(rows, n)` tensor in the compute dtype.
pub fn add_bias(input: &Tensor, bias: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
    let input = policy.cast_for_matmul(input)?;
    let bias = policy.cast_for_matmul(bias)?;
    policy.cast_to_storage(&input.broadcast_add(&bias)?)
}
