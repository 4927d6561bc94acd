//! Single-layer, single-step transformer decoder.
//!
//! A [`DecoderStep`] is constructed once per layer with a fixed
//! [`ShapeConfig`], reads its GEMM algorithm table from a profiling record,
//! is bound to weights and a caller-owned workspace buffer with
//! [`DecoderStep::initialize`], and then executes one decode position per
//! [`DecoderStep::forward`] call.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use candle_core::{DType, Device, Tensor};
//! use decoder::{
//!     ComputeContext, DecoderConfig, DecoderInitParam, DecoderStep, LayerWeights, ShapeConfig,
//!     StepInputs,
//! };
//! use layers::Fp32;
//!
//! # fn main() -> decoder::Result<()> {
//! let device = Device::Cpu;
//! let shape = ShapeConfig::new(2, 8, 4, 16, 64)?;
//! let mut step = DecoderStep::<Fp32>::new(&DecoderConfig::new(shape))?;
//! let workspace = Tensor::zeros(step.workspace_size(), DType::F32, &device)?;
//! let weights = Arc::new(LayerWeights::random(&shape, false, DType::F32, &device)?);
//! step.initialize(
//!     DecoderInitParam { weights, context: ComputeContext::new(device.clone()) },
//!     &workspace,
//! )?;
//!
//! let hidden = Tensor::randn(0f32, 1.0, (2, 64), &device)?;
//! let key_cache = Tensor::zeros((2, 8, 64), DType::F32, &device)?;
//! let value_cache = key_cache.zeros_like()?;
//! let output = hidden.zeros_like()?;
//! step.forward(StepInputs {
//!     from_tensor: &hidden,
//!     key_cache: &key_cache,
//!     value_cache: &value_cache,
//!     memory: None,
//!     decoder_output: &output,
//!     step: 0,
//!     cross_attention: false,
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod gemm;
pub mod param;
pub mod step;
pub mod trace;
pub mod workspace;

pub use config::{DecoderConfig, ShapeConfig};
pub use error::{DecoderError, Result};
pub use gemm::{GemmAlgorithmTable, GemmProfile, GemmSite, DEFAULT_GEMM_PROFILE};
pub use param::{ComputeContext, CrossWeights, DecoderInitParam, LayerWeights};
pub use step::{AttentionPattern, DecoderStep, MemoryInputs, StepInputs};
pub use trace::{NoopObserver, Stage, StageObserver, TensorStatsLogger};
pub use workspace::{FusedQkvTable, Region, WorkspaceArena, WorkspacePlan};
