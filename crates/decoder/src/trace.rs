//! Observation hooks at the fixed stage boundaries of a decoder step.
//!
//! The step itself performs no I/O. An injected [`StageObserver`] sees each
//! stage's output after it lands in the workspace and can log or capture it.

use candle_core::{DType, Tensor};

use crate::error::Result;

/// Stage boundaries, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    SelfNorm,
    MaskedAttention,
    CrossNorm,
    CrossAttention,
    FfnNorm,
    FfnInner,
    Output,
}

pub trait StageObserver: Send + Sync {
    fn observe(&self, stage: Stage, step: usize, tensor: &Tensor) -> Result<()>;
}

/// Default observer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl StageObserver for NoopObserver {
    fn observe(&self, _stage: Stage, _step: usize, _tensor: &Tensor) -> Result<()> {
        Ok(())
    }
}

/// Logs the sum and mean of every stage output at `debug` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TensorStatsLogger;

impl StageObserver for TensorStatsLogger {
    fn observe(&self, stage: Stage, step: usize, tensor: &Tensor) -> Result<()> {
        if !log::log_enabled!(log::Level::Debug) {
            return Ok(());
        }
        let values = tensor.to_dtype(DType::F32)?;
        let sum = values.sum_all()?.to_vec0::<f32>()?;
        let mean = sum / tensor.elem_count().max(1) as f32;
        log::debug!("step {step} {stage:?}: dims={:?} sum={sum} mean={mean}", tensor.dims());
        Ok(())
    }
}
