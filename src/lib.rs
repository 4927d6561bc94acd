//! Single-layer, single-step transformer decoding on candle.
//!
//! The work lives in three crates re-exported here:
//! [`layers`] (precision, GEMM, norms, feed-forward), [`attention`] (caches,
//! masks, decode-time attention) and [`decoder`] (configuration, GEMM profile,
//! workspace and the per-step state machine).

pub use attention;
pub use decoder;
pub use layers;

pub use decoder::{
    DecoderConfig, DecoderError, DecoderInitParam, DecoderStep, LayerWeights, ShapeConfig,
    StepInputs,
};

use anyhow::Result;
use candle_core::Device;

/// Picks the compute device: CUDA when available, CPU otherwise.
///
/// Setting `CANDLE_FORCE_CPU` skips device probing.
pub fn setup_device() -> Result<Device> {
    if std::env::var("CANDLE_FORCE_CPU").is_ok() {
        log::info!("CANDLE_FORCE_CPU set, using CPU backend");
        return Ok(Device::Cpu);
    }

    match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => {
            if let Err(err) = cuda_preflight(&device) {
                log::warn!("CUDA device detected but preflight failed ({err}), falling back to CPU");
                return Ok(Device::Cpu);
            }
            log::info!("CUDA device selected: {device:?}");
            Ok(device)
        }
        Ok(_) | Err(_) => {
            log::info!("using CPU backend");
            Ok(Device::Cpu)
        }
    }
}

/// Exercises the ops a decode step issues before trusting the device.
fn cuda_preflight(device: &Device) -> Result<()> {
    use candle_core::{DType, Tensor, D};

    let a = Tensor::ones((2, 4), DType::F32, device)?;
    let b = Tensor::ones((4, 2), DType::F32, device)?;
    let _ = a.matmul(&b)?;

    let x = Tensor::randn(0.0f32, 1.0f32, (2, 4, 8, 16), device)?;
    let scores = x.matmul(&x.transpose(2, 3)?)?;
    let _ = candle_nn::ops::softmax_last_dim(&scores)?;

    let half = x.to_dtype(DType::F16)?;
    let _ = half.sum_keepdim(D::Minus1)?;

    let cache = Tensor::zeros((2, 8, 64), DType::F32, device)?;
    let row = Tensor::ones((2, 1, 64), DType::F32, device)?;
    cache.slice_set(&row, 1, 3)?;

    Ok(())
}
