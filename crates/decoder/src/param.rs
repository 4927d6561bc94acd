//! Weights and compute context bound to a decoder step.

use std::sync::Arc;

use attention::AttentionWeights;
use candle_core::{DType, Device, Tensor};
use layers::{
    Dense, FeedForward, FeedForwardConfig, FeedForwardLayer, LayerNorm, LinearConfig, LinearInit,
    NormConfig, NormalizationLayer,
};

use crate::config::ShapeConfig;
use crate::error::{DecoderError, Result};

/// Cross-attention sublayer weights.
#[derive(Debug, Clone)]
pub struct CrossWeights {
    pub layernorm: LayerNorm,
    pub attention: AttentionWeights,
}

/// All parameters of one decoder layer.
///
/// Held behind an [`Arc`] by the decoder; the weight store keeps ownership.
#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub self_layernorm: LayerNorm,
    pub self_attention: AttentionWeights,
    /// Absent for decoder-only layers.
    pub cross: Option<CrossWeights>,
    pub ffn_layernorm: LayerNorm,
    pub ffn: FeedForward,
}

impl LayerWeights {
    /// Checks every tensor against `shape` and the storage dtype.
    pub fn validate(&self, shape: &ShapeConfig, dtype: DType) -> Result<()> {
        let hidden = shape.hidden_units();
        let mut errors = Vec::new();

        let mut norm = |name: &str, layer: &LayerNorm| {
            if layer.config().hidden_size != hidden {
                errors.push(format!(
                    "{name} normalises {} features, expected {hidden}",
                    layer.config().hidden_size
                ));
            }
            if layer.gamma().dtype() != dtype {
                errors.push(format!("{name} uses {:?}, expected {dtype:?}", layer.gamma().dtype()));
            }
        };
        norm("self_layernorm", &self.self_layernorm);
        norm("ffn_layernorm", &self.ffn_layernorm);
        if let Some(cross) = &self.cross {
            norm("cross_layernorm", &cross.layernorm);
        }

        let mut attention = |name: &str, weights: &AttentionWeights, source: usize| {
            if weights.hidden() != hidden {
                errors.push(format!("{name} projects to {}, expected {hidden}", weights.hidden()));
            }
            if weights.key.config().input_dim != source {
                errors.push(format!(
                    "{name} key projection reads {} features, expected {source}",
                    weights.key.config().input_dim
                ));
            }
            if weights.query.kernel().dtype() != dtype {
                errors.push(format!(
                    "{name} uses {:?}, expected {dtype:?}",
                    weights.query.kernel().dtype()
                ));
            }
        };
        attention("self_attention", &self.self_attention, hidden);
        if let Some(cross) = &self.cross {
            attention("cross_attention", &cross.attention, shape.memory_hidden_units);
        }

        let expected = FeedForwardConfig::standard(hidden);
        if self.ffn.config() != &expected {
            errors.push(format!(
                "ffn maps {} -> {}, expected {} -> {}",
                self.ffn.config().hidden_size,
                self.ffn.config().intermediate_size,
                expected.hidden_size,
                expected.intermediate_size
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DecoderError::InvalidShape(errors.join("; ")))
        }
    }

    /// Randomly initialised weights with non-zero biases and norm affines,
    /// for tests and benchmarks.
    pub fn random(shape: &ShapeConfig, with_cross: bool, dtype: DType, device: &Device) -> Result<Self> {
        let hidden = shape.hidden_units();
        let cross = if with_cross {
            Some(CrossWeights {
                layernorm: random_norm(hidden, dtype, device)?,
                attention: random_attention(hidden, shape.memory_hidden_units, dtype, device)?,
            })
        } else {
            None
        };
        let ffn_config = FeedForwardConfig::standard(hidden);
        let ffn = FeedForward::new(
            random_dense(hidden, ffn_config.intermediate_size, dtype, device)?,
            random_dense(ffn_config.intermediate_size, hidden, dtype, device)?,
        )?;
        Ok(Self {
            self_layernorm: random_norm(hidden, dtype, device)?,
            self_attention: random_attention(hidden, hidden, dtype, device)?,
            cross,
            ffn_layernorm: random_norm(hidden, dtype, device)?,
            ffn,
        })
    }
}

fn random_dense(input: usize, output: usize, dtype: DType, device: &Device) -> Result<Dense> {
    let dense = Dense::with_init(
        LinearConfig::new(input, output),
        &LinearInit::XavierUniform,
        device,
        dtype,
    )?;
    let bias = Tensor::rand(-0.1f32, 0.1, output, device)?.to_dtype(dtype)?;
    Ok(dense.with_bias(bias)?)
}

fn random_attention(
    hidden: usize,
    source: usize,
    dtype: DType,
    device: &Device,
) -> Result<AttentionWeights> {
    Ok(AttentionWeights::new(
        random_dense(hidden, hidden, dtype, device)?,
        random_dense(source, hidden, dtype, device)?,
        random_dense(source, hidden, dtype, device)?,
        random_dense(hidden, hidden, dtype, device)?,
        source,
    )?)
}

fn random_norm(hidden: usize, dtype: DType, device: &Device) -> Result<LayerNorm> {
    let gamma = Tensor::rand(0.8f32, 1.2, hidden, device)?.to_dtype(dtype)?;
    let beta = Tensor::rand(-0.1f32, 0.1, hidden, device)?.to_dtype(dtype)?;
    Ok(LayerNorm::new(gamma, beta, NormConfig::new(hidden))?)
}

/// Device handle the step issues its work on.
///
/// Candle orders work per device, so one context corresponds to one ordered
/// stream. `debug_sync` makes debug builds block after every stage so a
/// device fault surfaces at the stage that raised it.
#[derive(Debug, Clone)]
pub struct ComputeContext {
    device: Device,
    debug_sync: bool,
}

impl ComputeContext {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            debug_sync: false,
        }
    }

    pub fn with_debug_sync(mut self, enabled: bool) -> Self {
        self.debug_sync = enabled;
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub(crate) fn stage_barrier(&self) -> Result<()> {
        if cfg!(debug_assertions) && self.debug_sync {
            self.device.synchronize()?;
        }
        Ok(())
    }
}

/// What [`DecoderStep::initialize`](crate::DecoderStep::initialize) binds.
#[derive(Debug, Clone)]
pub struct DecoderInitParam {
    pub weights: Arc<LayerWeights>,
    pub context: ComputeContext,
}
