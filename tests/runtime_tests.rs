use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use decoder_runtime::{
    decoder::{ComputeContext, GemmAlgorithmTable},
    layers::Fp32,
    setup_device, DecoderInitParam, DecoderStep, LayerWeights, ShapeConfig, StepInputs,
};

#[test]
fn test_forced_cpu_device() {
    std::env::set_var("CANDLE_FORCE_CPU", "1");
    let device = setup_device().unwrap();
    assert!(device.is_cpu());
}

struct Layer {
    step: DecoderStep<Fp32>,
    key_cache: Tensor,
    value_cache: Tensor,
}

/// Two layers chained position by position, sharing one workspace buffer.
#[test]
fn stacked_layers_decode_a_sequence() {
    let device = Device::Cpu;
    let shape = ShapeConfig::new(2, 6, 2, 8, 16).unwrap();
    let hidden = shape.hidden_units();

    let mut layers: Vec<Layer> = (0..2)
        .map(|_| {
            let step = DecoderStep::<Fp32>::with_gemm_table(
                shape,
                GemmAlgorithmTable::defaults::<Fp32>(),
            )
            .unwrap();
            let cache = (shape.batch_size, shape.max_seq_len, hidden);
            Layer {
                step,
                key_cache: Tensor::zeros(cache, DType::F32, &device).unwrap(),
                value_cache: Tensor::zeros(cache, DType::F32, &device).unwrap(),
            }
        })
        .collect();
    let workspace = Tensor::zeros(layers[0].step.workspace_size(), DType::F32, &device).unwrap();
    for layer in &mut layers {
        let weights = LayerWeights::random(&shape, false, DType::F32, &device).unwrap();
        layer
            .step
            .initialize(
                DecoderInitParam {
                    weights: Arc::new(weights),
                    context: ComputeContext::new(device.clone()),
                },
                &workspace,
            )
            .unwrap();
    }

    let outputs = [
        Tensor::zeros((shape.batch_size, hidden), DType::F32, &device).unwrap(),
        Tensor::zeros((shape.batch_size, hidden), DType::F32, &device).unwrap(),
    ];
    for position in 0..shape.max_seq_len {
        let mut hidden_state = Tensor::randn(0f32, 1.0, (shape.batch_size, hidden), &device).unwrap();
        for (layer, output) in layers.iter_mut().zip(&outputs) {
            layer
                .step
                .forward(StepInputs {
                    from_tensor: &hidden_state,
                    key_cache: &layer.key_cache,
                    value_cache: &layer.value_cache,
                    memory: None,
                    decoder_output: output,
                    step: position,
                    cross_attention: false,
                })
                .unwrap();
            hidden_state = output.copy().unwrap();
        }
        let values = hidden_state.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite()), "position {position}");
    }

    // Every cache slot of every layer was written.
    for layer in &layers {
        let slots = layer
            .key_cache
            .abs()
            .unwrap()
            .sum(2)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert!(slots.iter().flatten().all(|s| *s > 0.0));
    }
}
