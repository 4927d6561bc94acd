use super::*;
use crate::kv_cache::{CacheLayout, MemoryKvCache, SelfKvCache};
use candle_core::{DType, Device};
use layers::{Fp32, LinearConfig, LinearInit, Precision};
use static_assertions::assert_impl_all;

assert_impl_all!(MaskedSelfAttention: Send, Sync);
assert_impl_all!(CrossAttention: Send, Sync);

const BATCH: usize = 2;
const SEQ: usize = 4;

fn config() -> AttentionConfig {
    AttentionConfig::new(2, 4)
}

fn dense(input: usize, output: usize, device: &Device) -> Dense {
    let dense = Dense::with_init(
        LinearConfig::new(input, output),
        &LinearInit::XavierUniform,
        device,
        DType::F32,
    )
    .unwrap();
    let bias = Tensor::rand(-0.5f32, 0.5, output, device).unwrap();
    dense.with_bias(bias).unwrap()
}

fn weights(source: usize, device: &Device) -> AttentionWeights {
    let hidden = config().hidden();
    AttentionWeights::new(
        dense(hidden, hidden, device),
        dense(source, hidden, device),
        dense(source, hidden, device),
        dense(hidden, hidden, device),
        source,
    )
    .unwrap()
}

fn self_cache(device: &Device) -> (Tensor, Tensor, SelfKvCache) {
    let layout = CacheLayout::new(BATCH, SEQ, config());
    let keys = Tensor::zeros((BATCH, SEQ, 8), DType::F32, device).unwrap();
    let values = keys.zeros_like().unwrap();
    let cache = SelfKvCache::new(layout, &keys, &values).unwrap();
    (keys, values, cache)
}

#[test]
fn weights_reject_mismatched_source_width() {
    let device = Device::Cpu;
    let err = AttentionWeights::new(
        dense(8, 8, &device),
        dense(6, 8, &device),
        dense(8, 8, &device),
        dense(8, 8, &device),
        6,
    )
    .unwrap_err();
    assert!(matches!(err, AttentionError::InvalidShape { .. }));
}

#[test]
fn first_step_context_is_the_biased_value() {
    // With a single visible position the softmax weight is 1, so the context
    // equals that position's value row.
    let device = Device::Cpu;
    let policy = Fp32::policy();
    let weights = weights(8, &device);
    let (_, values, cache) = self_cache(&device);
    let input = Tensor::randn(0f32, 1.0, (BATCH, 8), &device).unwrap();

    let projected = weights
        .project_qkv(&input, GemmAlgorithm::DEFAULT, &policy)
        .unwrap();
    let layer = MaskedSelfAttention::new(config());
    let context = layer
        .attend_step(&projected, &weights, &cache, 0, &policy)
        .unwrap();

    let expected = weights
        .value
        .forward(&input, GemmAlgorithm::DEFAULT, &policy)
        .unwrap();
    let diff = context
        .sub(&expected)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_vec0::<f32>()
        .unwrap();
    assert!(diff < 1e-5);
    let stored = values.narrow(1, 0, 1).unwrap().squeeze(1).unwrap();
    assert_eq!(stored.to_vec2::<f32>().unwrap(), expected.to_vec2::<f32>().unwrap());
}

#[test]
fn later_steps_leave_earlier_slots_unchanged() {
    let device = Device::Cpu;
    let policy = Fp32::policy();
    let weights = weights(8, &device);
    let (keys, _, cache) = self_cache(&device);
    let layer = MaskedSelfAttention::new(config());

    let mut snapshots = Vec::new();
    for step in 0..3 {
        let input = Tensor::randn(0f32, 1.0, (BATCH, 8), &device).unwrap();
        let projected = weights
            .project_qkv(&input, GemmAlgorithm::DEFAULT, &policy)
            .unwrap();
        let context = layer
            .attend_step(&projected, &weights, &cache, step, &policy)
            .unwrap();
        assert_eq!(context.dims(), &[BATCH, 8]);
        snapshots.push(keys.narrow(1, step, 1).unwrap().to_vec3::<f32>().unwrap());
    }
    for (step, snapshot) in snapshots.iter().enumerate() {
        assert_eq!(&keys.narrow(1, step, 1).unwrap().to_vec3::<f32>().unwrap(), snapshot);
    }
    let untouched = keys.narrow(1, 3, 1).unwrap().abs().unwrap().sum_all().unwrap();
    assert_eq!(untouched.to_vec0::<f32>().unwrap(), 0.0);
}

#[test]
fn cross_attention_ignores_memory_past_each_length() {
    let device = Device::Cpu;
    let policy = Fp32::policy();
    let memory_width = 6;
    let weights = weights(memory_width, &device);
    let layout = CacheLayout::new(BATCH, SEQ, config());
    let layer = CrossAttention::new(config());
    let lengths = [2usize, 3];
    let query = Tensor::randn(0f32, 1.0, (BATCH, 8), &device).unwrap();

    let memory = Tensor::randn(0f32, 1.0, (BATCH, SEQ, memory_width), &device).unwrap();
    // Same valid prefix, different padding content.
    let noise = Tensor::randn(0f32, 10.0, (BATCH, SEQ, memory_width), &device).unwrap();
    let keep = Tensor::from_vec(
        vec![1f32, 1., 0., 0., 1., 1., 1., 0.],
        (BATCH, SEQ, 1),
        &device,
    )
    .unwrap();
    let drop = keep.affine(-1.0, 1.0).unwrap();
    let padded = memory
        .broadcast_mul(&keep)
        .unwrap()
        .add(&noise.broadcast_mul(&drop).unwrap())
        .unwrap();

    let mut outputs = Vec::new();
    for source in [&memory, &padded] {
        let keys = Tensor::zeros((BATCH, SEQ, 8), DType::F32, &device).unwrap();
        let values = keys.zeros_like().unwrap();
        let cache = MemoryKvCache::new(layout, &keys, &values).unwrap();
        layer
            .fill_memory(source, &weights, &cache, GemmAlgorithm::DEFAULT, &policy)
            .unwrap();
        outputs.push(
            layer
                .attend_step(&query, &weights, &cache, &lengths, &policy)
                .unwrap(),
        );
    }
    let diff = outputs[0]
        .sub(&outputs[1])
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_vec0::<f32>()
        .unwrap();
    assert!(diff < 1e-5, "padding leaked into context by {diff}");
}

#[test]
fn cross_attention_requires_one_length_per_batch_entry() {
    let device = Device::Cpu;
    let policy = Fp32::policy();
    let weights = weights(8, &device);
    let layout = CacheLayout::new(BATCH, SEQ, config());
    let keys = Tensor::zeros((BATCH, SEQ, 8), DType::F32, &device).unwrap();
    let cache = MemoryKvCache::new(layout, &keys, &keys.zeros_like().unwrap()).unwrap();
    let query = Tensor::zeros((BATCH, 8), DType::F32, &device).unwrap();
    let err = CrossAttention::new(config())
        .attend_step(&query, &weights, &cache, &[SEQ], &policy)
        .unwrap_err();
    assert!(matches!(err, AttentionError::InvalidShape { .. }));
}
