//! Shared helpers: synthetic layers and a naive Vec-based reference decoder.

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use attention::AttentionWeights;
use candle_core::{DType, Device, Tensor};
use decoder::{
    ComputeContext, DecoderInitParam, DecoderStep, GemmAlgorithmTable, LayerWeights,
    MemoryInputs, ShapeConfig, StepInputs,
};
use layers::{Dense, Fp32, LayerNorm};

pub const EPS: f32 = 1e-6;

pub fn flat(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}

pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

/// Row-major matrix.
#[derive(Debug, Clone)]
pub struct Mat {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl Mat {
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let (rows, cols) = tensor.dims2()?;
        Ok(Self { rows, cols, data: flat(tensor)? })
    }

    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// `self · w + bias`.
    pub fn linear(&self, w: &Linear, with_bias: bool) -> Mat {
        assert_eq!(self.cols, w.kernel.rows);
        let n = w.kernel.cols;
        let mut data = vec![0f32; self.rows * n];
        for r in 0..self.rows {
            for c in 0..n {
                let mut acc = if with_bias { w.bias[c] } else { 0.0 };
                for k in 0..self.cols {
                    acc += self.data[r * self.cols + k] * w.kernel.data[k * n + c];
                }
                data[r * n + c] = acc;
            }
        }
        Mat { rows: self.rows, cols: n, data }
    }

    pub fn add(&self, other: &Mat) -> Mat {
        let data = self.data.iter().zip(&other.data).map(|(a, b)| a + b).collect();
        Mat { rows: self.rows, cols: self.cols, data }
    }

    pub fn add_bias(&self, bias: &[f32]) -> Mat {
        let data = self
            .data
            .iter()
            .enumerate()
            .map(|(i, v)| v + bias[i % self.cols])
            .collect();
        Mat { rows: self.rows, cols: self.cols, data }
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Mat {
        Mat { rows: self.rows, cols: self.cols, data: self.data.iter().map(|v| f(*v)).collect() }
    }
}

#[derive(Debug, Clone)]
pub struct Linear {
    pub kernel: Mat,
    pub bias: Vec<f32>,
}

impl Linear {
    fn from_dense(dense: &Dense) -> Result<Self> {
        Ok(Self {
            kernel: Mat::from_tensor(dense.kernel())?,
            bias: flat(dense.bias().expect("dense bias"))?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Norm {
    pub gamma: Vec<f32>,
    pub beta: Vec<f32>,
}

impl Norm {
    fn from_layer(layer: &LayerNorm) -> Result<Self> {
        Ok(Self { gamma: flat(layer.gamma())?, beta: flat(layer.beta())? })
    }

    pub fn apply(&self, x: &Mat) -> Mat {
        let mut data = Vec::with_capacity(x.data.len());
        for r in 0..x.rows {
            let row = x.row(r);
            let n = row.len() as f32;
            let mean = row.iter().sum::<f32>() / n;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
            let denom = (var + EPS).sqrt();
            for (c, v) in row.iter().enumerate() {
                data.push((v - mean) / denom * self.gamma[c] + self.beta[c]);
            }
        }
        Mat { rows: x.rows, cols: x.cols, data }
    }
}

#[derive(Debug, Clone)]
pub struct Attn {
    pub q: Linear,
    pub k: Linear,
    pub v: Linear,
    pub o: Linear,
}

impl Attn {
    fn from_weights(weights: &AttentionWeights) -> Result<Self> {
        Ok(Self {
            q: Linear::from_dense(&weights.query)?,
            k: Linear::from_dense(&weights.key)?,
            v: Linear::from_dense(&weights.value)?,
            o: Linear::from_dense(&weights.output)?,
        })
    }
}

/// Plain-Vec copy of a layer's weights.
#[derive(Debug, Clone)]
pub struct ReferenceLayer {
    pub shape: ShapeConfig,
    pub self_norm: Norm,
    pub self_attn: Attn,
    pub cross: Option<(Norm, Attn)>,
    pub ffn_norm: Norm,
    pub ffn_inner: Linear,
    pub ffn_output: Linear,
}

/// Caches as `[batch][max_seq_len][hidden]`, flattened.
#[derive(Debug, Clone)]
pub struct ReferenceCaches {
    pub key: Vec<f32>,
    pub value: Vec<f32>,
    pub memory_key: Vec<f32>,
    pub memory_value: Vec<f32>,
}

fn gelu(x: f32) -> f32 {
    let c = (2.0f32 / std::f32::consts::PI).sqrt();
    0.5 * x * (1.0 + (c * (x + 0.044715 * x * x * x)).tanh())
}

impl ReferenceLayer {
    pub fn from_weights(shape: ShapeConfig, weights: &LayerWeights) -> Result<Self> {
        let cross = match &weights.cross {
            Some(cross) => Some((Norm::from_layer(&cross.layernorm)?, Attn::from_weights(&cross.attention)?)),
            None => None,
        };
        Ok(Self {
            shape,
            self_norm: Norm::from_layer(&weights.self_layernorm)?,
            self_attn: Attn::from_weights(&weights.self_attention)?,
            cross,
            ffn_norm: Norm::from_layer(&weights.ffn_layernorm)?,
            ffn_inner: Linear::from_dense(weights.ffn.intermediate())?,
            ffn_output: Linear::from_dense(weights.ffn.output())?,
        })
    }

    /// Attention of `query` rows over `keys/values[b][0..len_b]`.
    fn attend(&self, query: &Mat, keys: &[f32], values: &[f32], lengths: &[usize]) -> Mat {
        let s = &self.shape;
        let hidden = s.hidden_units();
        let d = s.size_per_head;
        let scale = 1.0 / (d as f32).sqrt();
        let mut data = vec![0f32; s.batch_size * hidden];
        for b in 0..s.batch_size {
            for h in 0..s.head_num {
                let q = &query.row(b)[h * d..(h + 1) * d];
                let at = |cache: &[f32], j: usize| {
                    let base = (b * s.max_seq_len + j) * hidden + h * d;
                    cache[base..base + d].to_vec()
                };
                let scores: Vec<f32> = (0..lengths[b])
                    .map(|j| at(keys, j).iter().zip(q).map(|(k, q)| k * q).sum::<f32>() * scale)
                    .collect();
                let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                let exps: Vec<f32> = scores.iter().map(|v| (v - max).exp()).collect();
                let denom: f32 = exps.iter().sum();
                for (j, e) in exps.iter().enumerate() {
                    let v = at(values, j);
                    for t in 0..d {
                        data[b * hidden + h * d + t] += e / denom * v[t];
                    }
                }
            }
        }
        Mat { rows: s.batch_size, cols: hidden, data }
    }

    /// One step; writes the caches like the real decoder and returns the output.
    pub fn step(
        &self,
        from: &Mat,
        caches: &mut ReferenceCaches,
        memory: Option<(&Mat, &[usize])>,
        step: usize,
    ) -> Mat {
        let s = &self.shape;
        let hidden = s.hidden_units();
        let n1 = self.self_norm.apply(from);
        let q = n1.linear(&self.self_attn.q, true);
        let k = n1.linear(&self.self_attn.k, true);
        let v = n1.linear(&self.self_attn.v, true);
        for b in 0..s.batch_size {
            let base = (b * s.max_seq_len + step) * hidden;
            caches.key[base..base + hidden].copy_from_slice(k.row(b));
            caches.value[base..base + hidden].copy_from_slice(v.row(b));
        }
        let lengths = vec![step + 1; s.batch_size];
        let ctx = self.attend(&q, &caches.key, &caches.value, &lengths);
        let masked = ctx.linear(&self.self_attn.o, false);
        let acc1 = masked.add_bias(&self.self_attn.o.bias).add(from);

        let (ffn_in, residual, relu) = match (memory, &self.cross) {
            (Some((memory, mem_lengths)), Some((cross_norm, cross))) => {
                let n2 = cross_norm.apply(&acc1);
                if step == 0 {
                    let mk = memory.linear(&cross.k, true);
                    let mv = memory.linear(&cross.v, true);
                    caches.memory_key.copy_from_slice(&mk.data);
                    caches.memory_value.copy_from_slice(&mv.data);
                }
                let cq = n2.linear(&cross.q, true);
                let cctx = self.attend(&cq, &caches.memory_key, &caches.memory_value, mem_lengths);
                let cross_out = cctx.linear(&cross.o, false);
                let acc2 = cross_out.add_bias(&cross.o.bias).add(&acc1);
                (self.ffn_norm.apply(&acc2), acc2, true)
            }
            _ => (self.ffn_norm.apply(&acc1), acc1, false),
        };
        let inner = ffn_in
            .linear(&self.ffn_inner, true)
            .map(|x| if relu { x.max(0.0) } else { gelu(x) });
        inner.linear(&self.ffn_output, true).add(&residual)
    }
}

/// Caller-side state of one layer: workspace, caches, output buffer.
pub struct Harness {
    pub shape: ShapeConfig,
    pub weights: Arc<LayerWeights>,
    pub step: DecoderStep<Fp32>,
    pub workspace: Tensor,
    pub key_cache: Tensor,
    pub value_cache: Tensor,
    pub memory_key_cache: Tensor,
    pub memory_value_cache: Tensor,
    pub output: Tensor,
}

impl Harness {
    pub fn new(shape: ShapeConfig, with_cross: bool, table: GemmAlgorithmTable) -> Result<Self> {
        let device = Device::Cpu;
        let weights = Arc::new(LayerWeights::random(&shape, with_cross, DType::F32, &device)?);
        Self::with_weights(shape, weights, table)
    }

    pub fn with_weights(
        shape: ShapeConfig,
        weights: Arc<LayerWeights>,
        table: GemmAlgorithmTable,
    ) -> Result<Self> {
        let device = Device::Cpu;
        let mut step = DecoderStep::<Fp32>::with_gemm_table(shape, table)?;
        let workspace = Tensor::zeros(step.workspace_size(), DType::F32, &device)?;
        step.initialize(
            DecoderInitParam { weights: weights.clone(), context: ComputeContext::new(device.clone()) },
            &workspace,
        )?;
        let cache_dims = (shape.batch_size, shape.max_seq_len, shape.hidden_units());
        Ok(Self {
            shape,
            weights,
            step,
            workspace,
            key_cache: Tensor::zeros(cache_dims, DType::F32, &device)?,
            value_cache: Tensor::zeros(cache_dims, DType::F32, &device)?,
            memory_key_cache: Tensor::zeros(cache_dims, DType::F32, &device)?,
            memory_value_cache: Tensor::zeros(cache_dims, DType::F32, &device)?,
            output: Tensor::zeros((shape.batch_size, shape.hidden_units()), DType::F32, &device)?,
        })
    }

    /// Runs one step against the harness buffers.
    pub fn forward(&mut self, from: &Tensor, memory: Option<(&Tensor, &[usize])>, step: usize) -> Result<()> {
        let inputs = StepInputs {
            from_tensor: from,
            key_cache: &self.key_cache,
            value_cache: &self.value_cache,
            memory: memory.map(|(memory, lengths)| MemoryInputs {
                memory,
                key_cache: &self.memory_key_cache,
                value_cache: &self.memory_value_cache,
                lengths,
            }),
            decoder_output: &self.output,
            step,
            cross_attention: memory.is_some(),
        };
        self.step.forward(inputs)?;
        Ok(())
    }

    pub fn reference(&self) -> Result<ReferenceLayer> {
        ReferenceLayer::from_weights(self.shape, &self.weights)
    }

    pub fn reference_caches(&self) -> Result<ReferenceCaches> {
        Ok(ReferenceCaches {
            key: flat(&self.key_cache)?,
            value: flat(&self.value_cache)?,
            memory_key: flat(&self.memory_key_cache)?,
            memory_value: flat(&self.memory_value_cache)?,
        })
    }
}
