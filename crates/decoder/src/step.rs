//! One decoder layer executing one decode position.
//!
//! Stages run strictly in order:
//!
//! 1. normalise the incoming hidden state;
//! 2. masked self-attention, writing this step's key/value into the self cache;
//! 3. encoder-decoder layers: residual + normalise, cross-attention against the
//!    memory cache, residual + normalise, ReLU feed-forward;
//!    decoder-only layers: residual + normalise, GELU feed-forward;
//! 4. final bias + residual add into the caller's output tensor.
//!
//! Every intermediate lands in the bound [`WorkspaceArena`]. Errors from the
//! numeric operations propagate unchanged; a failed step leaves the cache
//! slot for that position undefined.

use std::{marker::PhantomData, sync::Arc};

use attention::{
    CrossAttention, MaskedSelfAttention, MemoryKvCache, QkvProjections, SelfKvCache,
};
use candle_core::Tensor;
use layers::{
    add_bias_residual, linear::batched_gemm, ActivationKind, FeedForwardAlgorithms,
    FeedForwardLayer, NormalizationLayer, Precision, PrecisionPolicy,
};

use crate::{
    config::{DecoderConfig, ShapeConfig},
    error::{DecoderError, Result},
    gemm::{GemmAlgorithmTable, GemmSite},
    param::{ComputeContext, CrossWeights, DecoderInitParam, LayerWeights},
    trace::{NoopObserver, Stage, StageObserver},
    workspace::{FusedQkvTable, Region, WorkspaceArena, WorkspacePlan},
};

/// Which sublayers a step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionPattern {
    /// Self-attention, cross-attention, feed-forward.
    EncoderDecoder,
    /// Self-attention, feed-forward.
    DecoderOnly,
}

impl AttentionPattern {
    pub fn from_cross_attention(cross_attention: bool) -> Self {
        if cross_attention {
            AttentionPattern::EncoderDecoder
        } else {
            AttentionPattern::DecoderOnly
        }
    }

    /// Feed-forward activation, fixed by the pattern.
    pub fn activation(self) -> ActivationKind {
        match self {
            AttentionPattern::EncoderDecoder => ActivationKind::Relu,
            AttentionPattern::DecoderOnly => ActivationKind::Gelu,
        }
    }
}

/// Encoder-side inputs of a cross-attention step.
#[derive(Debug, Clone, Copy)]
pub struct MemoryInputs<'a> {
    /// `[batch, max_seq_len, memory_hidden_units]`.
    pub memory: &'a Tensor,
    pub key_cache: &'a Tensor,
    pub value_cache: &'a Tensor,
    /// Valid memory positions per batch entry, each in `1..=max_seq_len`.
    pub lengths: &'a [usize],
}

/// Arguments of [`DecoderStep::forward`].
#[derive(Debug, Clone, Copy)]
pub struct StepInputs<'a> {
    /// Hidden state entering the layer, `[batch, hidden]`.
    pub from_tensor: &'a Tensor,
    /// Self-attention caches, `[batch, max_seq_len, hidden]`.
    pub key_cache: &'a Tensor,
    pub value_cache: &'a Tensor,
    /// Required when `cross_attention` is set, never touched otherwise.
    pub memory: Option<MemoryInputs<'a>>,
    /// Receives the layer output, `[batch, hidden]`.
    pub decoder_output: &'a Tensor,
    pub step: usize,
    pub cross_attention: bool,
}

struct Binding {
    weights: Arc<LayerWeights>,
    context: ComputeContext,
    arena: WorkspaceArena,
    fused: Option<FusedQkvTable>,
}

/// Single-layer, single-step decoder for precision `P`.
pub struct DecoderStep<P: Precision> {
    shape: ShapeConfig,
    gemm: GemmAlgorithmTable,
    plan: WorkspacePlan,
    debug_sync: bool,
    masked: MaskedSelfAttention,
    cross: CrossAttention,
    observer: Arc<dyn StageObserver>,
    binding: Option<Binding>,
    _precision: PhantomData<P>,
}

impl<P: Precision> std::fmt::Debug for DecoderStep<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderStep")
            .field("precision", &P::OP)
            .field("shape", &self.shape)
            .field("gemm", &self.gemm)
            .field("initialized", &self.binding.is_some())
            .finish()
    }
}

impl<P: Precision> DecoderStep<P> {
    /// Validates the shape and reads the GEMM profile.
    pub fn new(config: &DecoderConfig) -> Result<Self> {
        config.shape.validate()?;
        let gemm = GemmAlgorithmTable::load::<P>(&config.gemm_profile)?;
        let mut step = Self::with_gemm_table(config.shape, gemm)?;
        step.debug_sync = config.debug_sync;
        Ok(step)
    }

    /// Uses an explicit algorithm table instead of a profile file.
    pub fn with_gemm_table(shape: ShapeConfig, gemm: GemmAlgorithmTable) -> Result<Self> {
        shape.validate()?;
        for site in GemmSite::ALL {
            let algorithm = gemm.algorithm(site);
            if !P::accepts(algorithm) {
                return Err(DecoderError::InvalidAlgorithm {
                    site,
                    algorithm,
                    precision: P::OP,
                });
            }
        }
        log::info!(
            "decoder step {} batch={} max_seq_len={} heads={} size_per_head={} memory={}: {gemm}",
            P::OP,
            shape.batch_size,
            shape.max_seq_len,
            shape.head_num,
            shape.size_per_head,
            shape.memory_hidden_units
        );
        Ok(Self {
            shape,
            gemm,
            plan: WorkspacePlan::for_shape::<P>(&shape),
            debug_sync: false,
            masked: MaskedSelfAttention::new(shape.attention()),
            cross: CrossAttention::new(shape.attention()),
            observer: Arc::new(NoopObserver),
            binding: None,
            _precision: PhantomData,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn StageObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn shape(&self) -> &ShapeConfig {
        &self.shape
    }

    pub fn gemm_table(&self) -> &GemmAlgorithmTable {
        &self.gemm
    }

    pub fn workspace_plan(&self) -> &WorkspacePlan {
        &self.plan
    }

    /// Elements of `P::STORAGE` the workspace buffer must hold.
    pub fn workspace_size(&self) -> usize {
        self.plan.total()
    }

    /// Binds weights and context and partitions `buffer`.
    ///
    /// Call before the first [`forward`](Self::forward) and again whenever
    /// the binding changes. The buffer is shared, not copied.
    pub fn initialize(&mut self, param: DecoderInitParam, buffer: &Tensor) -> Result<()> {
        param.weights.validate(&self.shape, P::STORAGE)?;
        let arena = WorkspaceArena::partition(self.plan, buffer)?;
        if !buffer.device().same_device(param.context.device()) {
            return Err(DecoderError::Workspace(
                "workspace buffer lives on a different device than the compute context".into(),
            ));
        }
        let fused = if self.gemm.fuse_qkv() {
            let attention = &param.weights.self_attention;
            Some(FusedQkvTable::stage(
                &attention.query,
                &attention.key,
                &attention.value,
            )?)
        } else {
            None
        };
        log::debug!(
            "decoder step bound: workspace={} elements fused_qkv={}",
            self.plan.total(),
            fused.is_some()
        );
        let context = if self.debug_sync {
            param.context.with_debug_sync(true)
        } else {
            param.context
        };
        self.binding = Some(Binding {
            weights: param.weights,
            context,
            arena,
            fused,
        });
        Ok(())
    }

    /// Runs every stage for position `inputs.step`.
    pub fn forward(&mut self, inputs: StepInputs<'_>) -> Result<()> {
        let binding = self.binding.as_ref().ok_or(DecoderError::NotInitialized)?;
        let policy = P::policy();
        let pattern = AttentionPattern::from_cross_attention(inputs.cross_attention);
        self.check_inputs(&inputs, binding)?;
        log::debug!("decoder step {} pattern={pattern:?}", inputs.step);

        let weights = binding.weights.as_ref();
        let arena = &binding.arena;
        let projection = self.gemm.algorithm(GemmSite::Projection);

        let normalized = weights.self_layernorm.forward(inputs.from_tensor, &policy)?;
        arena.store(Region::NormalizedInput, &normalized)?;
        self.stage_done(binding, Stage::SelfNorm, inputs.step, Region::NormalizedInput)?;

        self.project_qkv(binding, &policy)?;
        let projections = QkvProjections {
            query: arena.read(Region::Query)?,
            key: arena.read(Region::Key)?,
            value: arena.read(Region::Value)?,
        };
        let self_cache = SelfKvCache::new(
            self.shape.cache_layout(),
            inputs.key_cache,
            inputs.value_cache,
        )?;
        let context = self.masked.attend_step(
            &projections,
            &weights.self_attention,
            &self_cache,
            inputs.step,
            &policy,
        )?;
        arena.store(Region::Context, &context)?;
        let masked = weights.self_attention.output.forward_without_bias(
            &arena.read(Region::Context)?,
            projection,
            &policy,
        )?;
        arena.store(Region::MaskedOutput, &masked)?;
        self.stage_done(binding, Stage::MaskedAttention, inputs.step, Region::MaskedOutput)?;

        let self_output_bias = weights.self_attention.output.require_bias("self attention output")?;
        let (ffn_input, residual) = match pattern {
            AttentionPattern::EncoderDecoder => {
                let cross_weights = weights.cross.as_ref().ok_or_else(|| {
                    DecoderError::InvalidInput("layer has no cross-attention weights".into())
                })?;
                let memory = inputs.memory.ok_or_else(|| {
                    DecoderError::InvalidInput("cross-attention step without memory inputs".into())
                })?;
                let norm = cross_weights.layernorm.forward_add_bias_residual(
                    inputs.from_tensor,
                    &arena.read(Region::MaskedOutput)?,
                    self_output_bias,
                    &policy,
                )?;
                arena.store(Region::MaskedOutput, &norm.accumulated)?;
                arena.store(Region::NormalizedMaskedOutput, &norm.normalized)?;
                self.stage_done(binding, Stage::CrossNorm, inputs.step, Region::NormalizedMaskedOutput)?;

                self.cross_attention(binding, cross_weights, memory, inputs.step, &policy)?;
                self.stage_done(binding, Stage::CrossAttention, inputs.step, Region::CrossOutput)?;

                let norm = weights.ffn_layernorm.forward_add_bias_residual(
                    &arena.read(Region::MaskedOutput)?,
                    &arena.read(Region::CrossOutput)?,
                    cross_weights
                        .attention
                        .output
                        .require_bias("cross attention output")?,
                    &policy,
                )?;
                arena.store(Region::CrossOutput, &norm.accumulated)?;
                arena.store(Region::NormalizedCrossOutput, &norm.normalized)?;
                self.stage_done(binding, Stage::FfnNorm, inputs.step, Region::NormalizedCrossOutput)?;
                (Region::NormalizedCrossOutput, Region::CrossOutput)
            }
            AttentionPattern::DecoderOnly => {
                let norm = weights.ffn_layernorm.forward_add_bias_residual(
                    inputs.from_tensor,
                    &arena.read(Region::MaskedOutput)?,
                    self_output_bias,
                    &policy,
                )?;
                arena.store(Region::MaskedOutput, &norm.accumulated)?;
                arena.store(Region::NormalizedMaskedOutput, &norm.normalized)?;
                self.stage_done(binding, Stage::FfnNorm, inputs.step, Region::NormalizedMaskedOutput)?;
                (Region::NormalizedMaskedOutput, Region::MaskedOutput)
            }
        };

        let ffn = weights.ffn.forward(
            &arena.read(ffn_input)?,
            pattern.activation(),
            FeedForwardAlgorithms {
                inner: self.gemm.algorithm(GemmSite::FfnInner),
                output: self.gemm.algorithm(GemmSite::FfnOutput),
            },
            &policy,
        )?;
        arena.store(Region::FfnInner, &ffn.inner)?;
        self.stage_done(binding, Stage::FfnInner, inputs.step, Region::FfnInner)?;

        let output = add_bias_residual(
            &ffn.output,
            weights.ffn.output_bias()?,
            &arena.read(residual)?,
            &policy,
        )?;
        inputs
            .decoder_output
            .slice_set(&policy.cast_to_storage(&output)?.contiguous()?, 0, 0)?;
        binding.context.stage_barrier()?;
        self.observer
            .observe(Stage::Output, inputs.step, inputs.decoder_output)?;
        Ok(())
    }

    fn check_inputs(&self, inputs: &StepInputs<'_>, binding: &Binding) -> Result<()> {
        let shape = &self.shape;
        if inputs.step >= shape.max_seq_len {
            return Err(DecoderError::StepOutOfRange {
                step: inputs.step,
                max_seq_len: shape.max_seq_len,
            });
        }
        let rows_hidden = [shape.batch_size, shape.hidden_units()];
        for (name, tensor) in [
            ("from_tensor", inputs.from_tensor),
            ("decoder_output", inputs.decoder_output),
        ] {
            if tensor.dims() != rows_hidden {
                return Err(DecoderError::InvalidInput(format!(
                    "{name} must be {rows_hidden:?}, got {:?}",
                    tensor.dims()
                )));
            }
            if tensor.dtype() != P::STORAGE {
                return Err(DecoderError::InvalidInput(format!(
                    "{name} must be {:?}, got {:?}",
                    P::STORAGE,
                    tensor.dtype()
                )));
            }
            if !tensor.device().same_device(binding.context.device()) {
                return Err(DecoderError::InvalidInput(format!(
                    "{name} lives on a different device than the compute context"
                )));
            }
        }
        if !inputs.decoder_output.is_contiguous() {
            return Err(DecoderError::InvalidInput(
                "decoder_output must be contiguous".into(),
            ));
        }
        if inputs.cross_attention {
            if binding.weights.cross.is_none() {
                return Err(DecoderError::InvalidInput(
                    "layer has no cross-attention weights".into(),
                ));
            }
            let memory = inputs.memory.ok_or_else(|| {
                DecoderError::InvalidInput("cross-attention step without memory inputs".into())
            })?;
            let expected = [shape.batch_size, shape.max_seq_len, shape.memory_hidden_units];
            if memory.memory.dims() != expected {
                return Err(DecoderError::InvalidInput(format!(
                    "memory must be {expected:?}, got {:?}",
                    memory.memory.dims()
                )));
            }
            if memory.lengths.len() != shape.batch_size {
                return Err(DecoderError::InvalidInput(format!(
                    "expected {} memory lengths, got {}",
                    shape.batch_size,
                    memory.lengths.len()
                )));
            }
            if let Some(len) = memory
                .lengths
                .iter()
                .find(|len| **len == 0 || **len > shape.max_seq_len)
            {
                return Err(DecoderError::InvalidInput(format!(
                    "memory length {len} outside 1..={}",
                    shape.max_seq_len
                )));
            }
        }
        Ok(())
    }

    /// Fills the Q/K/V regions, fused or split.
    fn project_qkv(&self, binding: &Binding, policy: &PrecisionPolicy) -> Result<()> {
        let arena = &binding.arena;
        let input = arena.read(FusedQkvTable::INPUT)?;
        match &binding.fused {
            Some(table) => {
                let rows = input.dims()[0];
                let hidden = self.shape.hidden_units();
                let inputs = input.unsqueeze(0)?.broadcast_as((3, rows, hidden))?;
                let qkv = batched_gemm(
                    &inputs,
                    table.kernels(),
                    self.gemm.algorithm(GemmSite::FusedQkv),
                    policy,
                )?;
                arena.store_qkv(&qkv)?;
            }
            None => {
                let projected = binding.weights.self_attention.project_qkv(
                    &input,
                    self.gemm.algorithm(GemmSite::Projection),
                    policy,
                )?;
                let [query, key, value] = FusedQkvTable::OUTPUTS;
                arena.store(query, &projected.query)?;
                arena.store(key, &projected.key)?;
                arena.store(value, &projected.value)?;
            }
        }
        Ok(())
    }

    /// Cross-attention from the normalised masked output into `CrossOutput`.
    fn cross_attention(
        &self,
        binding: &Binding,
        weights: &CrossWeights,
        memory: MemoryInputs<'_>,
        step: usize,
        policy: &PrecisionPolicy,
    ) -> Result<()> {
        let arena = &binding.arena;
        let projection = self.gemm.algorithm(GemmSite::Projection);
        let cache = MemoryKvCache::new(
            self.shape.cache_layout(),
            memory.key_cache,
            memory.value_cache,
        )?;
        if step == 0 {
            self.cross.fill_memory(
                memory.memory,
                &weights.attention,
                &cache,
                self.gemm.algorithm(GemmSite::MemoryProjection),
                policy,
            )?;
        }
        let query = weights.attention.query.forward_without_bias(
            &arena.read(Region::NormalizedMaskedOutput)?,
            projection,
            policy,
        )?;
        arena.store(Region::Query, &query)?;
        let context = self.cross.attend_step(
            &arena.read(Region::Query)?,
            &weights.attention,
            &cache,
            memory.lengths,
            policy,
        )?;
        arena.store(Region::Context, &context)?;
        let output = weights.attention.output.forward_without_bias(
            &arena.read(Region::Context)?,
            projection,
            policy,
        )?;
        arena.store(Region::CrossOutput, &output)?;
        Ok(())
    }

    fn stage_done(&self, binding: &Binding, stage: Stage, step: usize, region: Region) -> Result<()> {
        binding.context.stage_barrier()?;
        self.observer.observe(stage, step, &binding.arena.read(region)?)
    }
}
