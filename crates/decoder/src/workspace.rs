//! Scratch arena of one decoder layer.
//!
//! The caller hands over a single rank-1 buffer; [`WorkspacePlan`] carves it
//! into named regions by offset arithmetic over the unit
//! `batch_size * hidden_units`:
//!
//! | region | units |
//! |---|---|
//! | normalized input | 1 |
//! | query, key, value (adjacent) | 3 |
//! | attention context | 1 |
//! | masked-attention output and its norm | 2 |
//! | cross-attention output and its norm | 2 |
//! | feed-forward inner activation | 4 |
//!
//! Thirteen units in total, followed by a tail sized for the nine-entry
//! pointer table a device backend stages for the fused Q/K/V call.

use std::mem::size_of;

use candle_core::{DType, Tensor};
use layers::{Dense, Precision};

use crate::config::ShapeConfig;
use crate::error::{DecoderError, Result};

/// Pointer-table entries: three kernels, three inputs, three outputs.
pub const POINTER_TABLE_ENTRIES: usize = 9;

/// Named sub-buffers of the arena, in layout order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    NormalizedInput,
    Query,
    Key,
    Value,
    Context,
    MaskedOutput,
    NormalizedMaskedOutput,
    CrossOutput,
    NormalizedCrossOutput,
    FfnInner,
}

impl Region {
    pub const ALL: [Region; 10] = [
        Region::NormalizedInput,
        Region::Query,
        Region::Key,
        Region::Value,
        Region::Context,
        Region::MaskedOutput,
        Region::NormalizedMaskedOutput,
        Region::CrossOutput,
        Region::NormalizedCrossOutput,
        Region::FfnInner,
    ];

    /// Position in [`Region::ALL`].
    const fn index(self) -> usize {
        match self {
            Region::NormalizedInput => 0,
            Region::Query => 1,
            Region::Key => 2,
            Region::Value => 3,
            Region::Context => 4,
            Region::MaskedOutput => 5,
            Region::NormalizedMaskedOutput => 6,
            Region::CrossOutput => 7,
            Region::NormalizedCrossOutput => 8,
            Region::FfnInner => 9,
        }
    }

    /// Offset in units; every region before the feed-forward one is a
    /// single unit wide.
    const fn unit_offset(self) -> usize {
        self.index()
    }

    const fn units(self) -> usize {
        match self {
            Region::FfnInner => 4,
            _ => 1,
        }
    }
}

/// Units occupied by the ten regions.
pub const REGION_UNITS: usize = 13;

/// Element offsets of every region for one shape and precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspacePlan {
    unit: usize,
    rows: usize,
    pointer_table_len: usize,
    dtype: DType,
}

impl WorkspacePlan {
    pub fn for_shape<P: Precision>(shape: &ShapeConfig) -> Self {
        let pointer_bytes = POINTER_TABLE_ENTRIES * size_of::<*const u8>();
        let element = P::STORAGE.size_in_bytes();
        Self {
            unit: shape.batch_size * shape.hidden_units(),
            rows: shape.batch_size,
            pointer_table_len: pointer_bytes.div_ceil(element),
            dtype: P::STORAGE,
        }
    }

    /// `batch_size * hidden_units` elements.
    pub fn unit(&self) -> usize {
        self.unit
    }

    pub fn offset(&self, region: Region) -> usize {
        region.unit_offset() * self.unit
    }

    pub fn len(&self, region: Region) -> usize {
        region.units() * self.unit
    }

    pub fn pointer_table_offset(&self) -> usize {
        REGION_UNITS * self.unit
    }

    /// Pointer table size, rounded up to whole elements.
    pub fn pointer_table_len(&self) -> usize {
        self.pointer_table_len
    }

    /// Elements the caller must provide.
    pub fn total(&self) -> usize {
        self.pointer_table_offset() + self.pointer_table_len
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

/// Bounded views over a caller-owned buffer, computed once per binding.
///
/// Views share storage with the caller's buffer; the arena never allocates.
#[derive(Debug, Clone)]
pub struct WorkspaceArena {
    plan: WorkspacePlan,
    views: Vec<Tensor>,
    qkv: Tensor,
}

impl WorkspaceArena {
    pub fn partition(plan: WorkspacePlan, buffer: &Tensor) -> Result<Self> {
        let len = match buffer.dims() {
            [len] => *len,
            dims => {
                return Err(DecoderError::Workspace(format!(
                    "buffer must be rank 1, got {dims:?}"
                )))
            }
        };
        if buffer.dtype() != plan.dtype {
            return Err(DecoderError::Workspace(format!(
                "buffer dtype {:?} does not match precision dtype {:?}",
                buffer.dtype(),
                plan.dtype
            )));
        }
        if !buffer.is_contiguous() {
            return Err(DecoderError::Workspace("buffer must be contiguous".into()));
        }
        if len < plan.total() {
            return Err(DecoderError::Workspace(format!(
                "buffer holds {len} elements, plan needs {}",
                plan.total()
            )));
        }
        let views = Region::ALL
            .iter()
            .map(|&region| buffer.narrow(0, plan.offset(region), plan.len(region)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let qkv = buffer.narrow(0, plan.offset(Region::Query), 3 * plan.unit)?;
        Ok(Self { plan, views, qkv })
    }

    fn view(&self, region: Region) -> &Tensor {
        &self.views[region.index()]
    }

    /// The region as `[rows, width]`, sharing storage with the arena.
    pub fn read(&self, region: Region) -> Result<Tensor> {
        let width = self.plan.len(region) / self.plan.rows;
        Ok(self.view(region).reshape((self.plan.rows, width))?)
    }

    /// Copies `tensor` into `region`; the element counts must match.
    pub fn store(&self, region: Region, tensor: &Tensor) -> Result<()> {
        store_into(self.view(region), &format!("{region:?}"), tensor)
    }

    /// Copies a `[3, rows, hidden]` tensor over the adjoining Q/K/V regions.
    pub fn store_qkv(&self, tensor: &Tensor) -> Result<()> {
        store_into(&self.qkv, "Query..Value", tensor)
    }
}

fn store_into(view: &Tensor, name: &str, tensor: &Tensor) -> Result<()> {
    if tensor.elem_count() != view.elem_count() {
        return Err(DecoderError::Workspace(format!(
            "{name} holds {} elements, got tensor {:?}",
            view.elem_count(),
            tensor.dims()
        )));
    }
    let flat = tensor
        .flatten_all()?
        .to_dtype(view.dtype())?
        .contiguous()?;
    view.slice_set(&flat, 0, 0)?;
    Ok(())
}

/// Host-side stand-in for the fused Q/K/V pointer table: the stacked
/// kernels, staged once per binding, plus the input and output regions the
/// batched call reads and writes.
#[derive(Debug, Clone)]
pub struct FusedQkvTable {
    kernels: Tensor,
}

impl FusedQkvTable {
    pub const INPUT: Region = Region::NormalizedInput;
    pub const OUTPUTS: [Region; 3] = [Region::Query, Region::Key, Region::Value];

    pub fn stage(query: &Dense, key: &Dense, value: &Dense) -> Result<Self> {
        let kernels = Tensor::stack(&[query.kernel(), key.kernel(), value.kernel()], 0)?;
        Ok(Self { kernels })
    }

    /// `[3, hidden, hidden]`.
    pub fn kernels(&self) -> &Tensor {
        &self.kernels
    }
}
