//! Precision and dtype policy utilities used throughout the layers crate.
//!
//! A decoder instance is compiled against one [`Precision`] marker type. The
//! marker fixes the element type of weights, activations and workspace, the
//! dtype the dense matrix multiplies run in, and the range of GEMM algorithm
//! identifiers that are legal for that precision. [`PrecisionPolicy`] is the
//! runtime view of the same choice, used by every layer to cast tensors
//! before matmuls, reductions, or final outputs.

use std::fmt;

use candle_core::{DType, Result, Tensor};

use crate::linear::GemmAlgorithm;

/// Numeric mode of a decoder instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    /// 32-bit floating point everywhere.
    Fp32,
    /// 16-bit floating point storage with tensor-op GEMMs.
    Fp16,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Fp32 => f.write_str("fp32"),
            OperationType::Fp16 => f.write_str("fp16"),
        }
    }
}

/// Compile-time precision selection for a decoder instance.
///
/// Implementations are zero-sized markers; no runtime switching between them
/// is possible once a decoder has been instantiated.
pub trait Precision: Send + Sync + 'static {
    /// Operation type reported in logs and errors.
    const OP: OperationType;
    /// Dtype of weights, activations, caches and workspace.
    const STORAGE: DType;
    /// Dtype dense matrix multiplies run in.
    const COMPUTE: DType;
    /// Dtype used for statistics (layer norm moments, softmax).
    const REDUCTION: DType;
    /// Algorithm used when no profiling data is available.
    const DEFAULT_ALGORITHM: GemmAlgorithm;
    /// Smallest legal algorithm identifier.
    const MIN_ALGORITHM: GemmAlgorithm;
    /// Largest legal algorithm identifier.
    const MAX_ALGORITHM: GemmAlgorithm;

    /// Whether `algorithm` may be issued under this precision.
    fn accepts(algorithm: GemmAlgorithm) -> bool {
        (Self::MIN_ALGORITHM..=Self::MAX_ALGORITHM).contains(&algorithm)
    }

    /// Runtime policy derived from the compile-time selection.
    fn policy() -> PrecisionPolicy {
        PrecisionPolicy::new(Self::STORAGE, Self::COMPUTE, Self::REDUCTION)
    }
}

/// Full 32-bit precision.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fp32;

impl Precision for Fp32 {
    const OP: OperationType = OperationType::Fp32;
    const STORAGE: DType = DType::F32;
    const COMPUTE: DType = DType::F32;
    const REDUCTION: DType = DType::F32;
    const DEFAULT_ALGORITHM: GemmAlgorithm = GemmAlgorithm::DEFAULT;
    const MIN_ALGORITHM: GemmAlgorithm = GemmAlgorithm::DEFAULT;
    const MAX_ALGORITHM: GemmAlgorithm = GemmAlgorithm::ALGO23;
}

/// Half precision with tensor-op matrix units.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fp16;

impl Precision for Fp16 {
    const OP: OperationType = OperationType::Fp16;
    const STORAGE: DType = DType::F16;
    const COMPUTE: DType = DType::F16;
    const REDUCTION: DType = DType::F32;
    const DEFAULT_ALGORITHM: GemmAlgorithm = GemmAlgorithm::DEFAULT_TENSOR_OP;
    const MIN_ALGORITHM: GemmAlgorithm = GemmAlgorithm::DEFAULT_TENSOR_OP;
    const MAX_ALGORITHM: GemmAlgorithm = GemmAlgorithm::ALGO15_TENSOR_OP;
}

/// Describes how tensors should be cast during different phases of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Constructs a new policy from explicit dtype selections.
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Returns the dtype used to store parameters and outputs.
    pub fn storage(&self) -> DType {
        self.storage
    }

    /// Returns the dtype used for matmuls and activation evaluation.
    pub fn compute(&self) -> DType {
        self.compute
    }

    /// Returns the dtype used for reductions such as layer norm statistics.
    pub fn reduction(&self) -> DType {
        self.reduction
    }

    /// Casts a tensor to the compute dtype for matmul readiness.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor to the reduction dtype for statistics.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    /// Casts a tensor back to the storage dtype (or leaves it unchanged).
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn fp16_policy_reduces_in_f32() {
        let policy = Fp16::policy();
        assert_eq!(policy.storage(), DType::F16);
        assert_eq!(policy.compute(), DType::F16);
        assert_eq!(policy.reduction(), DType::F32);
        assert_eq!(Fp32::policy().reduction(), DType::F32);
    }

    #[test]
    fn algorithm_ranges_are_disjoint() {
        for raw in -1..=23 {
            let algo = GemmAlgorithm::new(raw);
            assert!(Fp32::accepts(algo), "fp32 should accept {raw}");
            assert!(!Fp16::accepts(algo), "fp16 should reject {raw}");
        }
        for raw in 99..=115 {
            let algo = GemmAlgorithm::new(raw);
            assert!(Fp16::accepts(algo), "fp16 should accept {raw}");
            assert!(!Fp32::accepts(algo), "fp32 should reject {raw}");
        }
        assert!(!Fp32::accepts(GemmAlgorithm::new(24)));
        assert!(!Fp32::accepts(GemmAlgorithm::new(-2)));
        assert!(!Fp16::accepts(GemmAlgorithm::new(116)));
        assert!(!Fp16::accepts(GemmAlgorithm::new(98)));
    }

    #[test]
    fn defaults_fall_inside_their_ranges() {
        assert!(Fp32::accepts(Fp32::DEFAULT_ALGORITHM));
        assert!(Fp16::accepts(Fp16::DEFAULT_ALGORITHM));
    }

    #[test]
    fn cast_round_trip_preserves_values_within_tolerance() -> Result<()> {
        let device = Device::Cpu;
        let policy = Fp16::policy();
        let base = Tensor::from_vec(vec![0.125f32, -0.75, 3.5], (3,), &device)?;
        let storage = policy.cast_to_storage(&base)?;
        assert_eq!(storage.dtype(), DType::F16);

        let reduced = policy.cast_for_reduction(&storage)?;
        assert_eq!(reduced.dtype(), DType::F32);

        let original = base.to_vec1::<f32>()?;
        let restored = reduced.to_vec1::<f32>()?;
        for (orig, rest) in original.iter().zip(restored.iter()) {
            assert!((orig - rest).abs() <= 5e-3);
        }
        Ok(())
    }
}
