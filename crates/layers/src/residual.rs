//! Residual connections closing a decoder sublayer.
//!
//! Branches and residual streams are `(rows, hidden)` tensors. The sum is
//! formed in [`PrecisionPolicy::compute`] and cast back to storage, matching
//! the other fused epilogues in this crate.

use candle_core::{Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// `branch + bias + residual`.
///
/// Used for the last stage of a decoder step, where the feed-forward output
/// receives its contraction bias and the residual stream in one pass.
pub fn add_bias_residual(
    branch: &Tensor,
    bias: &Tensor,
    residual: &Tensor,
    policy: &PrecisionPolicy,
) -> Result<Tensor> {
    let dims = branch.dims();
    let hidden = *dims.last().unwrap_or(&0);
    checks::expect_shape("residual.stream", residual, dims)?;
    checks::expect_shape("residual.bias", bias, &[hidden])?;

    let sum = policy
        .cast_for_matmul(branch)?
        .broadcast_add(&policy.cast_for_matmul(bias)?)?
        .add(&policy.cast_for_matmul(residual)?)?;
    policy.cast_to_storage(&sum)
}
