//! Linear combination of prototype masks.

use burn::{prelude::*, tensor::activation::sigmoid};

use crate::error::{expect_dims, UnsupervisedLossResult};

/// Combine the shared prototype basis with per-detection coefficients.
///
/// `out[b, d, i, j] = sum_m proto[b, i, j, m] * coeffs[b, d, m]`
///
/// # Shapes
///
/// - proto: `[batch, height, width, mask_dim]`
/// - coeffs: `[batch, detections, mask_dim]`
/// - output: `[batch, detections, height, width]`
///
/// # Errors
///
/// Returns [`ShapeMismatch`](crate::UnsupervisedLossError::ShapeMismatch) when the batch
/// or mask dimensions disagree.
pub fn lincomb<B: Backend>(
    proto: Tensor<B, 4>,
    coeffs: Tensor<B, 3>,
) -> UnsupervisedLossResult<Tensor<B, 4>> {
    let [batch, height, width, mask_dim] = proto.dims();
    let [coeff_batch, detections, coeff_dim] = coeffs.dims();
    expect_dims(
        "mask coefficients",
        [coeff_batch, detections, coeff_dim],
        [batch, detections, mask_dim],
    )?;

    // [B, H*W, M] x [B, M, D] -> [B, H*W, D]
    let combined = proto
        .reshape([batch, height * width, mask_dim])
        .matmul(coeffs.swap_dims(1, 2));

    Ok(combined
        .swap_dims(1, 2)
        .reshape([batch, detections, height, width]))
}

/// [`lincomb`] followed by a sigmoid, bounding every mask to `(0, 1)`.
pub fn assemble_masks<B: Backend>(
    proto: Tensor<B, 4>,
    coeffs: Tensor<B, 3>,
) -> UnsupervisedLossResult<Tensor<B, 4>> {
    lincomb(proto, coeffs).map(sigmoid)
}
