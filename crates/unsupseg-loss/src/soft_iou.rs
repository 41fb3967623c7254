//! Soft IoU over rendered Gaussian densities.
//!
//! For two non-negative fields `a` and `b` the soft IoU is
//!
//! ```text
//! IoU(a, b) = sum(min(a, b)) / (sum(max(a, b)) + eps)
//! ```
//!
//! which reduces to the usual box IoU for binary masks and is differentiable
//! everywhere the fields are.

use burn::prelude::*;
use unsupseg_extra_ops::strict_upper_max;

/// Pairwise soft IoU between all detections of each image.
///
/// # Shapes
///
/// - gauss: `[batch, detections, height, width]`
/// - output: `[batch, detections, detections]`, symmetric
pub fn gaussian_iou<B: Backend>(gauss: Tensor<B, 4>, eps: f64) -> Tensor<B, 3> {
    let [batch, detections, height, width] = gauss.dims();
    let flat = gauss.reshape([batch, detections, height * width]);

    // rows[b, i, j] = g_j, cols[b, i, j] = g_i
    let rows = flat
        .clone()
        .unsqueeze_dim::<4>(1)
        .repeat_dim(1, detections);
    let cols = flat.unsqueeze_dim::<4>(2).repeat_dim(2, detections);

    let intersection = rows.clone().min_pair(cols.clone()).sum_dim(3);
    let union = rows.max_pair(cols).sum_dim(3);

    (intersection / union.add_scalar(eps)).reshape([batch, detections, detections])
}

/// For each detection, its highest soft IoU with any higher-ranked detection.
///
/// Detections are assumed to be ordered by rank along both axes. The first detection
/// has no predecessor and always maps to `0`.
///
/// # Shapes
///
/// - iou: `[batch, detections, detections]`
/// - output: `[batch, detections]`
pub fn max_overlap_with_higher_ranked<B: Backend>(iou: Tensor<B, 3>) -> Tensor<B, 2> {
    strict_upper_max(iou)
}
