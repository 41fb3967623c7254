//! Masked image reconstruction loss.
//!
//! An external branch reconstructs the image once per kept detection. The squared
//! error against the original is weighted by how strongly the detection attends to
//! each pixel, so a detection only has to explain what it claims.

use burn::prelude::*;
use unsupseg_extra_ops::{gather_batched, TensorExtraOps};

use crate::{
    detections::KeptDetections,
    error::{expect_dims, UnsupervisedLossResult},
};

/// Produces one reconstruction of the input image per kept detection.
pub trait ReconstructionBranch<B: Backend> {
    /// Reconstruct `original` for every kept detection.
    ///
    /// The result has shape `[batch, k, channels, h, w]`; it is resized to the image
    /// resolution by the loss when `h, w` differ.
    ///
    /// # Errors
    ///
    /// Implementations report their own shape problems as loss errors.
    fn reconstruct(
        &self,
        original: &Tensor<B, 4>,
        features: Option<&Tensor<B, 4>>,
        kept: &KeptDetections<B>,
    ) -> UnsupervisedLossResult<Tensor<B, 5>>;
}

/// A branch whose output was computed for every prior ahead of time.
///
/// Holds `[batch, num_priors, channels, h, w]` and gathers the rows of the kept priors.
#[derive(Debug, Clone)]
pub struct PriorReconstruction<B: Backend> {
    per_prior: Tensor<B, 5>,
}

impl<B: Backend> PriorReconstruction<B> {
    /// Wrap per-prior reconstructions `[batch, num_priors, channels, height, width]`.
    pub const fn new(per_prior: Tensor<B, 5>) -> Self {
        Self { per_prior }
    }
}

impl<B: Backend> ReconstructionBranch<B> for PriorReconstruction<B> {
    fn reconstruct(
        &self,
        _original: &Tensor<B, 4>,
        _features: Option<&Tensor<B, 4>>,
        kept: &KeptDetections<B>,
    ) -> UnsupervisedLossResult<Tensor<B, 5>> {
        Ok(gather_batched(
            self.per_prior.clone(),
            kept.prior_indices.clone(),
        )?)
    }
}

/// Per-pixel squared error summed over colour channels.
///
/// # Shapes
///
/// - reconstruction: `[batch, k, channels, height, width]`
/// - original: `[batch, channels, height, width]`, broadcast over `k`
/// - output: `[batch, k, height, width]`
pub fn squared_error<B: Backend>(reconstruction: Tensor<B, 5>, original: Tensor<B, 4>) -> Tensor<B, 4> {
    let [batch, k, _, height, width] = reconstruction.dims();

    let target = original.unsqueeze_dim::<5>(1).repeat_dim(1, k);
    let diff = reconstruction - target;

    (diff.clone() * diff)
        .sum_dim(2)
        .reshape([batch, k, height, width])
}

/// Mean of the attention-weighted squared error over `batch × k × height × width`.
///
/// # Shapes
///
/// - reconstruction: `[batch, k, channels, h, w]`
/// - original: `[batch, channels, height, width]`
/// - mask_confidence: `[batch, k, height, width]`
///
/// # Errors
///
/// Returns a shape error when batch, detection or channel counts disagree.
pub fn reconstruction_loss<B: Backend>(
    reconstruction: Tensor<B, 5>,
    original: Tensor<B, 4>,
    mask_confidence: Tensor<B, 4>,
) -> UnsupervisedLossResult<Tensor<B, 1>> {
    let [batch, channels, height, width] = original.dims();
    let [rec_batch, k, rec_channels, rec_h, rec_w] = reconstruction.dims();
    expect_dims(
        "reconstruction",
        [rec_batch, rec_channels],
        [batch, channels],
    )?;
    expect_dims(
        "mask confidence",
        mask_confidence.dims(),
        [batch, k, height, width],
    )?;

    let reconstruction = if [rec_h, rec_w] == [height, width] {
        reconstruction
    } else {
        reconstruction
            .reshape([batch * k, channels, rec_h, rec_w])
            .resize_bilinear([height, width])
            .reshape([batch, k, channels, height, width])
    };

    Ok((squared_error(reconstruction, original) * mask_confidence).mean())
}
