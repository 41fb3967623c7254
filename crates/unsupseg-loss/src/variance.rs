//! Background-appearance variance loss.
//!
//! Each kept detection claims a soft attention field. Pixels that no detection claims
//! strongly are treated as background, and their appearance should be consistent
//! across the batch: the loss is the background-weighted per-pixel variance of the
//! original images.

use burn::{
    module::{Content, DisplaySettings, Ignored, Module, ModuleDisplay},
    prelude::*,
};
use unsupseg_extra_ops::TensorExtraOps;

use crate::{
    config::VarianceReduction,
    detections::KeptDetections,
    error::{expect_dims, UnsupervisedLossResult},
    gaussian::GaussianRenderer,
    lincomb::assemble_masks,
};

/// Per-detection attention of the kept detections.
#[derive(Debug, Clone)]
pub struct AttentionField<B: Backend> {
    /// Gaussian footprints at prototype resolution `[batch, k, proto_h, proto_w]`.
    pub gaussian: Tensor<B, 4>,
    /// Assembled masks at prototype resolution `[batch, k, proto_h, proto_w]`.
    pub masks: Tensor<B, 4>,
    /// `gaussian * masks` `[batch, k, proto_h, proto_w]`.
    pub attention: Tensor<B, 4>,
    /// Attention scaled by confidence, resized to image resolution `[batch, k, height, width]`.
    pub mask_confidence: Tensor<B, 4>,
}

impl<B: Backend> AttentionField<B> {
    /// Render, assemble and weight the kept detections, then resize to `image_size`.
    ///
    /// # Errors
    ///
    /// Returns a shape error when the prototypes and mask coefficients disagree.
    pub fn compute(
        renderer: &GaussianRenderer,
        kept: &KeptDetections<B>,
        proto: Tensor<B, 4>,
        image_size: [usize; 2],
    ) -> UnsupervisedLossResult<Self> {
        let [_, proto_h, proto_w, _] = proto.dims();
        let [batch, k] = kept.conf.dims();

        let gaussian = renderer.render(kept.loc.clone(), kept.priors.clone(), [proto_h, proto_w]);
        let masks = assemble_masks(proto, kept.mask.clone())?;
        let attention = gaussian.clone() * masks.clone();

        let conf = kept
            .conf
            .clone()
            .reshape([batch, k, 1, 1])
            .repeat_dim(2, proto_h)
            .repeat_dim(3, proto_w);
        let mask_confidence = (attention.clone() * conf).resize_bilinear(image_size);

        Ok(Self {
            gaussian,
            masks,
            attention,
            mask_confidence,
        })
    }
}

/// Per-pixel background confidence.
///
/// `1 - max_k(c_k^2 / (sum_k c_k + eps))`: a pixel dominated by one detection is
/// foreground, a pixel no detection claims is background. NaN entries become `0`.
///
/// # Shapes
///
/// - mask_confidence: `[batch, k, height, width]`
/// - output: `[batch, height, width]`
pub fn background_confidence<B: Backend>(mask_confidence: Tensor<B, 4>, eps: f64) -> Tensor<B, 3> {
    let [batch, k, height, width] = mask_confidence.dims();

    let total = mask_confidence
        .clone()
        .sum_dim(1)
        .repeat_dim(1, k)
        .add_scalar(eps);
    let share = mask_confidence.clone() * mask_confidence / total;

    // Detections moved to the trailing axis so the max backward scatters correctly.
    let background = share
        .permute([0, 2, 3, 1])
        .max_dim(3)
        .neg()
        .add_scalar(1.0)
        .reshape([batch, height, width]);
    background.clone().mask_fill(background.is_nan(), 0.0)
}

/// Result of [`VarianceLoss::forward`].
#[derive(Debug, Clone)]
pub struct VarianceOutput<B: Backend> {
    /// Scalar loss `[1]`.
    pub loss: Tensor<B, 1>,
    /// Per-pixel background confidence `[batch, height, width]`.
    pub background_confidence: Tensor<B, 3>,
}

/// Background-weighted variance of the image batch.
#[derive(Module, Clone, Debug)]
#[module(custom_display)]
pub struct VarianceLoss {
    /// Guard added to every denominator.
    pub eps: f64,
    /// Reduction of the per-pixel variance.
    pub reduction: Ignored<VarianceReduction>,
    /// When false the loss is multiplied by zero.
    pub enabled: bool,
}

impl ModuleDisplay for VarianceLoss {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content
            .add("eps", &self.eps)
            .add("enabled", &self.enabled)
            .optional()
    }
}

impl VarianceLoss {
    /// Create a variance loss with the given epsilon, reduction and toggle.
    pub fn new(eps: f64, reduction: VarianceReduction, enabled: bool) -> Self {
        Self {
            eps,
            reduction: Ignored(reduction),
            enabled,
        }
    }

    /// Compute the loss from the image batch and the per-detection mask confidence.
    ///
    /// When disabled the loss is still computed and multiplied by zero.
    ///
    /// # Shapes
    ///
    /// - original: `[batch, channels, height, width]`
    /// - mask_confidence: `[batch, k, height, width]`
    ///
    /// # Errors
    ///
    /// Returns a shape error when batch or spatial sizes disagree.
    pub fn forward<B: Backend>(
        &self,
        original: Tensor<B, 4>,
        mask_confidence: Tensor<B, 4>,
    ) -> UnsupervisedLossResult<VarianceOutput<B>> {
        let [batch, _, height, width] = original.dims();
        let [conf_batch, _, conf_h, conf_w] = mask_confidence.dims();
        expect_dims(
            "mask confidence",
            [conf_batch, conf_h, conf_w],
            [batch, height, width],
        )?;

        let background = background_confidence(mask_confidence, self.eps);
        let loss = self.weighted_variance(original, background.clone());
        let loss = if self.enabled {
            loss
        } else {
            loss.mul_scalar(0.0)
        };

        Ok(VarianceOutput {
            loss,
            background_confidence: background,
        })
    }

    /// Per-pixel variance over the batch, weighted by `background`, reduced to `[1]`.
    ///
    /// # Shapes
    ///
    /// - original: `[batch, channels, height, width]`
    /// - background: `[batch, height, width]`
    pub fn weighted_variance<B: Backend>(
        &self,
        original: Tensor<B, 4>,
        background: Tensor<B, 3>,
    ) -> Tensor<B, 1> {
        let [batch, channels, height, width] = original.dims();

        let weights = background
            .clone()
            .reshape([batch, 1, height, width])
            .repeat_dim(1, channels);
        let denominator = background
            .sum_dim(0)
            .reshape([1, 1, height, width])
            .repeat_dim(1, channels)
            .add_scalar(self.eps);

        let mean = (original.clone() * weights.clone()).sum_dim(0) / denominator.clone();
        let diff = original - mean.repeat_dim(0, batch);
        let variance = (diff.clone() * diff * weights).sum_dim(0) / denominator;

        match *self.reduction {
            VarianceReduction::Sum => variance.sum(),
            VarianceReduction::Mean => variance.mean(),
        }
    }
}
