//! Two-stage detection selection.
//!
//! Stage 1 keeps the `top_k_conf` most confident priors of every image. Stage 2 renders
//! the survivors as Gaussians, computes their pairwise soft IoU and keeps the
//! `top_k_iou` detections whose highest overlap with a more confident detection is the
//! smallest. Rankings are computed on detached values; gradients reach the kept
//! detections through the gathers.

use burn::{
    module::{Content, DisplaySettings, Module, ModuleDisplay},
    prelude::*,
};
use unsupseg_extra_ops::gather_batched;

use crate::{
    error::{expect_dims, UnsupervisedLossResult},
    gaussian::GaussianRenderer,
    soft_iou::{gaussian_iou, max_overlap_with_higher_ranked},
};

/// Detections surviving the confidence stage, in descending confidence order.
#[derive(Debug, Clone)]
pub struct RankedDetections<B: Backend> {
    /// Location offsets `[batch, k, params]`.
    pub loc: Tensor<B, 3>,
    /// Mask coefficients `[batch, k, mask_dim]`.
    pub mask: Tensor<B, 3>,
    /// Foreground confidence `[batch, k]`.
    pub conf: Tensor<B, 2>,
    /// Prior geometry `[batch, k, 4]`.
    pub priors: Tensor<B, 3>,
    /// Original prior index of every survivor `[batch, k]`, i.e. the confidence order.
    pub prior_indices: Tensor<B, 2, Int>,
}

/// Result of both selection stages.
#[derive(Debug, Clone)]
pub struct Selection<B: Backend> {
    /// Stage-1 survivors.
    pub ranked: RankedDetections<B>,
    /// Pairwise soft IoU of the survivors `[batch, k_conf, k_conf]`.
    pub iou: Tensor<B, 3>,
    /// Highest overlap with a more confident survivor `[batch, k_conf]`.
    pub max_overlap: Tensor<B, 2>,
    /// Indices into the stage-1 list, least overlapping first `[batch, k_iou]`.
    pub keep: Tensor<B, 2, Int>,
}

/// Confidence-ranked, overlap-pruned selection of detections.
#[derive(Module, Clone, Debug)]
#[module(custom_display)]
pub struct DetectionSelector {
    top_k_conf: usize,
    top_k_iou: usize,
    iou_gauss_height: usize,
    iou_gauss_width: usize,
    renderer: GaussianRenderer,
    eps: f64,
}

impl ModuleDisplay for DetectionSelector {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content
            .add("top_k_conf", &self.top_k_conf)
            .add("top_k_iou", &self.top_k_iou)
            .add("iou_gauss_height", &self.iou_gauss_height)
            .add("iou_gauss_width", &self.iou_gauss_width)
            .optional()
    }
}

impl DetectionSelector {
    /// Create a selector. Sizes are validated by the loss configuration.
    pub const fn new(
        top_k_conf: usize,
        top_k_iou: usize,
        iou_gauss_dim: [usize; 2],
        renderer: GaussianRenderer,
        eps: f64,
    ) -> Self {
        let [iou_gauss_height, iou_gauss_width] = iou_gauss_dim;
        Self {
            top_k_conf,
            top_k_iou,
            iou_gauss_height,
            iou_gauss_width,
            renderer,
            eps,
        }
    }

    /// Stage 1: keep the `min(top_k_conf, n)` most confident priors of every image.
    ///
    /// # Shapes
    ///
    /// - conf: `[batch, n]`
    /// - loc: `[batch, n, params]`
    /// - mask: `[batch, n, mask_dim]`
    /// - priors: `[batch, n, 4]`
    ///
    /// # Errors
    ///
    /// Returns a shape error when the inputs disagree on batch or prior count.
    pub fn rank_by_confidence<B: Backend>(
        &self,
        conf: Tensor<B, 2>,
        loc: Tensor<B, 3>,
        mask: Tensor<B, 3>,
        priors: Tensor<B, 3>,
    ) -> UnsupervisedLossResult<RankedDetections<B>> {
        let [batch, n] = conf.dims();
        let [loc_batch, loc_n, _] = loc.dims();
        let [mask_batch, mask_n, _] = mask.dims();
        let [prior_batch, prior_n, prior_dim] = priors.dims();
        expect_dims("loc", [loc_batch, loc_n], [batch, n])?;
        expect_dims("mask", [mask_batch, mask_n], [batch, n])?;
        expect_dims("priors", [prior_batch, prior_n, prior_dim], [batch, n, 4])?;

        let k = self.top_k_conf.min(n);
        let order = conf
            .clone()
            .detach()
            .argsort_descending(1)
            .slice([0..batch, 0..k]);

        Ok(RankedDetections {
            loc: gather_batched(loc, order.clone())?,
            mask: gather_batched(mask, order.clone())?,
            conf: gather_batched(conf, order.clone())?,
            priors: gather_batched(priors, order.clone())?,
            prior_indices: order,
        })
    }

    /// Stage 2 ranking: indices of the `min(top_k_iou, k)` smallest overlaps.
    ///
    /// This is a smallest-k, not a top-k: the least redundant detections survive.
    pub fn least_overlapping<B: Backend>(&self, max_overlap: Tensor<B, 2>) -> Tensor<B, 2, Int> {
        let [batch, k] = max_overlap.dims();
        max_overlap
            .detach()
            .argsort(1)
            .slice([0..batch, 0..self.top_k_iou.min(k)])
    }

    /// Soft IoU of the stage-1 survivors, rendered at `iou_gauss_dim`.
    pub fn overlaps<B: Backend>(&self, ranked: &RankedDetections<B>) -> Tensor<B, 3> {
        let gauss = self.renderer.render(
            ranked.loc.clone(),
            ranked.priors.clone(),
            [self.iou_gauss_height, self.iou_gauss_width],
        );
        gaussian_iou(gauss, self.eps)
    }

    /// Run both stages.
    ///
    /// # Errors
    ///
    /// Propagates shape errors from [`rank_by_confidence`](Self::rank_by_confidence).
    pub fn select<B: Backend>(
        &self,
        conf: Tensor<B, 2>,
        loc: Tensor<B, 3>,
        mask: Tensor<B, 3>,
        priors: Tensor<B, 3>,
    ) -> UnsupervisedLossResult<Selection<B>> {
        let ranked = self.rank_by_confidence(conf, loc, mask, priors)?;
        let iou = self.overlaps(&ranked);
        let max_overlap = max_overlap_with_higher_ranked(iou.clone());
        let keep = self.least_overlapping(max_overlap.clone());

        Ok(Selection {
            ranked,
            iou,
            max_overlap,
            keep,
        })
    }
}
