//! Detector outputs consumed by the loss and the detections it keeps.

use burn::prelude::*;
use unsupseg_extra_ops::gather_batched;

use crate::{error::UnsupervisedLossResult, selector::Selection};

/// Raw outputs of a YOLACT-style detector for one batch.
#[derive(Debug, Clone)]
pub struct DetectorOutput<B: Backend> {
    /// Location offsets `[batch, num_priors, loc_dim]`.
    pub loc: Tensor<B, 3>,
    /// Class logits `[batch, num_priors, num_classes]`.
    pub conf: Tensor<B, 3>,
    /// Mask coefficients `[batch, num_priors, mask_dim]`.
    pub mask: Tensor<B, 3>,
    /// Prototype masks `[batch, proto_h, proto_w, mask_dim]`.
    pub proto: Tensor<B, 4>,
    /// Prior geometry `[num_priors, 4]` as `(cx, cy, w, h)`, shared by the batch.
    pub priors: Tensor<B, 2>,
    /// Backbone features handed to the reconstruction branch, if it needs them.
    pub features: Option<Tensor<B, 4>>,
}

impl<B: Backend> DetectorOutput<B> {
    /// Create a detector output without backbone features.
    pub const fn new(
        loc: Tensor<B, 3>,
        conf: Tensor<B, 3>,
        mask: Tensor<B, 3>,
        proto: Tensor<B, 4>,
        priors: Tensor<B, 2>,
    ) -> Self {
        Self {
            loc,
            conf,
            mask,
            proto,
            priors,
            features: None,
        }
    }

    /// Attach backbone features for a reconstruction branch that reads them.
    #[must_use]
    pub fn with_features(mut self, features: Tensor<B, 4>) -> Self {
        self.features = Some(features);
        self
    }
}

/// Detections that survived both selection stages, ordered least overlapping first.
///
/// Every per-detection tensor is gathered with the same per-image index set, so row
/// `k` of each field describes the same detection.
#[derive(Debug, Clone)]
pub struct KeptDetections<B: Backend> {
    /// Location offsets `[batch, k, loc_dim]`.
    pub loc: Tensor<B, 3>,
    /// Mask coefficients `[batch, k, mask_dim]`.
    pub mask: Tensor<B, 3>,
    /// Foreground confidence `[batch, k]`.
    pub conf: Tensor<B, 2>,
    /// Prior geometry `[batch, k, 4]`.
    pub priors: Tensor<B, 3>,
    /// Original prior index of every kept detection `[batch, k]`.
    pub prior_indices: Tensor<B, 2, Int>,
    /// Stage-1 prior indices in descending confidence `[batch, k_conf]`.
    pub conf_order: Tensor<B, 2, Int>,
    /// Indices into the confidence-ranked list `[batch, k]`.
    pub keep: Tensor<B, 2, Int>,
    /// Highest overlap with a more confident detection `[batch, k]`.
    pub max_overlap: Tensor<B, 2>,
    /// Pairwise soft IoU of the confidence-ranked list `[batch, k_conf, k_conf]`.
    pub iou: Tensor<B, 3>,
}

impl<B: Backend> KeptDetections<B> {
    /// Gather the stage-1 survivors of `selection` by its keep index set.
    ///
    /// # Errors
    ///
    /// Returns [`Gather`](crate::UnsupervisedLossError::Gather) if the keep set was built
    /// for a different batch.
    pub fn from_selection(selection: Selection<B>) -> UnsupervisedLossResult<Self> {
        let Selection {
            ranked,
            iou,
            max_overlap,
            keep,
        } = selection;

        Ok(Self {
            loc: gather_batched(ranked.loc, keep.clone())?,
            mask: gather_batched(ranked.mask, keep.clone())?,
            conf: gather_batched(ranked.conf, keep.clone())?,
            priors: gather_batched(ranked.priors, keep.clone())?,
            conf_order: ranked.prior_indices.clone(),
            prior_indices: gather_batched(ranked.prior_indices, keep.clone())?,
            max_overlap: gather_batched(max_overlap, keep.clone())?,
            keep,
            iou,
        })
    }

    /// Number of kept detections per image.
    pub fn len(&self) -> usize {
        self.keep.dims()[1]
    }

    /// Whether no detection survived selection.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
