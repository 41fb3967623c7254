//! Configuration for the unsupervised loss.
//!
//! All values are read-only for the lifetime of a run. [`UnsupervisedLossConfig`]
//! derives Burn's `Config`, so it can be saved to and loaded from JSON alongside the
//! rest of a training configuration.

use burn::prelude::*;

use crate::{
    error::{UnsupervisedLossError, UnsupervisedLossResult},
    unsupervised_loss::UnsupervisedLoss,
};

/// How the per-pixel weighted variance is reduced to a scalar.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum VarianceReduction {
    /// Sum over channels and pixels.
    Sum,
    /// Mean over channels and pixels.
    Mean,
}

/// Box decoding and Gaussian footprint parameters.
#[derive(Config, Debug)]
pub struct GaussianConfig {
    /// Variances applied to the centre offsets and log-size offsets.
    #[config(default = "[0.1, 0.2]")]
    pub variances: [f64; 2],
    /// Standard deviation of the footprint as a fraction of the decoded box size.
    #[config(default = 0.5)]
    pub sigma_scale: f64,
}

/// Configuration for [`UnsupervisedLoss`].
#[derive(Config, Debug)]
pub struct UnsupervisedLossConfig {
    /// Number of priors the detector predicts per image.
    pub num_priors: usize,
    /// Number of classes, background included.
    #[config(default = 2)]
    pub num_classes: usize,
    /// Index of the background class in the confidence logits.
    #[config(default = 0)]
    pub background_label: usize,
    /// Number of location parameters per prior: `dx, dy, dw, dh` and an optional angle.
    #[config(default = 5)]
    pub loc_dim: usize,
    /// Number of prototype masks / mask coefficients.
    #[config(default = 32)]
    pub mask_dim: usize,
    /// Upper bound for the confidence pruning stage.
    #[config(default = 200)]
    pub nms_top_k: usize,
    /// Detections kept after ranking by confidence.
    #[config(default = 100)]
    pub top_k_conf: usize,
    /// Detections kept after ranking by soft overlap.
    #[config(default = 20)]
    pub top_k_iou: usize,
    /// Overlap above which a kept detection counts as redundant in diagnostics.
    #[config(default = 0.5)]
    pub nms_thresh: f64,
    /// Confidence above which a kept detection counts as confident in diagnostics.
    #[config(default = 0.05)]
    pub conf_thresh: f64,
    /// Resolution `[height, width]` at which Gaussians are rendered for the soft IoU.
    #[config(default = "[32, 32]")]
    pub iou_gauss_dim: [usize; 2],
    /// Small positive constant guarding every division.
    #[config(default = 1e-6)]
    pub positive: f64,
    /// Gaussian renderer settings.
    #[config(default = "GaussianConfig::new()")]
    pub gaussian: GaussianConfig,
    /// When false the background loss is kept in the graph but multiplied by zero.
    #[config(default = true)]
    pub enable_variance_loss: bool,
    /// Reduction of the weighted variance.
    #[config(default = "VarianceReduction::Sum")]
    pub variance_reduction: VarianceReduction,
    /// Check intermediate tensors for NaN. Only honoured in debug builds.
    #[config(default = true)]
    pub check_numerics: bool,
}

impl UnsupervisedLossConfig {
    /// Initialize the [unsupervised loss](UnsupervisedLoss).
    ///
    /// # Errors
    ///
    /// Returns [`UnsupervisedLossError::InvalidConfiguration`] if [`validate`](Self::validate) fails.
    pub fn init(&self) -> UnsupervisedLossResult<UnsupervisedLoss> {
        self.validate()?;
        tracing::debug!(
            num_priors = self.num_priors,
            top_k_conf = self.top_k_conf,
            top_k_iou = self.top_k_iou,
            iou_gauss_dim = ?self.iou_gauss_dim,
            enable_variance_loss = self.enable_variance_loss,
            "unsupervised loss initialized",
        );
        Ok(UnsupervisedLoss::new(self))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err(UnsupervisedLossError::InvalidConfiguration)` for a non-positive
    /// overlap threshold, top-k sizes that are zero or exceed the available priors,
    /// and any other logically inconsistent setting.
    pub fn validate(&self) -> UnsupervisedLossResult<()> {
        // 1. Overlap threshold
        if self.nms_thresh <= 0.0 {
            return invalid(format!(
                "nms_thresh must be positive, got {}",
                self.nms_thresh
            ));
        }
        if !(0.0..=1.0).contains(&self.conf_thresh) {
            return invalid(format!(
                "conf_thresh must lie in [0, 1], got {}",
                self.conf_thresh
            ));
        }

        // 2. Class layout
        if self.num_classes < 2 {
            return invalid(format!(
                "num_classes must include background and at least one foreground class, got {}",
                self.num_classes
            ));
        }
        if self.background_label >= self.num_classes {
            return invalid(format!(
                "background_label {} is out of range for {} classes",
                self.background_label, self.num_classes
            ));
        }

        // 3. Tensor layout
        if self.loc_dim < 4 {
            return invalid(format!("loc_dim must be at least 4, got {}", self.loc_dim));
        }
        if self.mask_dim == 0 {
            return invalid("mask_dim must be positive".to_string());
        }
        if self.iou_gauss_dim.contains(&0) {
            return invalid(format!(
                "iou_gauss_dim must be non-empty, got {:?}",
                self.iou_gauss_dim
            ));
        }

        // 4. Top-k sizes: top_k_iou <= top_k_conf <= min(nms_top_k, num_priors)
        if self.top_k_conf == 0 || self.top_k_iou == 0 {
            return invalid(format!(
                "top_k_conf and top_k_iou must be positive, got {} and {}",
                self.top_k_conf, self.top_k_iou
            ));
        }
        if self.top_k_conf > self.num_priors {
            return invalid(format!(
                "top_k_conf {} exceeds the number of priors {}",
                self.top_k_conf, self.num_priors
            ));
        }
        if self.top_k_conf > self.nms_top_k {
            return invalid(format!(
                "top_k_conf {} exceeds nms_top_k {}",
                self.top_k_conf, self.nms_top_k
            ));
        }
        if self.top_k_iou > self.top_k_conf {
            return invalid(format!(
                "top_k_iou {} exceeds top_k_conf {}",
                self.top_k_iou, self.top_k_conf
            ));
        }

        // 5. Numerical guards
        if self.positive <= 0.0 {
            return invalid(format!("positive must be > 0, got {}", self.positive));
        }
        if self.gaussian.sigma_scale <= 0.0 {
            return invalid(format!(
                "gaussian.sigma_scale must be > 0, got {}",
                self.gaussian.sigma_scale
            ));
        }

        Ok(())
    }
}

fn invalid(reason: String) -> UnsupervisedLossResult<()> {
    Err(UnsupervisedLossError::InvalidConfiguration { reason })
}
