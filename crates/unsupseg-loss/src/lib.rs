//! Unsupervised losses for Gaussian-attention instance segmentation.
//!
//! This crate turns the raw outputs of a YOLACT-style detector (per-prior box offsets,
//! class logits, mask coefficients, prototype masks and prior geometry) into training
//! signals that need no ground truth, using the Burn deep learning framework.
//!
//! ## Pipeline
//!
//! 1. **Selection**: priors are ranked by foreground confidence and the best
//!    `top_k_conf` survive. Each survivor is rendered as an unnormalized Gaussian and a
//!    pairwise soft IoU is computed over the rendered densities. The `top_k_iou`
//!    detections with the lowest overlap against higher-ranked detections are kept,
//!    acting as a differentiable analogue of non-maximum suppression.
//! 2. **Attention**: kept detections are rendered again at prototype resolution,
//!    multiplied by their assembled masks (`sigmoid(proto · coeffs)`) and confidence,
//!    and resized to image resolution.
//! 3. **Losses**:
//!    - [`VarianceLoss`] (`"background"`): pixels not dominated by any detection should
//!      share a consistent appearance across the batch.
//!    - [`reconstruction_loss`] (`"reconstruction"`): an external reconstruction branch
//!      should reproduce the image wherever a detection claims attention.
//! 4. **Scaling**: each raw loss is multiplied by a weight read once per call from a
//!    [`ScaleSource`].
//!
//! ## Usage Example
//!
//! ```rust,ignore
//! use unsupseg_loss::{
//!     DetectorOutput, NoopSink, PriorReconstruction, StaticScales, StepContext,
//!     UnsupervisedLossConfig,
//! };
//!
//! let loss = UnsupervisedLossConfig::new(num_priors)
//!     .with_top_k_conf(100)
//!     .with_top_k_iou(20)
//!     .init()?;
//!
//! let mut sink = NoopSink;
//! let mut ctx = StepContext::new(&mut sink);
//! let output = loss.forward(
//!     images,
//!     DetectorOutput::new(loc, conf, mask, proto, priors),
//!     &PriorReconstruction::new(per_prior_reconstruction),
//!     &StaticScales::new(),
//!     &mut ctx,
//! )?;
//! let total = output.total();
//! ctx.advance();
//! ```

mod config;
mod context;
mod detections;
mod error;
mod gaussian;
mod lincomb;
mod numerics;
mod reconstruction;
mod scales;
mod selector;
mod soft_iou;
mod unsupervised_loss;
mod variance;

pub use config::{GaussianConfig, UnsupervisedLossConfig, VarianceReduction};
pub use context::{MetricsSink, NoopSink, StepContext, TracingSink};
pub use detections::{DetectorOutput, KeptDetections};
pub use error::{UnsupervisedLossError, UnsupervisedLossResult};
pub use gaussian::GaussianRenderer;
pub use lincomb::{assemble_masks, lincomb};
pub use reconstruction::{
    reconstruction_loss, squared_error, PriorReconstruction, ReconstructionBranch,
};
pub use scales::{ScaleSource, StaticScales, BACKGROUND_LOSS, RECONSTRUCTION_LOSS};
pub use selector::{DetectionSelector, RankedDetections, Selection};
pub use soft_iou::{gaussian_iou, max_overlap_with_higher_ranked};
pub use unsupervised_loss::{UnsupervisedLoss, UnsupervisedLossOutput};
pub use variance::{background_confidence, AttentionField, VarianceLoss, VarianceOutput};
