//! The unsupervised loss: selection, attention, and the two scaled losses.

use std::collections::HashMap;

use burn::{
    module::{Content, DisplaySettings, Module, ModuleDisplay},
    prelude::*,
    tensor::{activation::softmax, cast::ToElement},
};

use crate::{
    config::UnsupervisedLossConfig,
    context::StepContext,
    detections::{DetectorOutput, KeptDetections},
    error::{expect_dims, UnsupervisedLossError, UnsupervisedLossResult},
    gaussian::GaussianRenderer,
    numerics::ensure_no_nan,
    reconstruction::{reconstruction_loss, ReconstructionBranch},
    scales::{resolve_scale, ScaleSource, BACKGROUND_LOSS, RECONSTRUCTION_LOSS},
    selector::DetectionSelector,
    variance::{AttentionField, VarianceLoss},
};

/// Ground-truth-free loss for Gaussian-attention instance segmentation.
///
/// Built by [`UnsupervisedLossConfig::init`]. Holds no tensors; every forward call is
/// independent.
#[derive(Module, Clone, Debug)]
#[module(custom_display)]
pub struct UnsupervisedLoss {
    num_priors: usize,
    num_classes: usize,
    background_label: usize,
    loc_dim: usize,
    mask_dim: usize,
    nms_thresh: f64,
    conf_thresh: f64,
    check_numerics: bool,
    renderer: GaussianRenderer,
    selector: DetectionSelector,
    variance: VarianceLoss,
}

impl ModuleDisplay for UnsupervisedLoss {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content
            .add("num_priors", &self.num_priors)
            .add("num_classes", &self.num_classes)
            .add("nms_thresh", &self.nms_thresh)
            .add("conf_thresh", &self.conf_thresh)
            .add("selector", &self.selector)
            .add("variance", &self.variance)
            .optional()
    }
}

/// Result of [`UnsupervisedLoss::forward`].
#[derive(Debug, Clone)]
pub struct UnsupervisedLossOutput<B: Backend> {
    /// Scaled losses keyed by [`BACKGROUND_LOSS`] and [`RECONSTRUCTION_LOSS`].
    pub losses: HashMap<String, Tensor<B, 1>>,
    /// The same losses before scaling.
    pub raw_losses: HashMap<String, Tensor<B, 1>>,
    /// The scale factors applied in this call.
    pub scales: HashMap<String, f64>,
    /// Detections kept by the selector.
    pub detections: KeptDetections<B>,
    /// Attention of the kept detections.
    pub attention: AttentionField<B>,
    /// Output of the reconstruction branch `[batch, k, channels, h, w]`.
    pub reconstruction: Tensor<B, 5>,
    /// Per-pixel background confidence `[batch, height, width]`.
    pub background_confidence: Tensor<B, 3>,
}

impl<B: Backend> UnsupervisedLossOutput<B> {
    /// Sum of the scaled losses.
    pub fn total(&self) -> Tensor<B, 1> {
        self.losses
            .values()
            .cloned()
            .reduce(|acc, loss| acc + loss)
            .unwrap_or_else(|| Tensor::zeros([1], &self.background_confidence.device()))
    }
}

impl UnsupervisedLoss {
    pub(crate) fn new(config: &UnsupervisedLossConfig) -> Self {
        let eps = config.positive;
        let renderer = GaussianRenderer::new(&config.gaussian, eps);

        Self {
            num_priors: config.num_priors,
            num_classes: config.num_classes,
            background_label: config.background_label,
            loc_dim: config.loc_dim,
            mask_dim: config.mask_dim,
            nms_thresh: config.nms_thresh,
            conf_thresh: config.conf_thresh,
            check_numerics: config.check_numerics,
            selector: DetectionSelector::new(
                config.top_k_conf,
                config.top_k_iou,
                config.iou_gauss_dim,
                renderer.clone(),
                eps,
            ),
            renderer,
            variance: VarianceLoss::new(
                eps,
                config.variance_reduction.clone(),
                config.enable_variance_loss,
            ),
        }
    }

    /// Compute the scaled background and reconstruction losses for one batch.
    ///
    /// The scale source is read exactly once. Diagnostics go to the sink of `ctx` at
    /// its current step; the caller advances the step.
    ///
    /// # Shapes
    ///
    /// - original: `[batch, 3, height, width]`
    /// - detector: see [`DetectorOutput`]
    ///
    /// # Errors
    ///
    /// - [`ShapeMismatch`](UnsupervisedLossError::ShapeMismatch) if an input disagrees
    ///   with the configuration, checked before any computation.
    /// - [`MissingScale`](UnsupervisedLossError::MissingScale) or
    ///   [`InvalidScale`](UnsupervisedLossError::InvalidScale) for a bad scale source.
    /// - [`NonFinite`](UnsupervisedLossError::NonFinite) if numeric checks are enabled
    ///   and a NaN appears.
    /// - Any error of the reconstruction branch.
    pub fn forward<B, R, S>(
        &self,
        original: Tensor<B, 4>,
        detector: DetectorOutput<B>,
        branch: &R,
        scales: &S,
        ctx: &mut StepContext<'_>,
    ) -> UnsupervisedLossResult<UnsupervisedLossOutput<B>>
    where
        B: Backend,
        R: ReconstructionBranch<B> + ?Sized,
        S: ScaleSource + ?Sized,
    {
        self.validate_inputs(&original, &detector)?;

        let scales = scales.snapshot();
        let background_scale = resolve_scale(&scales, BACKGROUND_LOSS)?;
        let reconstruction_scale = resolve_scale(&scales, RECONSTRUCTION_LOSS)?;

        let DetectorOutput {
            loc,
            conf,
            mask,
            proto,
            priors,
            features,
        } = detector;
        let [batch, _, height, width] = original.dims();

        // 1. Foreground confidence and per-image priors
        let foreground = self.foreground_confidence(conf);
        let priors = priors.unsqueeze_dim::<3>(0).repeat_dim(0, batch);

        // 2. Two-stage selection
        let selection = self.selector.select(foreground, loc, mask, priors)?;
        ensure_no_nan(self.check_numerics, "soft iou", &selection.iou)?;
        let kept = KeptDetections::from_selection(selection)?;

        // 3. Attention at image resolution
        let attention = AttentionField::compute(&self.renderer, &kept, proto, [height, width])?;
        ensure_no_nan(
            self.check_numerics,
            "mask confidence",
            &attention.mask_confidence,
        )?;

        // 4. Losses
        let variance = self
            .variance
            .forward(original.clone(), attention.mask_confidence.clone())?;
        ensure_no_nan(self.check_numerics, "background loss", &variance.loss)?;

        let reconstruction = branch.reconstruct(&original, features.as_ref(), &kept)?;
        let reconstruction_raw = reconstruction_loss(
            reconstruction.clone(),
            original,
            attention.mask_confidence.clone(),
        )?;
        ensure_no_nan(
            self.check_numerics,
            "reconstruction loss",
            &reconstruction_raw,
        )?;

        // 5. Scaling
        let raw_losses = HashMap::from([
            (BACKGROUND_LOSS.to_string(), variance.loss),
            (RECONSTRUCTION_LOSS.to_string(), reconstruction_raw),
        ]);
        let losses = raw_losses
            .iter()
            .map(|(name, loss)| {
                let scale = if name == BACKGROUND_LOSS {
                    background_scale
                } else {
                    reconstruction_scale
                };
                (name.clone(), loss.clone().mul_scalar(scale))
            })
            .collect();

        let output = UnsupervisedLossOutput {
            losses,
            raw_losses,
            scales,
            detections: kept,
            attention,
            reconstruction,
            background_confidence: variance.background_confidence,
        };
        self.report(&output, ctx);

        Ok(output)
    }

    /// `1 - softmax(conf)[.., background_label]`, shape `[batch, num_priors]`.
    fn foreground_confidence<B: Backend>(&self, conf: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch, priors, _] = conf.dims();
        let background = self.background_label;

        softmax(conf, 2)
            .slice([0..batch, 0..priors, background..background + 1])
            .reshape([batch, priors])
            .neg()
            .add_scalar(1.0)
    }

    fn validate_inputs<B: Backend>(
        &self,
        original: &Tensor<B, 4>,
        detector: &DetectorOutput<B>,
    ) -> UnsupervisedLossResult<()> {
        let [batch, channels, _, _] = original.dims();
        if channels != 3 {
            return Err(UnsupervisedLossError::ShapeMismatch {
                what: "original",
                expected: "3 colour channels".to_string(),
                actual: format!("{:?}", original.dims()),
            });
        }

        let n = self.num_priors;
        expect_dims("loc", detector.loc.dims(), [batch, n, self.loc_dim])?;
        expect_dims("conf", detector.conf.dims(), [batch, n, self.num_classes])?;
        expect_dims("mask", detector.mask.dims(), [batch, n, self.mask_dim])?;
        expect_dims("priors", detector.priors.dims(), [n, 4])?;

        let [proto_batch, _, _, proto_dim] = detector.proto.dims();
        expect_dims("proto", [proto_batch, proto_dim], [batch, self.mask_dim])?;

        if let Some(features) = &detector.features {
            expect_dims("features", [features.dims()[0]], [batch])?;
        }
        Ok(())
    }

    fn report<B: Backend>(&self, output: &UnsupervisedLossOutput<B>, ctx: &mut StepContext<'_>) {
        let log_losses = tracing::enabled!(tracing::Level::DEBUG);
        if !log_losses && !ctx.is_enabled() {
            return;
        }

        let value = |map: &HashMap<String, Tensor<B, 1>>, name: &str| {
            map.get(name)
                .map_or(0.0, |loss| loss.clone().into_scalar().to_f64())
        };
        let background = value(&output.raw_losses, BACKGROUND_LOSS);
        let reconstruction = value(&output.raw_losses, RECONSTRUCTION_LOSS);
        let total = output.total().into_scalar().to_f64();

        tracing::debug!(
            step = ctx.step(),
            background,
            reconstruction,
            total,
            "unsupervised loss step",
        );

        if !ctx.is_enabled() {
            return;
        }

        let kept = &output.detections;
        let redundant = kept
            .max_overlap
            .clone()
            .greater_elem(self.nms_thresh)
            .float()
            .mean()
            .into_scalar()
            .to_f64();
        let confident = kept
            .conf
            .clone()
            .greater_elem(self.conf_thresh)
            .float()
            .mean()
            .into_scalar()
            .to_f64();
        let mean_conf = kept.conf.clone().mean().into_scalar().to_f64();

        ctx.record_scalar("loss/background", background);
        ctx.record_scalar("loss/reconstruction", reconstruction);
        ctx.record_scalar("loss/total", total);
        ctx.record_scalar("detections/redundant_fraction", redundant);
        ctx.record_scalar("detections/confident_fraction", confident);
        ctx.record_scalar("detections/mean_confidence", mean_conf);

        if ctx.wants_images() {
            let [batch, height, width] = output.background_confidence.dims();
            if batch > 0 {
                let first = |tensor: Tensor<B, 3>| tensor.slice([0..1, 0..height, 0..width]);
                ctx.record_image(
                    "attention/background",
                    first(output.background_confidence.clone().detach())
                        .reshape([height, width])
                        .into_data(),
                );
                let claimed = output
                    .attention
                    .mask_confidence
                    .clone()
                    .detach()
                    .permute([0, 2, 3, 1])
                    .max_dim(3);
                ctx.record_image(
                    "attention/foreground",
                    first(claimed.reshape([batch, height, width]))
                        .reshape([height, width])
                        .into_data(),
                );

                // Per-detection fields of the first image, `[k, h, w]`.
                let per_detection = |tensor: Tensor<B, 4>| {
                    let [_, k, h, w] = tensor.dims();
                    tensor
                        .detach()
                        .slice([0..1, 0..k, 0..h, 0..w])
                        .reshape([k, h, w])
                        .into_data()
                };
                let attention = &output.attention;
                for (tag, field) in [
                    ("attention/gaussian", &attention.gaussian),
                    ("attention/masks", &attention.masks),
                    ("attention/attention", &attention.attention),
                    ("attention/mask_confidence", &attention.mask_confidence),
                ] {
                    ctx.record_image(tag, per_detection(field.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::{Distribution, Tensor, TensorData};

    use super::*;
    use crate::{
        context::{tests::RecordingSink, NoopSink},
        reconstruction::PriorReconstruction,
        scales::StaticScales,
        tests::{TestAutodiffBackend, TestBackend},
    };

    const IMAGE: usize = 16;

    fn config() -> UnsupervisedLossConfig {
        UnsupervisedLossConfig::new(4)
            .with_nms_top_k(4)
            .with_top_k_conf(3)
            .with_top_k_iou(2)
            .with_mask_dim(2)
            .with_iou_gauss_dim([64, 64])
    }

    /// Four priors on a horizontal line with foreground confidences 0.9, 0.1, 0.7, 0.3.
    /// Prior 3 sits two standard deviations from prior 2; priors 0 and 2 are far apart.
    fn scenario<B: Backend>() -> (Tensor<B, 4>, DetectorOutput<B>, PriorReconstruction<B>) {
        let device = Default::default();

        let logits: Vec<f32> = [0.9f32, 0.1, 0.7, 0.3]
            .iter()
            .flat_map(|&p| [0.0, (p / (1.0 - p)).ln()])
            .collect();
        let conf = Tensor::<B, 1>::from_floats(logits.as_slice(), &device).reshape([1, 4, 2]);
        let priors = Tensor::<B, 2>::from_data(
            TensorData::from([
                [0.15, 0.5, 0.1, 0.1],
                [0.5, 0.2, 0.1, 0.1],
                [0.85, 0.5, 0.1, 0.1],
                [0.75, 0.5, 0.1, 0.1],
            ]),
            &device,
        );
        let loc = Tensor::<B, 3>::zeros([1, 4, 5], &device);
        let mask = Tensor::<B, 3>::random([1, 4, 2], Distribution::Normal(0.0, 1.0), &device);
        let proto = Tensor::<B, 4>::random([1, 8, 8, 2], Distribution::Normal(0.0, 1.0), &device);

        let original =
            Tensor::<B, 4>::random([1, 3, IMAGE, IMAGE], Distribution::Uniform(0.0, 1.0), &device);
        let per_prior =
            Tensor::<B, 5>::random([1, 4, 3, 4, 4], Distribution::Uniform(0.0, 1.0), &device);

        (
            original,
            DetectorOutput::new(loc, conf, mask, proto, priors),
            PriorReconstruction::new(per_prior),
        )
    }

    fn scalar<B: Backend>(map: &HashMap<String, Tensor<B, 1>>, name: &str) -> f64 {
        map[name].clone().into_scalar().to_f64()
    }

    #[test]
    fn forward_keeps_least_overlapping_confident_detections() {
        let loss = config().init().unwrap();
        let (original, detector, branch) = scenario::<TestBackend>();
        let mut sink = NoopSink;
        let mut ctx = StepContext::new(&mut sink);

        let output = loss
            .forward(original, detector, &branch, &StaticScales::new(), &mut ctx)
            .unwrap();

        assert_eq!(output.detections.iou.dims(), [1, 3, 3]);
        assert_eq!(output.detections.len(), 2);
        let mut kept = output
            .detections
            .prior_indices
            .clone()
            .into_data()
            .to_vec::<i64>()
            .unwrap();
        kept.sort_unstable();
        assert_eq!(kept, vec![0, 2]);
        let order = output
            .detections
            .conf_order
            .clone()
            .into_data()
            .to_vec::<i64>()
            .unwrap();
        assert_eq!(order, vec![0, 2, 3]);

        assert_eq!(output.reconstruction.dims(), [1, 2, 3, 4, 4]);
        assert_eq!(output.background_confidence.dims(), [1, IMAGE, IMAGE]);
        for name in [BACKGROUND_LOSS, RECONSTRUCTION_LOSS] {
            let value = scalar(&output.losses, name);
            assert!(value.is_finite() && value >= 0.0, "{name} = {value}");
        }
    }

    #[test]
    fn forward_applies_scale_factors() {
        let loss = config().init().unwrap();
        let (original, detector, branch) = scenario::<TestBackend>();
        let scales = StaticScales::new().with_background(2.0).with_reconstruction(0.5);
        let mut sink = NoopSink;
        let mut ctx = StepContext::new(&mut sink);

        let output = loss
            .forward(original, detector, &branch, &scales, &mut ctx)
            .unwrap();

        for (name, scale) in [(BACKGROUND_LOSS, 2.0), (RECONSTRUCTION_LOSS, 0.5)] {
            let raw = scalar(&output.raw_losses, name);
            let scaled = scalar(&output.losses, name);
            assert!((scaled - raw * scale).abs() < 1e-6);
            assert_eq!(output.scales[name], scale);
        }
        let total = output.total().into_scalar().to_f64();
        let expected =
            scalar(&output.losses, BACKGROUND_LOSS) + scalar(&output.losses, RECONSTRUCTION_LOSS);
        assert!((total - expected).abs() < 1e-5);
    }

    #[test]
    fn forward_with_variance_disabled_returns_exact_zero_background() {
        let loss = config().with_enable_variance_loss(false).init().unwrap();
        let (original, detector, branch) = scenario::<TestBackend>();
        let mut sink = NoopSink;
        let mut ctx = StepContext::new(&mut sink);

        let output = loss
            .forward(original, detector, &branch, &StaticScales::new(), &mut ctx)
            .unwrap();

        assert_eq!(scalar(&output.losses, BACKGROUND_LOSS), 0.0);
        assert!(scalar(&output.losses, RECONSTRUCTION_LOSS).is_finite());
    }

    #[test]
    fn forward_with_zero_inputs_stays_finite() {
        let loss = config().init().unwrap();
        let device = Default::default();
        let detector = DetectorOutput::<TestBackend>::new(
            Tensor::zeros([1, 4, 5], &device),
            Tensor::zeros([1, 4, 2], &device),
            Tensor::zeros([1, 4, 2], &device),
            Tensor::zeros([1, 8, 8, 2], &device),
            Tensor::zeros([4, 4], &device),
        );
        let original = Tensor::<TestBackend, 4>::zeros([1, 3, IMAGE, IMAGE], &device);
        let branch = PriorReconstruction::new(Tensor::zeros([1, 4, 3, IMAGE, IMAGE], &device));
        let mut sink = NoopSink;
        let mut ctx = StepContext::new(&mut sink);

        let output = loss
            .forward(original, detector, &branch, &StaticScales::new(), &mut ctx)
            .unwrap();

        let iou = output.detections.iou.clone().into_data().to_vec::<f32>().unwrap();
        assert!(iou.iter().all(|v| v.is_finite()));
        assert!(output.total().into_scalar().to_f64().is_finite());
    }

    #[test]
    fn forward_propagates_gradients_to_every_detector_output() {
        let loss = config().init().unwrap();
        let (original, detector, branch) = scenario::<TestAutodiffBackend>();
        let loc = detector.loc.clone().require_grad();
        let conf = detector.conf.clone().require_grad();
        let mask = detector.mask.clone().require_grad();
        let proto = detector.proto.clone().require_grad();
        let detector =
            DetectorOutput::new(loc.clone(), conf.clone(), mask.clone(), proto.clone(), detector.priors);
        let mut sink = NoopSink;
        let mut ctx = StepContext::new(&mut sink);

        let output = loss
            .forward(original, detector, &branch, &StaticScales::new(), &mut ctx)
            .unwrap();
        let grads = output.total().backward();

        let non_zero = |grad: Option<Tensor<TestBackend, 3>>| {
            let values = grad
                .expect("gradient should exist")
                .into_data()
                .to_vec::<f32>()
                .unwrap();
            assert!(values.iter().all(|g| g.is_finite()));
            values.iter().any(|g| *g != 0.0)
        };
        assert!(non_zero(loc.grad(&grads)), "loc");
        assert!(non_zero(conf.grad(&grads)), "conf");
        assert!(non_zero(mask.grad(&grads)), "mask");
        let proto_grad = proto.grad(&grads).expect("proto gradient should exist");
        let proto_grad = proto_grad.into_data().to_vec::<f32>().unwrap();
        assert!(proto_grad.iter().any(|g| *g != 0.0), "proto");
    }

    #[test]
    fn forward_reports_missing_scale() {
        let loss = config().init().unwrap();
        let (original, detector, branch) = scenario::<TestBackend>();
        let scales = HashMap::from([(BACKGROUND_LOSS.to_string(), 1.0)]);
        let mut sink = NoopSink;
        let mut ctx = StepContext::new(&mut sink);

        let result = loss.forward(original, detector, &branch, &scales, &mut ctx);

        match result {
            Err(UnsupervisedLossError::MissingScale { name }) => {
                assert_eq!(name, RECONSTRUCTION_LOSS);
            }
            other => panic!("Expected MissingScale, got {:?}", other.err()),
        }
    }

    #[test]
    fn forward_rejects_location_width_mismatch() {
        let loss = config().init().unwrap();
        let (original, mut detector, branch) = scenario::<TestBackend>();
        detector.loc = Tensor::zeros([1, 4, 4], &Default::default());
        let mut sink = NoopSink;
        let mut ctx = StepContext::new(&mut sink);

        let result = loss.forward(original, detector, &branch, &StaticScales::new(), &mut ctx);

        match result {
            Err(UnsupervisedLossError::ShapeMismatch { what, .. }) => assert_eq!(what, "loc"),
            other => panic!("Expected ShapeMismatch, got {:?}", other.err()),
        }
    }

    #[test]
    fn forward_rejects_grayscale_images() {
        let loss = config().init().unwrap();
        let (_, detector, branch) = scenario::<TestBackend>();
        let original = Tensor::<TestBackend, 4>::zeros([1, 1, IMAGE, IMAGE], &Default::default());
        let mut sink = NoopSink;
        let mut ctx = StepContext::new(&mut sink);

        let result = loss.forward(original, detector, &branch, &StaticScales::new(), &mut ctx);

        assert!(matches!(
            result,
            Err(UnsupervisedLossError::ShapeMismatch { what: "original", .. })
        ));
    }

    #[test]
    fn forward_records_diagnostics_at_current_step() {
        let loss = config().init().unwrap();
        let (original, detector, branch) = scenario::<TestBackend>();
        let mut sink = RecordingSink {
            images_enabled: true,
            ..Default::default()
        };
        let mut ctx = StepContext::new(&mut sink).with_step(3);

        loss.forward(original, detector, &branch, &StaticScales::new(), &mut ctx)
            .unwrap();

        let tags: Vec<&str> = sink.scalars.iter().map(|(tag, _, _)| tag.as_str()).collect();
        assert!(tags.contains(&"loss/background"));
        assert!(tags.contains(&"loss/reconstruction"));
        assert!(tags.contains(&"detections/redundant_fraction"));
        assert!(sink.scalars.iter().all(|(_, step, _)| *step == 3));
        let shapes: Vec<(&str, &Vec<usize>)> = sink
            .images
            .iter()
            .map(|(tag, _, shape)| (tag.as_str(), shape))
            .collect();
        let full = vec![IMAGE, IMAGE];
        let per_detection = vec![2, 8, 8];
        let per_detection_full = vec![2, IMAGE, IMAGE];
        assert_eq!(
            shapes,
            vec![
                ("attention/background", &full),
                ("attention/foreground", &full),
                ("attention/gaussian", &per_detection),
                ("attention/masks", &per_detection),
                ("attention/attention", &per_detection),
                ("attention/mask_confidence", &per_detection_full),
            ]
        );
        assert!(sink.images.iter().all(|(_, step, _)| *step == 3));
    }

    #[test]
    fn unsupervised_loss_displays_its_settings() {
        let loss = config().init().unwrap();
        let display = format!("{loss}");

        assert!(display.contains("UnsupervisedLoss"));
        assert!(display.contains("num_priors: 4"));
        assert!(display.contains("DetectionSelector"));
        assert!(display.contains("VarianceLoss"));
    }
}
