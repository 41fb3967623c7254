//! Unnormalized Gaussian footprints of decoded detections.
//!
//! A detection is decoded against its prior in the usual SSD manner and rendered as an
//! axis-scaled, optionally rotated, Gaussian with unit peak:
//!
//! ```text
//! cx = pcx + dx * v0 * pw          w = pw * exp(dw * v1)
//! cy = pcy + dy * v0 * ph          h = ph * exp(dh * v1)
//! u  =  (x - cx) cos t + (y - cy) sin t
//! v  = -(x - cx) sin t + (y - cy) cos t
//! g  = exp(-0.5 * ((u / sx)^2 + (v / sy)^2)),   sx = w * s + eps,  sy = h * s + eps
//! ```
//!
//! Pixel centres sit at `((j + 0.5) / W, (i + 0.5) / H)` in the normalized frame of the
//! priors. The field is non-negative by construction.

use burn::{
    module::{Content, DisplaySettings, Module, ModuleDisplay},
    prelude::*,
};

use crate::config::GaussianConfig;

/// Renders per-detection Gaussian soft masks.
#[derive(Module, Clone, Debug)]
#[module(custom_display)]
pub struct GaussianRenderer {
    /// Variance applied to the centre offsets.
    pub center_variance: f64,
    /// Variance applied to the log-size offsets.
    pub size_variance: f64,
    /// Standard deviation as a fraction of the decoded box size.
    pub sigma_scale: f64,
    /// Keeps the standard deviations strictly positive.
    pub eps: f64,
}

impl ModuleDisplay for GaussianRenderer {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content
            .add("center_variance", &self.center_variance)
            .add("size_variance", &self.size_variance)
            .add("sigma_scale", &self.sigma_scale)
            .optional()
    }
}

impl GaussianRenderer {
    /// Create a renderer. `eps` keeps the standard deviations strictly positive.
    pub const fn new(config: &GaussianConfig, eps: f64) -> Self {
        let [center_variance, size_variance] = config.variances;
        Self {
            center_variance,
            size_variance,
            sigma_scale: config.sigma_scale,
            eps,
        }
    }

    /// Decode location offsets against their priors.
    ///
    /// # Shapes
    ///
    /// - loc: `[batch, detections, params]`, `params >= 4`
    /// - priors: `[batch, detections, 4]` as `(cx, cy, w, h)`
    /// - output: `[batch, detections, 4]` as `(cx, cy, w, h)`
    pub fn decode_boxes<B: Backend>(&self, loc: Tensor<B, 3>, priors: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, detections, _] = loc.dims();
        let (v_center, v_size) = (self.center_variance, self.size_variance);

        let offsets = loc.clone().slice([0..batch, 0..detections, 0..2]);
        let log_sizes = loc.slice([0..batch, 0..detections, 2..4]);
        let prior_centers = priors.clone().slice([0..batch, 0..detections, 0..2]);
        let prior_sizes = priors.slice([0..batch, 0..detections, 2..4]);

        let centers = prior_centers + offsets.mul_scalar(v_center) * prior_sizes.clone();
        let sizes = prior_sizes * log_sizes.mul_scalar(v_size).exp();

        Tensor::cat(vec![centers, sizes], 2)
    }

    /// Render one Gaussian field per detection at `size = [height, width]`.
    ///
    /// A fifth location parameter, when present, is the rotation angle in radians.
    /// Further parameters are ignored.
    ///
    /// # Shapes
    ///
    /// - loc: `[batch, detections, params]`
    /// - priors: `[batch, detections, 4]`
    /// - output: `[batch, detections, height, width]`
    pub fn render<B: Backend>(
        &self,
        loc: Tensor<B, 3>,
        priors: Tensor<B, 3>,
        size: [usize; 2],
    ) -> Tensor<B, 4> {
        let [batch, detections, params] = loc.dims();
        let [height, width] = size;
        let device = loc.device();

        let theta = if params >= 5 {
            loc.clone()
                .slice([0..batch, 0..detections, 4..5])
                .reshape([batch, detections, 1, 1])
        } else {
            Tensor::zeros([batch, detections, 1, 1], &device)
        };

        let boxes = self.decode_boxes(loc, priors);
        let component = |index: usize| {
            boxes
                .clone()
                .slice([0..batch, 0..detections, index..index + 1])
                .reshape([batch, detections, 1, 1])
        };
        let (cx, cy, w, h) = (component(0), component(1), component(2), component(3));

        let grid_x = pixel_centers::<B>(width, &device)
            .reshape([1, 1, 1, width])
            .repeat_dim(2, height);
        let grid_y = pixel_centers::<B>(height, &device)
            .reshape([1, 1, height, 1])
            .repeat_dim(3, width);
        let dx = grid_x.repeat_dim(0, batch).repeat_dim(1, detections) - cx;
        let dy = grid_y.repeat_dim(0, batch).repeat_dim(1, detections) - cy;

        let (cos, sin) = (theta.clone().cos(), theta.sin());
        let u = dx.clone() * cos.clone() + dy.clone() * sin.clone();
        let v = dy * cos - dx * sin;

        let sigma_x = w.mul_scalar(self.sigma_scale).add_scalar(self.eps);
        let sigma_y = h.mul_scalar(self.sigma_scale).add_scalar(self.eps);
        let u = u / sigma_x;
        let v = v / sigma_y;

        (u.clone() * u + v.clone() * v).mul_scalar(-0.5).exp()
    }
}

/// Normalized pixel-centre coordinates `(i + 0.5) / n` for `i in 0..n`.
fn pixel_centers<B: Backend>(n: usize, device: &B::Device) -> Tensor<B, 1> {
    Tensor::<B, 1, Int>::arange(0..n as i64, device)
        .float()
        .add_scalar(0.5)
        .div_scalar(n as f64)
}

#[cfg(test)]
mod tests {
    use burn::tensor::{Tensor, TensorData, Tolerance};

    use super::*;
    use crate::tests::{TestAutodiffBackend, TestBackend};

    fn renderer() -> GaussianRenderer {
        GaussianRenderer::new(&GaussianConfig::new(), 1e-6)
    }

    #[test]
    fn decode_boxes_with_zero_offsets_returns_priors() {
        let device = Default::default();
        let priors = Tensor::<TestBackend, 3>::from_data(
            TensorData::from([[[0.25, 0.5, 0.2, 0.4], [0.75, 0.1, 0.1, 0.3]]]),
            &device,
        );
        let loc = Tensor::<TestBackend, 3>::zeros([1, 2, 5], &device);

        let boxes = renderer().decode_boxes(loc, priors.clone());

        boxes
            .into_data()
            .assert_approx_eq::<f32>(&priors.into_data(), Tolerance::absolute(1e-6));
    }

    #[test]
    fn decode_boxes_applies_variances() {
        let device = Default::default();
        let priors =
            Tensor::<TestBackend, 3>::from_data(TensorData::from([[[0.5, 0.5, 0.2, 0.4]]]), &device);
        let loc =
            Tensor::<TestBackend, 3>::from_data(TensorData::from([[[1.0, -1.0, 0.0, 5.0]]]), &device);

        let boxes = renderer().decode_boxes(loc, priors);

        // cx = 0.5 + 1 * 0.1 * 0.2, cy = 0.5 - 0.1 * 0.4, h = 0.4 * exp(5 * 0.2)
        let expected = TensorData::from([[[0.52, 0.46, 0.2, 0.4 * 1.0f32.exp()]]]);
        boxes
            .into_data()
            .assert_approx_eq::<f32>(&expected, Tolerance::absolute(1e-5));
    }

    #[test]
    fn render_peaks_at_box_center_and_stays_non_negative() {
        let device = Default::default();
        // Centre on the pixel (2, 5) of an 8x8 grid: x = 5.5 / 8, y = 2.5 / 8
        let priors = Tensor::<TestBackend, 3>::from_data(
            TensorData::from([[[5.5 / 8.0, 2.5 / 8.0, 0.25, 0.25]]]),
            &device,
        );
        let loc = Tensor::<TestBackend, 3>::zeros([1, 1, 4], &device);

        let field = renderer().render(loc, priors, [8, 8]);

        assert_eq!(field.dims(), [1, 1, 8, 8]);
        let values = field.into_data().to_vec::<f32>().unwrap();
        let (argmax, max) = values
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, v)| if v > best.1 { (i, v) } else { best });
        assert_eq!(argmax, 2 * 8 + 5);
        assert!((max - 1.0).abs() < 1e-5, "Unnormalized peak should be 1");
        assert!(values.iter().all(|&v| v >= 0.0 && v.is_finite()));
    }

    #[test]
    fn render_rotation_by_quarter_turn_swaps_axes() {
        let device = Default::default();
        let priors = Tensor::<TestBackend, 3>::from_data(
            TensorData::from([[[0.5, 0.5, 0.4, 0.1], [0.5, 0.5, 0.1, 0.4]]]),
            &device,
        );
        let quarter = core::f64::consts::FRAC_PI_2;
        let loc = Tensor::<TestBackend, 3>::from_data(
            TensorData::from([[[0.0, 0.0, 0.0, 0.0, quarter], [0.0, 0.0, 0.0, 0.0, 0.0]]]),
            &device,
        );

        let field = renderer().render(loc, priors, [16, 16]);

        let rotated = field.clone().slice([0..1, 0..1, 0..16, 0..16]);
        let upright = field.slice([0..1, 1..2, 0..16, 0..16]);
        rotated
            .into_data()
            .assert_approx_eq::<f32>(&upright.into_data(), Tolerance::absolute(1e-4));
    }

    #[test]
    fn render_degenerate_boxes_stays_finite() {
        let device = Default::default();
        let priors = Tensor::<TestBackend, 3>::zeros([2, 3, 4], &device);
        let loc = Tensor::<TestBackend, 3>::zeros([2, 3, 5], &device);

        let field = renderer().render(loc, priors, [4, 4]);

        let values = field.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite() && *v >= 0.0));
    }

    #[test]
    fn render_is_differentiable_in_location() {
        let device = Default::default();
        let priors = Tensor::<TestAutodiffBackend, 3>::from_data(
            TensorData::from([[[0.4, 0.6, 0.3, 0.3]]]),
            &device,
        );
        let loc = Tensor::<TestAutodiffBackend, 3>::from_data(
            TensorData::from([[[0.1, -0.2, 0.3, 0.1, 0.2]]]),
            &device,
        )
        .require_grad();

        let grads = renderer()
            .render(loc.clone(), priors, [8, 8])
            .sum()
            .backward();
        let grad = loc.grad(&grads).expect("location should receive a gradient");

        let grad = grad.into_data().to_vec::<f32>().unwrap();
        assert_eq!(grad.len(), 5);
        assert!(grad.iter().all(|g| g.is_finite()));
        assert!(grad[2].abs() > 0.0, "Width offset must influence the footprint");
    }
}
