//! Per-step diagnostics.
//!
//! The loss never owns a global step counter or writer. The caller passes a
//! [`StepContext`] to every forward call and advances it once the step is done.

use burn::tensor::TensorData;

/// Receiver of diagnostic scalars and images. Nothing written here affects the loss.
pub trait MetricsSink {
    /// Record a scalar under `tag` at `step`.
    fn record_scalar(&mut self, tag: &str, step: u64, value: f64);

    /// Record an image under `tag` at `step`. Only called when
    /// [`wants_images`](Self::wants_images) returns `true`.
    fn record_image(&mut self, _tag: &str, _step: u64, _image: TensorData) {}

    /// Whether the sink accepts images. Reading images off the device is costly.
    fn wants_images(&self) -> bool {
        false
    }

    /// Whether the sink records anything at all. Diagnostics are skipped otherwise.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record_scalar(&mut self, _tag: &str, _step: u64, _value: f64) {}

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Emits every scalar as a `tracing` debug event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record_scalar(&mut self, tag: &str, step: u64, value: f64) {
        tracing::debug!(tag, step, value, "scalar");
    }
}

/// Step counter and metrics sink for one training run.
pub struct StepContext<'a> {
    step: u64,
    sink: &'a mut dyn MetricsSink,
}

impl<'a> StepContext<'a> {
    /// A context starting at step 0.
    pub fn new(sink: &'a mut dyn MetricsSink) -> Self {
        Self { step: 0, sink }
    }

    /// Resume at `step`.
    #[must_use]
    pub fn with_step(mut self, step: u64) -> Self {
        self.step = step;
        self
    }

    /// Current step number.
    pub const fn step(&self) -> u64 {
        self.step
    }

    /// Move to the next step.
    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.sink.is_enabled()
    }

    pub(crate) fn wants_images(&self) -> bool {
        self.sink.wants_images()
    }

    pub(crate) fn record_scalar(&mut self, tag: &str, value: f64) {
        self.sink.record_scalar(tag, self.step, value);
    }

    pub(crate) fn record_image(&mut self, tag: &str, image: TensorData) {
        self.sink.record_image(tag, self.step, image);
    }
}

impl core::fmt::Debug for StepContext<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StepContext")
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}
