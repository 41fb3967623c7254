use thiserror::Error;
use unsupseg_extra_ops::GatherError;

/// The error type for unsupervised loss construction and evaluation.
///
/// Configuration errors are raised by [`UnsupervisedLossConfig::init`](crate::UnsupervisedLossConfig::init);
/// everything else is raised by a forward call and propagates unchanged to the caller.
#[derive(Error, Debug)]
pub enum UnsupervisedLossError {
    /// The configuration is logically inconsistent.
    #[error("Invalid loss configuration: {reason}")]
    InvalidConfiguration {
        /// The reason why the configuration is invalid.
        reason: String,
    },

    /// An input tensor disagrees with the configuration or with another input.
    #[error("Invalid shape for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Which tensor was rejected.
        what: &'static str,
        /// The expected shape.
        expected: String,
        /// The actual shape.
        actual: String,
    },

    /// A batched gather was given an index set built for another batch.
    #[error(transparent)]
    Gather(#[from] GatherError),

    /// The scale-factor source has no weight for an emitted loss.
    #[error("Scale source has no entry for loss '{name}'")]
    MissingScale {
        /// The name of the loss.
        name: String,
    },

    /// The scale-factor source returned a negative or non-finite weight.
    #[error("Scale for loss '{name}' must be finite and non-negative, got {value}")]
    InvalidScale {
        /// The name of the loss.
        name: String,
        /// The rejected weight.
        value: f64,
    },

    /// A NaN survived the epsilon guards.
    #[error("NaN detected after {stage}")]
    NonFinite {
        /// The pipeline stage whose output contained NaN.
        stage: &'static str,
    },
}

/// A specialized `Result` type for unsupervised loss operations.
pub type UnsupervisedLossResult<T> = Result<T, UnsupervisedLossError>;

pub(crate) fn expect_dims<const D: usize>(
    what: &'static str,
    actual: [usize; D],
    expected: [usize; D],
) -> UnsupervisedLossResult<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(UnsupervisedLossError::ShapeMismatch {
            what,
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        })
    }
}
