//! External per-loss weights.
//!
//! The weights may change between steps (an operator can edit them while training
//! runs), so the loss takes one [`snapshot`](ScaleSource::snapshot) per forward call and
//! never caches it.

use std::collections::HashMap;

use burn::prelude::*;

use crate::error::{UnsupervisedLossError, UnsupervisedLossResult};

/// Key of the background variance loss.
pub const BACKGROUND_LOSS: &str = "background";
/// Key of the masked reconstruction loss.
pub const RECONSTRUCTION_LOSS: &str = "reconstruction";

/// A source of per-loss scale factors.
pub trait ScaleSource {
    /// Current weight of every loss, keyed by loss name.
    fn snapshot(&self) -> HashMap<String, f64>;
}

impl ScaleSource for HashMap<String, f64> {
    fn snapshot(&self) -> HashMap<String, f64> {
        self.clone()
    }
}

/// Fixed scale factors, loadable from JSON.
#[derive(Config, Debug)]
pub struct StaticScales {
    /// Weight of the background variance loss.
    #[config(default = 0.01)]
    pub background: f64,
    /// Weight of the masked reconstruction loss.
    #[config(default = 1.0)]
    pub reconstruction: f64,
}

impl ScaleSource for StaticScales {
    fn snapshot(&self) -> HashMap<String, f64> {
        HashMap::from([
            (BACKGROUND_LOSS.to_string(), self.background),
            (RECONSTRUCTION_LOSS.to_string(), self.reconstruction),
        ])
    }
}

/// Look up the weight of `name`, rejecting missing, negative or non-finite entries.
pub(crate) fn resolve_scale(scales: &HashMap<String, f64>, name: &str) -> UnsupervisedLossResult<f64> {
    let value = *scales
        .get(name)
        .ok_or_else(|| UnsupervisedLossError::MissingScale {
            name: name.to_string(),
        })?;

    if !value.is_finite() || value < 0.0 {
        return Err(UnsupervisedLossError::InvalidScale {
            name: name.to_string(),
            value,
        });
    }
    Ok(value)
}
