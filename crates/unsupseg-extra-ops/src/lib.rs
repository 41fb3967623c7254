//! Additional operations for the Burn deep learning framework
//!
//! This crate provides tensor operations needed by the unsupervised segmentation loss
//! that are not available in the core Burn framework, or whose Burn counterpart has
//! different semantics:
//!
//! - [`gather_batched`]: per-batch-element index gather along the detection axis, with a
//!   checked batch dimension.
//! - [`resize_bilinear`]: bilinear resize with half-pixel centres (no corner alignment).
//! - [`strict_upper_max`]: column-wise max over the strict upper triangle of a batch of
//!   square matrices.

mod gather;
mod resize;
mod triangular;

use burn::prelude::*;

// Convenient re-exports
#[doc(inline)]
pub use gather::{gather_batched, GatherError, GatherResult};
#[doc(inline)]
pub use resize::{bilinear_weights, resize_bilinear};
#[doc(inline)]
pub use triangular::strict_upper_max;

/// Additional operations for Burn tensors
pub trait TensorExtraOps<B: Backend> {
    /// Resize the two trailing spatial dimensions with half-pixel bilinear interpolation.
    fn resize_bilinear(self, size: [usize; 2]) -> Self;
}

impl<B: Backend> TensorExtraOps<B> for Tensor<B, 4> {
    fn resize_bilinear(self, size: [usize; 2]) -> Self {
        resize_bilinear(self, size)
    }
}
