//! Batched index gather along the detection axis.
//!
//! Detection tensors are laid out as `[batch, detections, ...]`. Selecting a subset of
//! detections independently per image cannot be expressed with plain `select`, which
//! applies one shared index list to every batch element. [`gather_batched`] expands a
//! `[batch, k]` index set over the trailing dimensions and gathers along dimension 1.

use burn::{
    prelude::*,
    tensor::{Numeric, Shape},
};
use thiserror::Error;

/// Errors raised by the batched gather.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GatherError {
    /// The index set was built for a different batch than the tensor being gathered.
    #[error("index set batch size {index_batch} does not match tensor batch size {tensor_batch}")]
    BatchMismatch {
        /// Leading dimension of the gathered tensor.
        tensor_batch: usize,
        /// Leading dimension of the index set.
        index_batch: usize,
    },

    /// Gathering along the detection axis requires at least `[batch, detections]`.
    #[error("batched gather needs a tensor of rank >= 2, got rank {rank}")]
    RankTooSmall {
        /// Rank of the offending tensor.
        rank: usize,
    },
}

/// A specialized `Result` type for gather operations.
pub type GatherResult<T> = Result<T, GatherError>;

/// Gather detections per batch element.
///
/// `indices[b, k]` names the detection of image `b` that lands in slot `k`. Trailing
/// dimensions of `tensor` are carried along unchanged, so gathering `loc`, `mask`,
/// `conf` and `priors` with the same index set keeps them in correspondence.
///
/// Index values must lie in `0..tensor.dims()[1]`.
///
/// # Shapes
///
/// - tensor: `[batch, n, d2, ..]`
/// - indices: `[batch, k]`
/// - output: `[batch, k, d2, ..]`
///
/// # Errors
///
/// Returns [`GatherError::BatchMismatch`] when the batch sizes disagree and
/// [`GatherError::RankTooSmall`] for rank-1 tensors.
pub fn gather_batched<B: Backend, const D: usize, K>(
    tensor: Tensor<B, D, K>,
    indices: Tensor<B, 2, Int>,
) -> GatherResult<Tensor<B, D, K>>
where
    K: Numeric<B>,
{
    if D < 2 {
        return Err(GatherError::RankTooSmall { rank: D });
    }

    let dims = tensor.dims();
    let [index_batch, k] = indices.dims();
    if dims[0] != index_batch {
        return Err(GatherError::BatchMismatch {
            tensor_batch: dims[0],
            index_batch,
        });
    }

    let index_shape: [usize; D] = core::array::from_fn(|dim| match dim {
        0 => index_batch,
        1 => k,
        _ => 1,
    });

    let mut expanded: Tensor<B, D, Int> = indices.reshape(Shape::new(index_shape));
    for (dim, &size) in dims.iter().enumerate().skip(2) {
        expanded = expanded.repeat_dim(dim, size);
    }

    Ok(tensor.gather(1, expanded))
}

#[cfg(test)]
mod tests {
    use burn::tensor::{Tensor, TensorData};

    use super::*;
    use crate::tests::{TestAutodiffBackend, TestBackend};

    #[test]
    fn gather_batched_selects_rows_independently_per_image() {
        let device = Default::default();
        let loc = Tensor::<TestBackend, 3>::from_data(
            TensorData::from([
                [[0.0, 0.5], [1.0, 1.5], [2.0, 2.5]],
                [[10.0, 10.5], [11.0, 11.5], [12.0, 12.5]],
            ]),
            &device,
        );
        let indices =
            Tensor::<TestBackend, 2, Int>::from_data(TensorData::from([[2, 0], [1, 1]]), &device);

        let gathered = gather_batched(loc, indices).expect("batch sizes agree");

        assert_eq!(gathered.dims(), [2, 2, 2]);
        let values = gathered.into_data().to_vec::<f32>().unwrap();
        assert_eq!(
            values,
            vec![2.0, 2.5, 0.0, 0.5, 11.0, 11.5, 11.0, 11.5],
            "Each image must use its own index row"
        );
    }

    #[test]
    fn gather_batched_keeps_correspondence_across_tensors() {
        let device = Default::default();
        // Every tensor encodes the original prior id so correspondence is checkable.
        let conf = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[0.0, 1.0, 2.0, 3.0]]),
            &device,
        );
        let loc = conf.clone().unsqueeze_dim::<3>(2).repeat_dim(2, 4);
        let mask = conf.clone().unsqueeze_dim::<3>(2).repeat_dim(2, 2);
        let proto_ids = Tensor::<TestBackend, 2, Int>::from_data(
            TensorData::from([[0, 1, 2, 3]]),
            &device,
        );
        let indices =
            Tensor::<TestBackend, 2, Int>::from_data(TensorData::from([[3, 1, 0]]), &device);

        let conf = gather_batched(conf, indices.clone()).unwrap();
        let loc = gather_batched(loc, indices.clone()).unwrap();
        let mask = gather_batched(mask, indices.clone()).unwrap();
        let ids = gather_batched(proto_ids, indices).unwrap();

        let conf = conf.into_data().to_vec::<f32>().unwrap();
        let ids = ids.into_data().to_vec::<i64>().unwrap();
        let loc = loc.into_data().to_vec::<f32>().unwrap();
        let mask = mask.into_data().to_vec::<f32>().unwrap();

        assert_eq!(ids, vec![3, 1, 0]);
        for (slot, &id) in ids.iter().enumerate() {
            assert_eq!(conf[slot], id as f32);
            assert!(loc[slot * 4..slot * 4 + 4].iter().all(|&v| v == id as f32));
            assert!(mask[slot * 2..slot * 2 + 2].iter().all(|&v| v == id as f32));
        }
    }

    #[test]
    fn gather_batched_rejects_mismatched_batch() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 3>::zeros([2, 4, 3], &device);
        let indices = Tensor::<TestBackend, 2, Int>::zeros([3, 2], &device);

        let result = gather_batched(tensor, indices);

        assert_eq!(
            result.unwrap_err(),
            GatherError::BatchMismatch {
                tensor_batch: 2,
                index_batch: 3
            }
        );
    }

    #[test]
    fn gather_batched_rejects_rank_one_tensor() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 1>::zeros([4], &device);
        let indices = Tensor::<TestBackend, 2, Int>::zeros([1, 2], &device);

        let result = gather_batched(tensor, indices);

        assert_eq!(result.unwrap_err(), GatherError::RankTooSmall { rank: 1 });
    }

    #[test]
    fn gather_batched_routes_gradients_to_selected_rows_only() {
        let device = Default::default();
        let tensor = Tensor::<TestAutodiffBackend, 3>::ones([1, 3, 2], &device).require_grad();
        let indices =
            Tensor::<TestAutodiffBackend, 2, Int>::from_data(TensorData::from([[2, 0]]), &device);

        let gathered = gather_batched(tensor.clone(), indices).unwrap();
        let grads = gathered.sum().backward();
        let grad = tensor.grad(&grads).expect("gradient should exist");

        let grad = grad.into_data().to_vec::<f32>().unwrap();
        assert_eq!(grad, vec![1.0, 1.0, 0.0, 0.0, 1.0, 1.0]);
    }
}
