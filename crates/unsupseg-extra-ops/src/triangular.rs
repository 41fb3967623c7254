//! Reductions over the strict upper triangle of square matrices.

use burn::prelude::*;

/// Column-wise maximum over the strict upper triangle of a batch of square matrices.
///
/// For every column `j` this returns `max_{i < j} matrix[b, i, j]`, i.e. the diagonal and
/// everything below it are masked to zero first. Columns with no entry above the
/// diagonal (column 0, or a 1x1 matrix) yield `0`, so the input is expected to be
/// non-negative.
///
/// # Shapes
///
/// - matrix: `[batch, n, n]`
/// - output: `[batch, n]`
pub fn strict_upper_max<B: Backend>(matrix: Tensor<B, 3>) -> Tensor<B, 2> {
    let [batch, rows, cols] = matrix.dims();
    debug_assert_eq!(rows, cols, "strict_upper_max expects square matrices");

    // Reduce over the trailing axis: burn's max_dim backward scatters into the last dim.
    matrix
        .triu(1)
        .swap_dims(1, 2)
        .max_dim(2)
        .reshape([batch, cols])
}
