//! Bilinear resize with half-pixel centres.
//!
//! Burn's `interpolate` samples bilinear grids with aligned corners. Attention fields
//! produced at prototype resolution are upsampled to image resolution with pixel
//! centres at `(i + 0.5) * in / out - 0.5` instead, so the resize is expressed as two
//! separable interpolation matrices applied with `matmul`. This keeps the operation
//! differentiable on every backend.

use burn::prelude::*;

/// Interpolation matrix of shape `[output, input]` for one axis.
///
/// Row `i` holds the two non-zero weights that produce output sample `i`. Source
/// positions left of the first sample are clamped to it, positions right of the last
/// sample reuse it, and every row sums to one.
pub fn bilinear_weights(input: usize, output: usize) -> Vec<f32> {
    let mut weights = vec![0.0f32; output * input];
    if input == 0 || output == 0 {
        return weights;
    }

    let scale = input as f64 / output as f64;
    for dst in 0..output {
        let src = ((dst as f64 + 0.5) * scale - 0.5).max(0.0);
        let lower = (src.floor() as usize).min(input - 1);
        let upper = if lower + 1 < input { lower + 1 } else { lower };
        let frac = (src - lower as f64) as f32;

        weights[dst * input + lower] += 1.0 - frac;
        weights[dst * input + upper] += frac;
    }
    weights
}

fn weight_matrix<B: Backend>(input: usize, output: usize, device: &B::Device) -> Tensor<B, 2> {
    Tensor::<B, 1>::from_floats(bilinear_weights(input, output).as_slice(), device)
        .reshape([output, input])
}

/// Resize `[batch, channels, height, width]` to `[batch, channels, size[0], size[1]]`.
///
/// Equivalent to bilinear interpolation without corner alignment. When the size already
/// matches the input is returned untouched.
pub fn resize_bilinear<B: Backend>(tensor: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
    let [batch, channels, height, width] = tensor.dims();
    let [out_height, out_width] = size;
    if height == out_height && width == out_width {
        return tensor;
    }

    let device = tensor.device();
    let planes = batch * channels;

    // Width pass: [planes * H, W] x [W, W'] -> [planes, H, W']
    let width_t = weight_matrix::<B>(width, out_width, &device).transpose();
    let rows = tensor
        .reshape([planes * height, width])
        .matmul(width_t)
        .reshape([planes, height, out_width]);

    // Height pass on the transposed planes: [planes * W', H] x [H, H'] -> [planes, W', H']
    let height_t = weight_matrix::<B>(height, out_height, &device).transpose();
    rows.swap_dims(1, 2)
        .reshape([planes * out_width, height])
        .matmul(height_t)
        .reshape([planes, out_width, out_height])
        .swap_dims(1, 2)
        .reshape([batch, channels, out_height, out_width])
}
