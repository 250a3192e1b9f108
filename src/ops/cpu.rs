//! Parallel generic tensor kernels
//!
//! # Generic Backend
//!
//! These are the kernels that run whenever the dispatch layer does not pick an
//! accelerated library: always for host tensors, and for accelerator tensors
//! under [`Policy::Never`](crate::backend::Policy::Never) or when the library
//! cannot serve the call.
//!
//! ## Features
//!
//! - Parallel execution using [`rayon`](https://docs.rs/rayon), one task per
//!   independent output plane
//! - Direct convolution with stride, zero padding and dilation
//! - Elementwise activations with forward and backward pass
//!
//! ## Design Goals
//!
//! - Deterministic results: reductions are never split across threads, so
//!   every output element is summed in one fixed order
//! - Outputs inherit the device of their inputs
//!
//! The convolution forward accumulates each output element over
//! `(channel, ky, kx)` in that order starting from `0.0` and adds the bias
//! last. Accelerated backends that want bit-identical results must do the same.

use rayon::prelude::*;

use crate::backend::ConvGeometry;
use crate::layers::Activation;
use crate::tensors::Tensor;

#[inline]
fn input_coord(o: usize, stride: usize, k: usize, dilation: usize, pad: usize, limit: usize) -> Option<usize> {
    let pos = o * stride + k * dilation;
    if pos < pad || pos - pad >= limit {
        None
    } else {
        Some(pos - pad)
    }
}

/// Direct 2-D convolution `y = conv(x, w) + b`.
///
/// # Returns
/// Tensor of shape `(n, out, oh, ow)` on `x`'s device.
pub fn conv2d_forward(geom: &ConvGeometry, x: &Tensor, w: &Tensor, b: Option<&Tensor>) -> Tensor {
    let [_, c, h, wd] = geom.input;
    let [oc, _, kh, kw] = geom.weight;
    let (oh, ow) = geom.output;
    let (sy, sx) = geom.stride;
    let (py, px) = geom.pad;
    let (dy, dx) = geom.dilation;

    let x_data = x.data();
    let w_data = w.data();
    let b_data = b.map(Tensor::data);

    let shape = geom.output_shape();
    let mut out = vec![0.0f32; shape.iter().product()];

    out.par_chunks_mut(oh * ow)
        .enumerate()
        .for_each(|(plane, out_plane)| {
            let (ni, o) = (plane / oc, plane % oc);
            let bias = b_data.map_or(0.0, |b| b[o]);
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = 0.0f32;
                    for ci in 0..c {
                        let x_plane = &x_data[(ni * c + ci) * h * wd..][..h * wd];
                        let w_plane = &w_data[(o * c + ci) * kh * kw..][..kh * kw];
                        for ky in 0..kh {
                            let Some(iy) = input_coord(oy, sy, ky, dy, py, h) else {
                                continue;
                            };
                            for kx in 0..kw {
                                let Some(ix) = input_coord(ox, sx, kx, dx, px, wd) else {
                                    continue;
                                };
                                acc += x_plane[iy * wd + ix] * w_plane[ky * kw + kx];
                            }
                        }
                    }
                    out_plane[oy * ow + ox] = acc + bias;
                }
            }
        });

    Tensor::from_parts(shape.to_vec(), out, x.device())
}

/// Gradient of a convolution with respect to its input.
///
/// Computed as a gather per input element so every element is owned by one task.
pub fn conv2d_backward_data(geom: &ConvGeometry, w: &Tensor, gy: &Tensor) -> Tensor {
    let [_, c, h, wd] = geom.input;
    let [oc, _, kh, kw] = geom.weight;
    let (oh, ow) = geom.output;
    let (sy, sx) = geom.stride;
    let (py, px) = geom.pad;
    let (dy, dx) = geom.dilation;

    let w_data = w.data();
    let gy_data = gy.data();
    let mut gx = vec![0.0f32; geom.input.iter().product()];

    // output coordinate reading input coordinate `i` through kernel tap `k`
    let source = |i: usize, k: usize, stride: usize, dil: usize, pad: usize, limit: usize| {
        let t = (i + pad).checked_sub(k * dil)?;
        (t % stride == 0 && t / stride < limit).then_some(t / stride)
    };

    gx.par_chunks_mut(h * wd)
        .enumerate()
        .for_each(|(plane, gx_plane)| {
            let (ni, ci) = (plane / c, plane % c);
            for iy in 0..h {
                for ix in 0..wd {
                    let mut acc = 0.0f32;
                    for o in 0..oc {
                        let gy_plane = &gy_data[(ni * oc + o) * oh * ow..][..oh * ow];
                        let w_plane = &w_data[(o * c + ci) * kh * kw..][..kh * kw];
                        for ky in 0..kh {
                            let Some(oy) = source(iy, ky, sy, dy, py, oh) else {
                                continue;
                            };
                            for kx in 0..kw {
                                let Some(ox) = source(ix, kx, sx, dx, px, ow) else {
                                    continue;
                                };
                                acc += gy_plane[oy * ow + ox] * w_plane[ky * kw + kx];
                            }
                        }
                    }
                    gx_plane[iy * wd + ix] = acc;
                }
            }
        });

    Tensor::from_parts(geom.input.to_vec(), gx, gy.device())
}

/// Gradient of a convolution with respect to its weight.
pub fn conv2d_backward_filter(geom: &ConvGeometry, x: &Tensor, gy: &Tensor) -> Tensor {
    let [n, c, h, wd] = geom.input;
    let [oc, _, kh, kw] = geom.weight;
    let (oh, ow) = geom.output;
    let (sy, sx) = geom.stride;
    let (py, px) = geom.pad;
    let (dy, dx) = geom.dilation;

    let x_data = x.data();
    let gy_data = gy.data();
    let mut gw = vec![0.0f32; geom.weight.iter().product()];

    gw.par_chunks_mut(kh * kw)
        .enumerate()
        .for_each(|(slice, gw_slice)| {
            let (o, ci) = (slice / c, slice % c);
            for ky in 0..kh {
                for kx in 0..kw {
                    let mut acc = 0.0f32;
                    for ni in 0..n {
                        let x_plane = &x_data[(ni * c + ci) * h * wd..][..h * wd];
                        let gy_plane = &gy_data[(ni * oc + o) * oh * ow..][..oh * ow];
                        for oy in 0..oh {
                            let Some(iy) = input_coord(oy, sy, ky, dy, py, h) else {
                                continue;
                            };
                            for ox in 0..ow {
                                let Some(ix) = input_coord(ox, sx, kx, dx, px, wd) else {
                                    continue;
                                };
                                acc += gy_plane[oy * ow + ox] * x_plane[iy * wd + ix];
                            }
                        }
                    }
                    gw_slice[ky * kw + kx] = acc;
                }
            }
        });

    Tensor::from_parts(geom.weight.to_vec(), gw, gy.device())
}

/// Gradient of a convolution with respect to its bias: `gy` summed over batch and space.
pub fn conv2d_backward_bias(geom: &ConvGeometry, gy: &Tensor) -> Tensor {
    let n = geom.input[0];
    let oc = geom.weight[0];
    let plane = geom.output.0 * geom.output.1;
    let gy_data = gy.data();

    let gb = (0..oc)
        .into_par_iter()
        .map(|o| {
            (0..n)
                .map(|ni| gy_data[(ni * oc + o) * plane..][..plane].iter().sum::<f32>())
                .sum::<f32>()
        })
        .collect::<Vec<_>>();

    Tensor::from_parts(vec![oc], gb, gy.device())
}

/// Applies `kind` element-wise.
///
/// # Example
/// ```rust
/// use mlpconv::layers::Activation;
/// use mlpconv::ops::cpu::activation_forward;
/// use mlpconv::tensor;
///
/// let y = activation_forward(Activation::Relu, &tensor!([-1.0, 0.0, 2.0]));
/// assert_eq!(y.data(), &[0.0, 0.0, 2.0]);
/// ```
pub fn activation_forward(kind: Activation, x: &Tensor) -> Tensor {
    let mut out = vec![0.0f32; x.len()];
    out.par_iter_mut()
        .zip(x.data().par_iter())
        .for_each(|(y, &v)| *y = kind.eval(v));
    Tensor::from_parts(x.shape().to_vec(), out, x.device())
}

/// Propagates `gy` through `kind`, given the forward input `x` and output `y`.
///
/// - ReLU passes `gy` where `x > 0`
/// - Sigmoid multiplies by `y * (1 - y)`
/// - Tanh multiplies by `1 - y^2`
pub fn activation_backward(kind: Activation, x: &Tensor, y: &Tensor, gy: &Tensor) -> Tensor {
    let mut grad = vec![0.0f32; gy.len()];
    grad.par_iter_mut()
        .zip(x.data().par_iter())
        .zip(y.data().par_iter())
        .zip(gy.data().par_iter())
        .for_each(|(((g, &xv), &yv), &dy)| *g = kind.derivative(xv, yv) * dy);
    Tensor::from_parts(gy.shape().to_vec(), grad, gy.device())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ConvGeometry;

    fn geom(input: [usize; 4], weight: [usize; 4], stride: usize, pad: usize) -> ConvGeometry {
        ConvGeometry::new(input, weight, (stride, stride), (pad, pad), (1, 1)).unwrap()
    }

    #[test]
    fn input_coord_skips_padding() {
        assert_eq!(input_coord(0, 1, 0, 1, 1, 4), None);
        assert_eq!(input_coord(0, 1, 1, 1, 1, 4), Some(0));
        assert_eq!(input_coord(3, 1, 2, 1, 1, 4), None);
    }

    #[test]
    fn single_channel_valid_convolution() {
        // 1x1x3x3 input, 1x1x2x2 all-ones kernel → sums of 2x2 windows
        let g = geom([1, 1, 3, 3], [1, 1, 2, 2], 1, 0);
        let x = Tensor::new(vec![1, 1, 3, 3], (1..=9).map(|v| v as f32).collect());
        let w = Tensor::new(vec![1, 1, 2, 2], vec![1.0; 4]);
        let y = conv2d_forward(&g, &x, &w, None);
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        assert_eq!(y.data(), &[12.0, 16.0, 24.0, 28.0]);
    }

    #[test]
    fn padding_and_stride_shape_the_output() {
        let g = geom([1, 1, 4, 4], [1, 1, 3, 3], 2, 1);
        let x = Tensor::new(vec![1, 1, 4, 4], vec![1.0; 16]);
        let w = Tensor::new(vec![1, 1, 3, 3], vec![1.0; 9]);
        let b = Tensor::new(vec![1], vec![0.5]);
        let y = conv2d_forward(&g, &x, &w, Some(&b));
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        // top-left window sees a 2x2 patch, the others 3x2 / 2x3 / 3x3
        assert_eq!(y.data(), &[4.5, 6.5, 6.5, 9.5]);
    }

    #[test]
    fn backward_data_is_the_adjoint_of_forward() {
        // <conv(x), gy> == <x, conv_backward_data(gy)>
        let g = geom([2, 2, 5, 5], [3, 2, 3, 3], 2, 1);
        let x = Tensor::new(
            vec![2, 2, 5, 5],
            (0..100).map(|i| ((i * 7 % 11) as f32) - 5.0).collect(),
        );
        let w = Tensor::new(
            vec![3, 2, 3, 3],
            (0..54).map(|i| ((i * 5 % 7) as f32) * 0.25 - 0.75).collect(),
        );
        let y = conv2d_forward(&g, &x, &w, None);
        let gy = Tensor::new(
            y.shape().to_vec(),
            (0..y.len()).map(|i| ((i % 4) as f32) - 1.5).collect(),
        );
        let gx = conv2d_backward_data(&g, &w, &gy);

        let lhs: f32 = y.data().iter().zip(gy.data()).map(|(a, b)| a * b).sum();
        let rhs: f32 = x.data().iter().zip(gx.data()).map(|(a, b)| a * b).sum();
        assert!((lhs - rhs).abs() < 1e-3, "{lhs} vs {rhs}");
    }

    #[test]
    fn backward_filter_is_the_adjoint_in_the_weight() {
        let g = geom([1, 2, 4, 4], [2, 2, 2, 2], 1, 0);
        let x = Tensor::new(
            vec![1, 2, 4, 4],
            (0..32).map(|i| (i % 5) as f32 - 2.0).collect(),
        );
        let w = Tensor::new(vec![2, 2, 2, 2], (0..16).map(|i| (i % 3) as f32).collect());
        let y = conv2d_forward(&g, &x, &w, None);
        let gy = Tensor::new(y.shape().to_vec(), vec![1.0; y.len()]);
        let gw = conv2d_backward_filter(&g, &x, &gy);

        let lhs: f32 = y.data().iter().sum();
        let rhs: f32 = w.data().iter().zip(gw.data()).map(|(a, b)| a * b).sum();
        assert!((lhs - rhs).abs() < 1e-4);
    }

    #[test]
    fn bias_gradient_sums_batch_and_space() {
        let g = geom([2, 1, 2, 2], [2, 1, 1, 1], 1, 0);
        let gy = Tensor::new(vec![2, 2, 2, 2], (0..16).map(|i| i as f32).collect());
        let gb = conv2d_backward_bias(&g, &gy);
        // channel 0: 0..4 and 8..12, channel 1: 4..8 and 12..16
        assert_eq!(gb.data(), &[44.0, 76.0]);
    }
}
