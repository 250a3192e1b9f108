//! In-process accelerated backend built on im2col + GEMM.
//!
//! [`GemmBackend`] lowers every convolution to one matrix product per image:
//! the input patches are unrolled into a `(oh * ow) x (c * kh * kw)` column
//! matrix and multiplied with the weight viewed as `out x (c * kh * kw)`.
//!
//! The forward product accumulates each output element over the column index
//! in ascending order from `0.0` and adds the bias last, which is exactly the
//! order of [`cpu::conv2d_forward`](super::cpu::conv2d_forward). Padded taps
//! contribute `0.0` products, so the two kernels agree bit for bit on finite
//! inputs.
//!
//! Two backward-data algorithms are provided, selected through
//! [`BackwardDataVariant`]: `V2` scatters the column gradient back with
//! col2im, `V3` gathers each input gradient directly.

use rayon::prelude::*;

use crate::backend::{
    AcceleratedBackend, BackwardDataVariant, Capabilities, CapabilityProbe, ConvGeometry,
};
use crate::error::{Error, Result};
use crate::layers::Activation;
use crate::tensors::Tensor;

/// im2col/GEMM convolution library.
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use mlpconv::backend::{select_backward_data_variant, BackwardDataVariant, CapabilityProbe};
/// use mlpconv::ops::gemm::GemmBackend;
///
/// let old = GemmBackend::new().with_library_version(2000);
/// assert_eq!(select_backward_data_variant(&old.capabilities()), BackwardDataVariant::V2);
/// mlpconv::config::set_global_backend(Some(Arc::new(GemmBackend::new())));
/// # mlpconv::config::set_global_backend(None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GemmBackend {
    library_version: u32,
    backward_data_v3_min_version: u32,
}

impl Default for GemmBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GemmBackend {
    /// Version reported by [`GemmBackend::new`].
    pub const DEFAULT_LIBRARY_VERSION: u32 = 8000;

    /// A backend reporting [`Self::DEFAULT_LIBRARY_VERSION`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            library_version: Self::DEFAULT_LIBRARY_VERSION,
            backward_data_v3_min_version: Capabilities::DEFAULT_BACKWARD_DATA_V3_MIN_VERSION,
        }
    }

    /// Reports `version` as the library version.
    #[must_use]
    pub const fn with_library_version(mut self, version: u32) -> Self {
        self.library_version = version;
        self
    }

    /// Reports `version` as the first version with the v3 backward-data algorithm.
    #[must_use]
    pub const fn with_backward_data_v3_min_version(mut self, version: u32) -> Self {
        self.backward_data_v3_min_version = version;
        self
    }

    fn reject_dilation(geom: &ConvGeometry) -> Result<()> {
        if geom.dilation == (1, 1) {
            Ok(())
        } else {
            Err(Error::environment(format!(
                "gemm backend does not support dilated convolutions (dilation {:?})",
                geom.dilation
            )))
        }
    }
}

impl CapabilityProbe for GemmBackend {
    fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::new("gemm", self.library_version);
        caps.backward_data_v3_min_version = self.backward_data_v3_min_version;
        caps
    }
}

/// Patch column index `k = (ci * kh + ky) * kw + kx` for output pixel `p`,
/// or `None` where the tap falls into the padding.
#[inline]
fn tap(geom: &ConvGeometry, p: usize, k: usize) -> Option<usize> {
    let [_, _, h, wd] = geom.input;
    let [_, _, kh, kw] = geom.weight;
    let ow = geom.output.1;
    let (oy, ox) = (p / ow, p % ow);
    let (ci, rem) = (k / (kh * kw), k % (kh * kw));
    let (ky, kx) = (rem / kw, rem % kw);
    let iy = (oy * geom.stride.0 + ky).checked_sub(geom.pad.0).filter(|&v| v < h)?;
    let ix = (ox * geom.stride.1 + kx).checked_sub(geom.pad.1).filter(|&v| v < wd)?;
    Some((ci * h + iy) * wd + ix)
}

/// Unrolls one image into a row-major `(oh * ow) x (c * kh * kw)` matrix.
fn im2col(geom: &ConvGeometry, image: &[f32]) -> Vec<f32> {
    let [_, c, _, _] = geom.input;
    let [_, _, kh, kw] = geom.weight;
    let cols = c * kh * kw;
    let rows = geom.output.0 * geom.output.1;
    let mut col = vec![0.0f32; rows * cols];
    col.par_chunks_mut(cols).enumerate().for_each(|(p, row)| {
        for (k, v) in row.iter_mut().enumerate() {
            if let Some(i) = tap(geom, p, k) {
                *v = image[i];
            }
        }
    });
    col
}

/// Adds a `(oh * ow) x (c * kh * kw)` column gradient back onto one image.
fn col2im(geom: &ConvGeometry, gcol: &[f32], image: &mut [f32]) {
    let [_, c, _, _] = geom.input;
    let [_, _, kh, kw] = geom.weight;
    let cols = c * kh * kw;
    for (p, row) in gcol.chunks(cols).enumerate() {
        for (k, g) in row.iter().enumerate() {
            if let Some(i) = tap(geom, p, k) {
                image[i] += *g;
            }
        }
    }
}

impl AcceleratedBackend for GemmBackend {
    fn convolution_forward(
        &self,
        geom: &ConvGeometry,
        x: &Tensor,
        w: &Tensor,
        b: Option<&Tensor>,
    ) -> Result<Tensor> {
        Self::reject_dilation(geom)?;
        let [n, c, h, wd] = geom.input;
        let [oc, _, kh, kw] = geom.weight;
        let cols = c * kh * kw;
        let plane = geom.output.0 * geom.output.1;
        let w_data = w.data();
        let b_data = b.map(Tensor::data);

        let mut out = vec![0.0f32; n * oc * plane];
        for (ni, out_image) in out.chunks_mut(oc * plane).enumerate() {
            let col = im2col(geom, &x.data()[ni * c * h * wd..][..c * h * wd]);
            out_image
                .par_chunks_mut(plane)
                .enumerate()
                .for_each(|(o, out_plane)| {
                    let w_row = &w_data[o * cols..][..cols];
                    let bias = b_data.map_or(0.0, |b| b[o]);
                    for (p, y) in out_plane.iter_mut().enumerate() {
                        let mut acc = 0.0f32;
                        for (xv, wv) in col[p * cols..][..cols].iter().zip(w_row) {
                            acc += xv * wv;
                        }
                        *y = acc + bias;
                    }
                });
        }

        Ok(Tensor::from_parts(geom.output_shape().to_vec(), out, x.device()))
    }

    fn convolution_backward_data(
        &self,
        variant: BackwardDataVariant,
        geom: &ConvGeometry,
        w: &Tensor,
        gy: &Tensor,
    ) -> Result<Tensor> {
        Self::reject_dilation(geom)?;
        let [n, c, h, wd] = geom.input;
        let [oc, _, kh, kw] = geom.weight;
        let cols = c * kh * kw;
        let plane = geom.output.0 * geom.output.1;
        let image = c * h * wd;
        let w_data = w.data();
        let gy_data = gy.data();

        let mut gx = vec![0.0f32; n * image];
        match variant {
            BackwardDataVariant::V2 => {
                gx.par_chunks_mut(image).enumerate().for_each(|(ni, gx_image)| {
                    let gy_image = &gy_data[ni * oc * plane..][..oc * plane];
                    // gcol = gy^T * w
                    let mut gcol = vec![0.0f32; plane * cols];
                    for (p, row) in gcol.chunks_mut(cols).enumerate() {
                        for o in 0..oc {
                            let g = gy_image[o * plane + p];
                            for (acc, wv) in row.iter_mut().zip(&w_data[o * cols..][..cols]) {
                                *acc += g * wv;
                            }
                        }
                    }
                    col2im(geom, &gcol, gx_image);
                });
            }
            BackwardDataVariant::V3 => {
                // inverse tap table: for every (p, k) pair that reads input i
                let mut readers: Vec<Vec<(usize, usize)>> = vec![Vec::new(); image];
                for p in 0..plane {
                    for k in 0..cols {
                        if let Some(i) = tap(geom, p, k) {
                            readers[i].push((p, k));
                        }
                    }
                }
                gx.par_chunks_mut(image).enumerate().for_each(|(ni, gx_image)| {
                    let gy_image = &gy_data[ni * oc * plane..][..oc * plane];
                    for (g, taps) in gx_image.iter_mut().zip(&readers) {
                        let mut acc = 0.0f32;
                        for &(p, k) in taps {
                            for o in 0..oc {
                                acc += gy_image[o * plane + p] * w_data[o * cols + k];
                            }
                        }
                        *g = acc;
                    }
                });
            }
        }

        Ok(Tensor::from_parts(geom.input.to_vec(), gx, gy.device()))
    }

    fn convolution_backward_filter(
        &self,
        geom: &ConvGeometry,
        x: &Tensor,
        gy: &Tensor,
    ) -> Result<Tensor> {
        Self::reject_dilation(geom)?;
        let [n, c, h, wd] = geom.input;
        let [oc, _, kh, kw] = geom.weight;
        let cols = c * kh * kw;
        let plane = geom.output.0 * geom.output.1;
        let gy_data = gy.data();

        let mut gw = vec![0.0f32; oc * cols];
        for ni in 0..n {
            let col = im2col(geom, &x.data()[ni * c * h * wd..][..c * h * wd]);
            let gy_image = &gy_data[ni * oc * plane..][..oc * plane];
            // gw += gy * col
            gw.par_chunks_mut(cols).enumerate().for_each(|(o, gw_row)| {
                for p in 0..plane {
                    let g = gy_image[o * plane + p];
                    for (acc, xv) in gw_row.iter_mut().zip(&col[p * cols..][..cols]) {
                        *acc += g * xv;
                    }
                }
            });
        }

        Ok(Tensor::from_parts(geom.weight.to_vec(), gw, gy.device()))
    }

    fn activation_forward(&self, kind: Activation, x: &Tensor) -> Result<Tensor> {
        let out = x.data().par_iter().map(|&v| kind.eval(v)).collect();
        Ok(Tensor::from_parts(x.shape().to_vec(), out, x.device()))
    }

    fn activation_backward(
        &self,
        kind: Activation,
        x: &Tensor,
        y: &Tensor,
        gy: &Tensor,
    ) -> Result<Tensor> {
        let grad = x
            .data()
            .par_iter()
            .zip(y.data().par_iter())
            .zip(gy.data().par_iter())
            .map(|((&xv, &yv), &dy)| kind.derivative(xv, yv) * dy)
            .collect();
        Ok(Tensor::from_parts(gy.shape().to_vec(), grad, gy.device()))
    }
}
