//! Learnable layers.
//!
//! - [`Convolution2D`] — one 2-D convolution with lazily inferred input channels
//! - [`MlpConvolution2D`] — a spatial convolution followed by 1x1 convolutions
//!   with an [`Activation`] in between
//!
//! Both implement [`Layer`], the parameter-management surface shared by all
//! layers.

mod activation;
mod conv;
mod mlp_conv;

pub use activation::Activation;
pub use conv::{Conv2dOptions, Convolution2D};
pub use mlp_conv::{ChainBackward, LayerMut, MlpConvolution2D, MlpConvolution2DBuilder};

pub use crate::ops::dispatch::{ActivationBackward, Conv2dBackward, Conv2dGrads};

use crate::tensors::{Device, Tensor, WithGrad};

/// An abstraction over the parameters every layer owns.
pub trait Layer {
    /// Immutably obtains references to the allocated parameters.
    ///
    /// Parameters that have not been allocated yet are skipped.
    #[must_use]
    fn params(&self) -> Vec<&WithGrad<Tensor>>;

    /// Mutably obtains references to the allocated parameters.
    #[must_use]
    fn params_mut(&mut self) -> Vec<&mut WithGrad<Tensor>>;

    /// Zeroes the gradients of the parameters.
    #[inline]
    fn zero_grad(&mut self) {
        for p in self.params_mut() {
            p.zero_grad();
        }
    }

    /// Number of scalar parameters currently allocated.
    #[inline]
    fn count_params(&self) -> usize {
        self.params().iter().map(|p| p.value.len()).sum()
    }

    /// Moves every parameter, and every parameter allocated later, to `device`.
    fn to_device(&mut self, device: Device);

    /// Device the parameters live on.
    fn device(&self) -> Device;
}
