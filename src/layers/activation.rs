//! Stateless elementwise activation functions.

use crate::error::Result;
use crate::ops::dispatch::{self, ActivationBackward};
use crate::tensors::Tensor;

/// An activation applied between the convolutions of an
/// [`MlpConvolution2D`](super::MlpConvolution2D).
///
/// Activations carry no parameters and are cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Activation {
    /// `max(0, x)` (default).
    #[default]
    Relu,
    /// `1 / (1 + e^(-x))`.
    Sigmoid,
    /// Hyperbolic tangent.
    Tanh,
}

impl Activation {
    /// Evaluates the activation at one point.
    #[inline]
    #[must_use]
    pub fn eval(self, x: f32) -> f32 {
        match self {
            Self::Relu => x.max(0.0),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Tanh => x.tanh(),
        }
    }

    /// Local derivative given the forward input `x` and output `y`.
    #[inline]
    #[must_use]
    pub fn derivative(self, x: f32, y: f32) -> f32 {
        match self {
            Self::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Sigmoid => y * (1.0 - y),
            Self::Tanh => 1.0 - y * y,
        }
    }

    /// Applies the activation element-wise, on the kernel the current
    /// configuration selects.
    ///
    /// # Errors
    /// [`Error::Environment`](crate::Error::Environment) if the policy demands
    /// an accelerated kernel that is unavailable.
    ///
    /// # Example
    /// ```rust
    /// use mlpconv::{tensor, Activation};
    ///
    /// let y = Activation::Relu.apply(&tensor!([-2.0, 3.0])).unwrap();
    /// assert_eq!(y.data(), &[0.0, 3.0]);
    /// ```
    pub fn apply(self, x: &Tensor) -> Result<Tensor> {
        dispatch::activation_forward(self, x)
    }

    /// Like [`Activation::apply`], also returning the backward closure.
    ///
    /// # Errors
    /// See [`Activation::apply`].
    pub fn apply_traced(self, x: &Tensor) -> Result<(Tensor, Box<ActivationBackward>)> {
        dispatch::activation(self, x)
    }
}
