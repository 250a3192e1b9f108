//! Differentiable operations.
//!
//! # Autograd Pattern
//!
//! Each operation follows a simple pattern:
//! 1. **Inputs** are references to plain [`Tensor`]s.
//! 2. **Forward Pass** computes an output tensor on the inputs' device.
//! 3. **Backward Pass** is a boxed closure capturing cloned inputs; given
//!    `dL/d(out)` it returns the gradients of every input.
//! 4. **Gradient Application** is left to the caller, typically a layer adding
//!    the results into its [`WithGrad`](crate::tensors::WithGrad) parameters.
//!
//! ## Usage Guidelines
//!
//! - Operations return [`Error::Shape`](crate::Error::Shape) on mismatched
//!   shapes and [`Error::DeviceMismatch`](crate::Error::DeviceMismatch) on
//!   mixed devices instead of panicking.
//! - The backward closures implement `Fn`, allowing multiple invocations.
//! - Which kernel runs is decided per call by [`crate::ops::dispatch`].

use crate::error::Result;
use crate::layers::Activation;
use crate::ops::dispatch::{self, ActivationBackward, Conv2dBackward};
use crate::tensors::Tensor;

pub use crate::ops::dispatch::{Conv2dGrads, Conv2dParams};

/// 2-D convolution `y = conv(x, w) + b`.
///
/// # Returns
/// - `out`: Tensor `(n, out, oh, ow)`.
/// - `back`: Closure that given `dL/d(out)` returns [`Conv2dGrads`].
///
/// # Errors
/// See [`dispatch::conv2d`].
///
/// # Example
/// ```rust
/// use mlpconv::backprop::{conv2d, Conv2dParams};
/// use mlpconv::tensors::Tensor;
///
/// let x = Tensor::new(vec![1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]);
/// let w = Tensor::new(vec![1, 1, 1, 1], vec![2.0]);
/// let b = Tensor::new(vec![1], vec![1.0]);
/// let (y, back) = conv2d(&x, &w, Some(&b), Conv2dParams::default()).unwrap();
/// assert_eq!(y.data(), &[3.0, 5.0, 7.0, 9.0]);
///
/// let grads = back(&Tensor::new(vec![1, 1, 2, 2], vec![1.0; 4])).unwrap();
/// assert_eq!(grads.weight.data(), &[10.0]);
/// assert_eq!(grads.bias.unwrap().data(), &[4.0]);
/// ```
pub fn conv2d(
    x: &Tensor,
    w: &Tensor,
    b: Option<&Tensor>,
    params: Conv2dParams,
) -> Result<(Tensor, Box<Conv2dBackward>)> {
    dispatch::conv2d(x, w, b, params)
}

/// Applies `kind` elementwise.
///
/// # Returns
/// - `out`: Activated tensor.
/// - `back`: Closure mapping `dL/d(out)` to `dL/d(input)`.
///
/// # Errors
/// See [`dispatch::activation`].
///
/// # Example
/// ```rust
/// use mlpconv::{backprop::activation, tensor, Activation};
///
/// let (out, back) = activation(Activation::Relu, &tensor!([[3.0, -3.0], [9.0, 0.0]])).unwrap();
/// assert_eq!(out.data(), &[3.0, 0.0, 9.0, 0.0]);
/// let grad_in = back(&tensor!([[2.0, 4.0], [6.0, 3.0]])).unwrap();
/// assert_eq!(grad_in.data(), &[2.0, 0.0, 6.0, 0.0]);
/// ```
pub fn activation(kind: Activation, x: &Tensor) -> Result<(Tensor, Box<ActivationBackward>)> {
    dispatch::activation(kind, x)
}
