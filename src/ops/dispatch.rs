//! Operation Dispatch Layer
//!
//! This module selects the kernel for each differentiable operation at the
//! moment it runs, based on the configuration returned by
//! [`config::current`].
//!
//! Selection rules, in order:
//! 1. Host tensors always run the generic kernels in [`cpu`]
//! 2. [`Policy::Never`] runs the generic kernels
//! 3. [`Policy::Always`] runs the installed accelerated backend, and fails
//!    with [`Error::Environment`] when none is installed
//! 4. [`Policy::Auto`] runs the installed backend when its capabilities cover
//!    the exact call, and the generic kernels otherwise
//!
//! Backward closures capture their inputs by value and select their kernels
//! again when invoked, so a policy scope entered between forward and backward
//! applies to the backward pass.
//!
//! # Example
//! ```rust
//! use mlpconv::ops::dispatch::{conv2d, Conv2dParams};
//! use mlpconv::tensors::Tensor;
//!
//! let x = Tensor::new(vec![1, 1, 3, 3], vec![1.0; 9]);
//! let w = Tensor::new(vec![1, 1, 2, 2], vec![1.0; 4]);
//! let (y, back) = conv2d(&x, &w, None, Conv2dParams::default()).unwrap();
//! assert_eq!(y.data(), &[4.0; 4]);
//!
//! let grads = back(&Tensor::new(vec![1, 1, 2, 2], vec![1.0; 4])).unwrap();
//! assert_eq!(grads.weight.data(), &[4.0; 4]);
//! ```

use std::sync::Arc;

use super::cpu;
use crate::backend::{
    select_backward_data_variant, should_use_accelerated, AcceleratedBackend, CapabilityProbe,
    ConvGeometry, EntryPoint, OpSignature, Policy,
};
use crate::config::{self, Config};
use crate::error::{Error, Result};
use crate::layers::Activation;
use crate::tensors::Tensor;

/// Backward closure of [`conv2d`].
pub type Conv2dBackward = dyn Fn(&Tensor) -> Result<Conv2dGrads>;

/// Backward closure of [`activation`].
pub type ActivationBackward = dyn Fn(&Tensor) -> Result<Tensor>;

/// Gradients produced by a convolution backward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Conv2dGrads {
    /// `dL/dx`.
    pub input: Tensor,
    /// `dL/dw`.
    pub weight: Tensor,
    /// `dL/db`, present iff the forward pass had a bias.
    pub bias: Option<Tensor>,
}

/// Stride, padding and dilation of a convolution call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Conv2dParams {
    /// Stride `(sy, sx)`.
    pub stride: (usize, usize),
    /// Zero padding `(ph, pw)`.
    pub pad: (usize, usize),
    /// Dilation `(dy, dx)`.
    pub dilation: (usize, usize),
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Self {
            stride: (1, 1),
            pad: (0, 0),
            dilation: (1, 1),
        }
    }
}

/// The kernel chosen for one call.
#[derive(Clone)]
pub enum Kernel {
    /// The generic kernels in [`cpu`].
    Generic,
    /// An accelerated library.
    Accelerated(Arc<dyn AcceleratedBackend>),
}

impl core::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Generic => f.write_str("Generic"),
            Self::Accelerated(b) => f.debug_tuple("Accelerated").field(&b.capabilities().name).finish(),
        }
    }
}

/// Picks the kernel for `sig` under `config`.
///
/// # Errors
/// [`Error::Environment`] if the policy is [`Policy::Always`] and no backend is
/// installed.
pub fn select(sig: &OpSignature, config: &Config) -> Result<Kernel> {
    if !sig.device.is_accelerator() {
        return Ok(Kernel::Generic);
    }

    let probe = config.backend.as_deref().map(|b| b as &dyn CapabilityProbe);
    if !should_use_accelerated(config.kernel_policy, probe, sig) {
        return Ok(Kernel::Generic);
    }

    match &config.backend {
        Some(backend) => Ok(Kernel::Accelerated(Arc::clone(backend))),
        None => Err(Error::environment(format!(
            "kernel policy `{}` requires an accelerated backend for {:?} on {}, but none is installed",
            Policy::Always,
            sig.op,
            sig.device
        ))),
    }
}

/// Entry points a convolution with signature `sig` would use right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvolutionPlan {
    /// Forward pass.
    pub forward: EntryPoint,
    /// Gradient with respect to the input.
    pub backward_data: EntryPoint,
    /// Gradient with respect to the weight.
    pub backward_filter: EntryPoint,
}

/// Reports which entry points a convolution would run under the current
/// configuration, without running it.
///
/// # Errors
/// See [`select`].
pub fn plan_convolution(sig: &OpSignature) -> Result<ConvolutionPlan> {
    Ok(match select(sig, &config::current())? {
        Kernel::Generic => ConvolutionPlan {
            forward: EntryPoint::Generic,
            backward_data: EntryPoint::Generic,
            backward_filter: EntryPoint::Generic,
        },
        Kernel::Accelerated(backend) => ConvolutionPlan {
            forward: EntryPoint::ConvolutionForward,
            backward_data: select_backward_data_variant(&backend.capabilities()).into(),
            backward_filter: EntryPoint::ConvolutionBackwardFilter,
        },
    })
}

/// Forward and backward entry points an activation would run right now.
///
/// # Errors
/// See [`select`].
pub fn plan_activation(sig: &OpSignature) -> Result<(EntryPoint, EntryPoint)> {
    Ok(match select(sig, &config::current())? {
        Kernel::Generic => (EntryPoint::Generic, EntryPoint::Generic),
        Kernel::Accelerated(_) => (EntryPoint::ActivationForward, EntryPoint::ActivationBackward),
    })
}

fn check_conv(x: &Tensor, w: &Tensor, b: Option<&Tensor>, params: Conv2dParams) -> Result<ConvGeometry> {
    let input = x.dims4()?;
    let weight = w.dims4()?;
    w.expect_same_device(x)?;
    if let Some(b) = b {
        w.expect_same_device(b)?;
        if b.shape() != [weight[0]] {
            return Err(Error::shape(format!(
                "bias shape {:?} does not match {} output channels",
                b.shape(),
                weight[0]
            )));
        }
    }
    ConvGeometry::new(input, weight, params.stride, params.pad, params.dilation)
}

fn check_grad(expected: &Tensor, gy: &Tensor, shape: &[usize]) -> Result<()> {
    expected.expect_same_device(gy)?;
    if gy.shape() != shape {
        return Err(Error::shape(format!(
            "output gradient has shape {:?}, expected {shape:?}",
            gy.shape()
        )));
    }
    Ok(())
}

fn run_conv_forward(geom: &ConvGeometry, x: &Tensor, w: &Tensor, b: Option<&Tensor>) -> Result<Tensor> {
    let sig = geom.signature(x.device());
    match select(&sig, &config::current())? {
        Kernel::Generic => {
            log::trace!("conv2d forward {:?} on {}: generic", geom.input, x.device());
            Ok(cpu::conv2d_forward(geom, x, w, b))
        }
        Kernel::Accelerated(backend) => {
            log::trace!(
                "conv2d forward {:?} on {}: {}",
                geom.input,
                x.device(),
                backend.capabilities().name
            );
            backend.convolution_forward(geom, x, w, b)
        }
    }
}

/// Convolution forward pass without a backward closure.
///
/// # Errors
/// - [`Error::Shape`] for non-4-D operands or an impossible geometry.
/// - [`Error::DeviceMismatch`] if `x` or `b` is not on `w`'s device.
/// - [`Error::Environment`] from kernel selection or the backend.
pub fn conv2d_forward(x: &Tensor, w: &Tensor, b: Option<&Tensor>, params: Conv2dParams) -> Result<Tensor> {
    let geom = check_conv(x, w, b, params)?;
    run_conv_forward(&geom, x, w, b)
}

/// Differentiable 2-D convolution.
///
/// # Returns
/// - `y`: Output tensor `(n, out, oh, ow)`
/// - `back`: Closure mapping `dL/dy` to [`Conv2dGrads`]
///
/// # Errors
/// See [`conv2d_forward`]. The closure fails with [`Error::Shape`] or
/// [`Error::DeviceMismatch`] for a gradient that does not match `y`.
pub fn conv2d(
    x: &Tensor,
    w: &Tensor,
    b: Option<&Tensor>,
    params: Conv2dParams,
) -> Result<(Tensor, Box<Conv2dBackward>)> {
    let geom = check_conv(x, w, b, params)?;
    let y = run_conv_forward(&geom, x, w, b)?;

    let x = x.clone();
    let w = w.clone();
    let has_bias = b.is_some();

    let back = move |gy: &Tensor| -> Result<Conv2dGrads> {
        check_grad(&x, gy, &geom.output_shape())?;
        let sig = geom.signature(x.device());
        let (input, weight) = match select(&sig, &config::current())? {
            Kernel::Generic => {
                log::trace!("conv2d backward {:?} on {}: generic", geom.input, x.device());
                (
                    cpu::conv2d_backward_data(&geom, &w, gy),
                    cpu::conv2d_backward_filter(&geom, &x, gy),
                )
            }
            Kernel::Accelerated(backend) => {
                let caps = backend.capabilities();
                let variant = select_backward_data_variant(&caps);
                log::trace!(
                    "conv2d backward {:?} on {}: {} (backward data {variant:?})",
                    geom.input,
                    x.device(),
                    caps.name
                );
                (
                    backend.convolution_backward_data(variant, &geom, &w, gy)?,
                    backend.convolution_backward_filter(&geom, &x, gy)?,
                )
            }
        };
        let bias = has_bias.then(|| cpu::conv2d_backward_bias(&geom, gy));
        Ok(Conv2dGrads { input, weight, bias })
    };

    Ok((y, Box::new(back)))
}

/// Activation forward pass without a backward closure.
///
/// # Errors
/// [`Error::Environment`] from kernel selection or the backend.
pub fn activation_forward(kind: Activation, x: &Tensor) -> Result<Tensor> {
    let sig = OpSignature::activation(kind, x);
    match select(&sig, &config::current())? {
        Kernel::Generic => {
            log::trace!("{kind:?} forward on {}: generic", x.device());
            Ok(cpu::activation_forward(kind, x))
        }
        Kernel::Accelerated(backend) => {
            log::trace!("{kind:?} forward on {}: {}", x.device(), backend.capabilities().name);
            backend.activation_forward(kind, x)
        }
    }
}

/// Differentiable elementwise activation.
///
/// # Returns
/// - `y`: Activated tensor
/// - `back`: Closure mapping `dL/dy` to `dL/dx`
///
/// # Errors
/// See [`activation_forward`].
pub fn activation(kind: Activation, x: &Tensor) -> Result<(Tensor, Box<ActivationBackward>)> {
    let y = activation_forward(kind, x)?;
    let x = x.clone();
    let y_saved = y.clone();

    let back = move |gy: &Tensor| -> Result<Tensor> {
        check_grad(&x, gy, x.shape())?;
        let sig = OpSignature::activation(kind, &x);
        match select(&sig, &config::current())? {
            Kernel::Generic => Ok(cpu::activation_backward(kind, &x, &y_saved, gy)),
            Kernel::Accelerated(backend) => backend.activation_backward(kind, &x, &y_saved, gy),
        }
    };

    Ok((y, Box::new(back)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Capabilities;
    use crate::tensors::Device;

    struct Unusable;

    impl CapabilityProbe for Unusable {
        fn capabilities(&self) -> Capabilities {
            let mut caps = Capabilities::new("unusable", 1);
            caps.activations.clear();
            caps
        }
    }

    impl AcceleratedBackend for Unusable {
        fn convolution_forward(&self, _: &ConvGeometry, _: &Tensor, _: &Tensor, _: Option<&Tensor>) -> Result<Tensor> {
            Err(Error::environment("unusable"))
        }
        fn convolution_backward_data(
            &self,
            _: crate::backend::BackwardDataVariant,
            _: &ConvGeometry,
            _: &Tensor,
            _: &Tensor,
        ) -> Result<Tensor> {
            Err(Error::environment("unusable"))
        }
        fn convolution_backward_filter(&self, _: &ConvGeometry, _: &Tensor, _: &Tensor) -> Result<Tensor> {
            Err(Error::environment("unusable"))
        }
        fn activation_forward(&self, _: Activation, _: &Tensor) -> Result<Tensor> {
            Err(Error::environment("unusable"))
        }
        fn activation_backward(&self, _: Activation, _: &Tensor, _: &Tensor, _: &Tensor) -> Result<Tensor> {
            Err(Error::environment("unusable"))
        }
    }

    fn config(policy: Policy, backend: bool) -> Config {
        Config {
            kernel_policy: policy,
            backend: backend.then(|| Arc::new(Unusable) as Arc<dyn AcceleratedBackend>),
        }
    }

    #[test]
    fn host_tensors_never_reach_the_backend() {
        let sig = OpSignature::activation(Activation::Relu, &Tensor::zeros(vec![2]));
        assert!(matches!(select(&sig, &config(Policy::Always, true)), Ok(Kernel::Generic)));
        assert!(matches!(select(&sig, &config(Policy::Always, false)), Ok(Kernel::Generic)));
    }

    #[test]
    fn always_without_backend_is_an_environment_error() {
        let x = Tensor::zeros_on(vec![2], Device::Accelerator(0));
        let sig = OpSignature::activation(Activation::Relu, &x);
        assert!(matches!(select(&sig, &config(Policy::Always, false)), Err(Error::Environment(_))));
    }

    #[test]
    fn auto_respects_the_probe() {
        let x = Tensor::zeros_on(vec![2], Device::Accelerator(0));
        let sig = OpSignature::activation(Activation::Tanh, &x);
        assert!(matches!(select(&sig, &config(Policy::Auto, true)), Ok(Kernel::Generic)));
        assert!(matches!(select(&sig, &config(Policy::Always, true)), Ok(Kernel::Accelerated(_))));
        assert!(matches!(select(&sig, &config(Policy::Never, true)), Ok(Kernel::Generic)));
    }

    #[test]
    fn gradient_shape_is_checked() {
        let x = Tensor::new(vec![1, 1, 3, 3], vec![1.0; 9]);
        let w = Tensor::new(vec![1, 1, 2, 2], vec![1.0; 4]);
        let (_, back) = conv2d(&x, &w, None, Conv2dParams::default()).unwrap();
        assert!(matches!(back(&Tensor::zeros(vec![1, 1, 3, 3])), Err(Error::Shape(_))));
        let on_accel = Tensor::zeros_on(vec![1, 1, 2, 2], Device::Accelerator(0));
        assert!(matches!(back(&on_accel), Err(Error::DeviceMismatch { .. })));
    }

    #[test]
    fn mixed_devices_are_rejected() {
        let x = Tensor::zeros_on(vec![1, 1, 3, 3], Device::Accelerator(0));
        let w = Tensor::zeros(vec![1, 1, 2, 2]);
        let err = conv2d_forward(&x, &w, None, Conv2dParams::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::DeviceMismatch {
                expected: Device::Host,
                found: Device::Accelerator(0)
            }
        ));
    }
}
