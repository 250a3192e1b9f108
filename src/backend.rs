//! Kernel backend selection.
//!
//! This module defines how the framework decides, per call, whether an
//! operation runs on the generic kernels in [`crate::ops::cpu`] or on an
//! installed [`AcceleratedBackend`].
//!
//! # Pieces
//!
//! - [`Policy`] — the user-facing switch (`always`, `never`, `auto`).
//! - [`OpSignature`] — what is about to run: operation, dtype, device and,
//!   for convolutions, the exact shape/stride/padding/dilation combination.
//! - [`Capabilities`] / [`CapabilityProbe`] — what an accelerated library can
//!   do, including which backward-data algorithm its version provides.
//! - [`should_use_accelerated`] — the decision itself.
//!
//! The policy is read from [`crate::config`] at every kernel call, so a scoped
//! override wrapping only part of a computation takes effect immediately.

use core::fmt;
use core::str::FromStr;

use crate::error::{Error, Result};
use crate::layers::Activation;
use crate::tensors::{DType, Device, Tensor};

/// Kernel-selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Policy {
    /// Always use the accelerated backend for accelerator tensors. A missing
    /// backend is a fatal environment error.
    Always = 0,
    /// Never use the accelerated backend.
    Never = 1,
    /// Use the accelerated backend when its capabilities cover the call (default).
    #[default]
    Auto = 2,
}

impl TryFrom<u8> for Policy {
    type Error = ();

    fn try_from(value: u8) -> core::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Always),
            1 => Ok(Self::Never),
            2 => Ok(Self::Auto),
            _ => Err(()),
        }
    }
}

impl FromStr for Policy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            "auto" => Ok(Self::Auto),
            other => Err(Error::invalid(format!(
                "unknown kernel policy {other:?} (expected always, never or auto)"
            ))),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Always => "always",
            Self::Never => "never",
            Self::Auto => "auto",
        })
    }
}

/// The operation part of an [`OpSignature`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// A 2-D convolution (forward and both backward passes share the signature).
    Convolution {
        /// Input shape `(n, c, h, w)`.
        input: [usize; 4],
        /// Weight shape `(out, in, kh, kw)`.
        weight: [usize; 4],
        /// Stride `(sy, sx)`.
        stride: (usize, usize),
        /// Zero padding `(ph, pw)`.
        pad: (usize, usize),
        /// Dilation `(dy, dx)`.
        dilation: (usize, usize),
    },
    /// An elementwise activation.
    Activation(Activation),
}

/// Everything a capability probe needs to accept or reject one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpSignature {
    /// What runs.
    pub op: OpKind,
    /// Element type of the operands.
    pub dtype: DType,
    /// Device of the operands.
    pub device: Device,
}

impl OpSignature {
    /// Signature of an activation applied to `x`.
    #[must_use]
    pub fn activation(kind: Activation, x: &Tensor) -> Self {
        Self {
            op: OpKind::Activation(kind),
            dtype: x.dtype(),
            device: x.device(),
        }
    }
}

/// Which accelerator ordinals a backend serves.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceSupport {
    /// Every accelerator.
    #[default]
    AllAccelerators,
    /// Only the listed ordinals.
    Only(Vec<u32>),
}

impl DeviceSupport {
    /// Whether `device` is served. Host memory never is.
    #[must_use]
    pub fn covers(&self, device: Device) -> bool {
        match (self, device) {
            (_, Device::Host) => false,
            (Self::AllAccelerators, Device::Accelerator(_)) => true,
            (Self::Only(ids), Device::Accelerator(id)) => ids.contains(&id),
        }
    }
}

/// What an accelerated library reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// Human-readable library name, used in logs and errors.
    pub name: String,
    /// Library version as a single integer (e.g. `7605` for 7.6.5).
    pub library_version: u32,
    /// First library version providing the v3 backward-data algorithm.
    pub backward_data_v3_min_version: u32,
    /// Accelerators the library can run on.
    pub devices: DeviceSupport,
    /// Whether dilated convolutions are supported.
    pub supports_dilation: bool,
    /// Activations with a vendor kernel.
    pub activations: Vec<Activation>,
}

impl Capabilities {
    /// Version threshold used when a library does not state one.
    pub const DEFAULT_BACKWARD_DATA_V3_MIN_VERSION: u32 = 3000;

    /// Capabilities for library `name` at `library_version`: every accelerator,
    /// no dilation, all activations.
    #[must_use]
    pub fn new(name: impl Into<String>, library_version: u32) -> Self {
        Self {
            name: name.into(),
            library_version,
            backward_data_v3_min_version: Self::DEFAULT_BACKWARD_DATA_V3_MIN_VERSION,
            devices: DeviceSupport::AllAccelerators,
            supports_dilation: false,
            activations: vec![Activation::Relu, Activation::Sigmoid, Activation::Tanh],
        }
    }

    /// Whether the library can execute the exact variant described by `sig`.
    #[must_use]
    pub fn supports(&self, sig: &OpSignature) -> bool {
        if sig.dtype != DType::F32 || !self.devices.covers(sig.device) {
            return false;
        }
        match sig.op {
            OpKind::Convolution { dilation, .. } => self.supports_dilation || dilation == (1, 1),
            OpKind::Activation(kind) => self.activations.contains(&kind),
        }
    }
}

/// Backward-data algorithm generation offered by an accelerated library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackwardDataVariant {
    /// Pre-v3 entry point.
    V2,
    /// v3 entry point.
    V3,
}

/// Picks the backward-data entry point from the negotiated capabilities.
#[must_use]
pub fn select_backward_data_variant(caps: &Capabilities) -> BackwardDataVariant {
    if caps.library_version >= caps.backward_data_v3_min_version {
        BackwardDataVariant::V3
    } else {
        BackwardDataVariant::V2
    }
}

/// The kernel entry point that serves (or would serve) a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryPoint {
    /// The generic kernels in [`crate::ops::cpu`].
    Generic,
    /// Vendor convolution forward.
    ConvolutionForward,
    /// Vendor backward-data, v2 algorithm.
    ConvolutionBackwardDataV2,
    /// Vendor backward-data, v3 algorithm.
    ConvolutionBackwardDataV3,
    /// Vendor backward-filter.
    ConvolutionBackwardFilter,
    /// Vendor activation forward.
    ActivationForward,
    /// Vendor activation backward.
    ActivationBackward,
}

impl From<BackwardDataVariant> for EntryPoint {
    fn from(variant: BackwardDataVariant) -> Self {
        match variant {
            BackwardDataVariant::V2 => Self::ConvolutionBackwardDataV2,
            BackwardDataVariant::V3 => Self::ConvolutionBackwardDataV3,
        }
    }
}

/// Answers whether an accelerated library can run a given call.
pub trait CapabilityProbe {
    /// The library's self-description.
    fn capabilities(&self) -> Capabilities;

    /// Whether the library supports `sig`. Defaults to [`Capabilities::supports`].
    fn supports(&self, sig: &OpSignature) -> bool {
        self.capabilities().supports(sig)
    }
}

/// Geometry of one convolution call, shared by all backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    /// Input shape `(n, c, h, w)`.
    pub input: [usize; 4],
    /// Weight shape `(out, in, kh, kw)`.
    pub weight: [usize; 4],
    /// Output spatial size `(oh, ow)`.
    pub output: (usize, usize),
    /// Stride `(sy, sx)`.
    pub stride: (usize, usize),
    /// Zero padding `(ph, pw)`.
    pub pad: (usize, usize),
    /// Dilation `(dy, dx)`.
    pub dilation: (usize, usize),
}

impl ConvGeometry {
    /// Validates a convolution call and computes its output size.
    ///
    /// Each output dimension is
    /// `floor((in + 2 * pad - dilation * (k - 1) - 1) / stride) + 1`.
    ///
    /// # Errors
    /// - [`Error::Shape`] if the channel counts disagree, a dimension is zero,
    ///   or the (dilated) kernel does not fit the padded input.
    /// - [`Error::InvalidArgument`] for a zero stride or dilation.
    pub fn new(
        input: [usize; 4],
        weight: [usize; 4],
        stride: (usize, usize),
        pad: (usize, usize),
        dilation: (usize, usize),
    ) -> Result<Self> {
        if stride.0 == 0 || stride.1 == 0 {
            return Err(Error::invalid(format!("stride must be positive, got {stride:?}")));
        }
        if dilation.0 == 0 || dilation.1 == 0 {
            return Err(Error::invalid(format!("dilation must be positive, got {dilation:?}")));
        }
        if input.contains(&0) || weight.contains(&0) {
            return Err(Error::shape(format!(
                "zero-sized convolution operand: input {input:?}, weight {weight:?}"
            )));
        }
        if input[1] != weight[1] {
            return Err(Error::shape(format!(
                "input has {} channels but the weight expects {}",
                input[1], weight[1]
            )));
        }

        let out_dim = |len: usize, k: usize, s: usize, p: usize, d: usize| {
            let span = d * (k - 1) + 1;
            (len + 2 * p).checked_sub(span).map(|room| room / s + 1)
        };
        let oh = out_dim(input[2], weight[2], stride.0, pad.0, dilation.0);
        let ow = out_dim(input[3], weight[3], stride.1, pad.1, dilation.1);
        let (Some(oh), Some(ow)) = (oh, ow) else {
            return Err(Error::shape(format!(
                "kernel {}x{} (dilation {dilation:?}) does not fit input {}x{} with padding {pad:?}",
                weight[2], weight[3], input[2], input[3]
            )));
        };

        Ok(Self {
            input,
            weight,
            output: (oh, ow),
            stride,
            pad,
            dilation,
        })
    }

    /// Output shape `(n, out, oh, ow)`.
    #[must_use]
    pub const fn output_shape(&self) -> [usize; 4] {
        [self.input[0], self.weight[0], self.output.0, self.output.1]
    }

    /// Operation signature of this geometry on `device`.
    #[must_use]
    pub const fn signature(&self, device: Device) -> OpSignature {
        OpSignature {
            op: OpKind::Convolution {
                input: self.input,
                weight: self.weight,
                stride: self.stride,
                pad: self.pad,
                dilation: self.dilation,
            },
            dtype: DType::F32,
            device,
        }
    }
}

/// A vendor kernel library that can stand in for the generic kernels.
///
/// Implementations receive tensors already checked for shape and device
/// agreement and must return outputs on the input's device.
pub trait AcceleratedBackend: CapabilityProbe + Send + Sync {
    /// `y = conv(x, w) + b`.
    ///
    /// # Errors
    /// [`Error::Environment`] if the library cannot execute the call.
    fn convolution_forward(
        &self,
        geom: &ConvGeometry,
        x: &Tensor,
        w: &Tensor,
        b: Option<&Tensor>,
    ) -> Result<Tensor>;

    /// `gx` from `gy` and `w` using the requested algorithm generation.
    ///
    /// # Errors
    /// [`Error::Environment`] if the library cannot execute the call.
    fn convolution_backward_data(
        &self,
        variant: BackwardDataVariant,
        geom: &ConvGeometry,
        w: &Tensor,
        gy: &Tensor,
    ) -> Result<Tensor>;

    /// `gw` from `x` and `gy`.
    ///
    /// # Errors
    /// [`Error::Environment`] if the library cannot execute the call.
    fn convolution_backward_filter(
        &self,
        geom: &ConvGeometry,
        x: &Tensor,
        gy: &Tensor,
    ) -> Result<Tensor>;

    /// Elementwise activation forward.
    ///
    /// # Errors
    /// [`Error::Environment`] if the library cannot execute the call.
    fn activation_forward(&self, kind: Activation, x: &Tensor) -> Result<Tensor>;

    /// Elementwise activation backward from input `x`, output `y` and `gy`.
    ///
    /// # Errors
    /// [`Error::Environment`] if the library cannot execute the call.
    fn activation_backward(
        &self,
        kind: Activation,
        x: &Tensor,
        y: &Tensor,
        gy: &Tensor,
    ) -> Result<Tensor>;
}

/// Decides whether a call described by `sig` should use the accelerated library.
///
/// - [`Policy::Always`] → `true`; the caller guarantees a library is present.
/// - [`Policy::Never`] → `false`.
/// - [`Policy::Auto`] → `true` iff a probe is present and supports `sig`.
#[must_use]
pub fn should_use_accelerated(
    policy: Policy,
    probe: Option<&dyn CapabilityProbe>,
    sig: &OpSignature,
) -> bool {
    match policy {
        Policy::Always => true,
        Policy::Never => false,
        Policy::Auto => probe.is_some_and(|p| p.supports(sig)),
    }
}
