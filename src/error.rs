//! Crate-wide error type.
//!
//! Every fallible operation in the crate returns [`Result`], and errors are
//! propagated synchronously to the immediate caller. Nothing in this crate
//! retries.

use crate::tensors::Device;

/// Errors raised by layers, kernels and the configuration context.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A tensor had the wrong rank, a frozen channel count did not match,
    /// or a shape produced an empty convolution output.
    #[error("shape error: {0}")]
    Shape(String),

    /// Indexed access into a layer sequence outside `[0, len)`.
    #[error("index {index} out of range for a sequence of {len} layers")]
    Index {
        /// The requested position.
        index: usize,
        /// Number of layers in the sequence.
        len: usize,
    },

    /// Two operands of one operation live on different devices.
    #[error("device mismatch: expected {expected}, found {found}")]
    DeviceMismatch {
        /// Device of the parameters (or the first operand).
        expected: Device,
        /// Device of the offending operand.
        found: Device,
    },

    /// The selected policy demands an accelerated kernel that is not
    /// available. Not recoverable in-process.
    #[error("environment error: {0}")]
    Environment(String),

    /// A constructor or parser was handed an unusable value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The `wgpu` backend failed to talk to the GPU.
    #[cfg(feature = "wgpu")]
    #[error(transparent)]
    Gpu(#[from] crate::ops::wgpu::GpuError),
}

/// Shorthand for results carrying [`Error`].
pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn environment(msg: impl Into<String>) -> Self {
        Self::Environment(msg.into())
    }
}
