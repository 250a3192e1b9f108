//! Core tensor data structures.
//!
//! # Tensors and Parameters
//!
//! A [`Tensor`] is an N-dimensional `f32` buffer in row-major order, tagged
//! with the [`Device`] it lives on. A [`WithGrad`] pairs a value with its
//! gradient slot and is what layers own as learnable parameters.
//!
//! ## Design Highlights
//! - Shape and dtype are fixed at construction; fields are private so the
//!   only way to change data is through explicit operations.
//! - Accelerator memory is modelled in-process: moving a tensor to
//!   [`Device::Accelerator`] copies the buffer and re-tags it. Which kernel
//!   runs on it is decided by [`crate::ops::dispatch`].
//! - Operations on two tensors refuse to mix devices; there is no implicit
//!   transfer.
//!
//! ## Example
//!
//! ```rust
//! use mlpconv::tensors::{Device, Tensor};
//!
//! let t = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! assert_eq!(t.shape(), &[2, 3]);
//!
//! let on_gpu = t.to_accelerator(0);
//! assert_eq!(on_gpu.device(), Device::Accelerator(0));
//! assert_eq!(on_gpu.to_host(), t);
//! ```

use core::fmt;

use crate::error::{Error, Result};

/// Element type of a tensor. Only single precision is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum DType {
    /// 32-bit IEEE float.
    #[default]
    F32,
}

/// Where a tensor's buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    /// Host memory (default).
    #[default]
    Host,
    /// Accelerator memory, identified by device ordinal.
    Accelerator(u32),
}

impl Device {
    /// Whether this is an accelerator device.
    #[must_use]
    pub const fn is_accelerator(self) -> bool {
        matches!(self, Self::Accelerator(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Accelerator(id) => write!(f, "accelerator:{id}"),
        }
    }
}

/// Represents an N-dimensional tensor with a shape, flat row-major data and a device.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
    device: Device,
}

impl Tensor {
    /// Creates a new host tensor with the given shape and flat data.
    ///
    /// # Panics
    /// Panics if the number of elements in `data` does not match the shape product.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<f32>) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape {:?} is incompatible with {} data elements",
            shape,
            data.len()
        );
        Self {
            shape,
            data,
            device: Device::Host,
        }
    }

    /// Fallible version of [`Tensor::new`] placing the tensor on `device`.
    ///
    /// # Errors
    /// [`Error::Shape`] if `data.len()` does not equal the shape product.
    pub fn try_new(shape: impl Into<Vec<usize>>, data: Vec<f32>, device: Device) -> Result<Self> {
        let shape = shape.into();
        let expected = shape.iter().product::<usize>();
        if expected != data.len() {
            return Err(Error::shape(format!(
                "shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self {
            shape,
            data,
            device,
        })
    }

    /// A zero-filled host tensor.
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        Self::zeros_on(shape, Device::Host)
    }

    /// A zero-filled tensor on `device`.
    pub fn zeros_on(shape: impl Into<Vec<usize>>, device: Device) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
            device,
        }
    }

    /// A tensor on `device` with every element set to `value`.
    pub fn full_on(shape: impl Into<Vec<usize>>, value: f32, device: Device) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![value; len],
            device,
        }
    }

    /// Builds a tensor on `device` from already-validated parts.
    pub(crate) fn from_parts(shape: Vec<usize>, data: Vec<f32>, device: Device) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self {
            shape,
            data,
            device,
        }
    }

    /// The dimensions of the tensor.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Flat row-major view of the elements.
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Consumes the tensor and returns its flat buffer.
    #[must_use]
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Device the buffer lives on.
    #[must_use]
    pub const fn device(&self) -> Device {
        self.device
    }

    /// Element type, always [`DType::F32`].
    #[must_use]
    pub const fn dtype(&self) -> DType {
        DType::F32
    }

    /// Number of dimensions.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the tensor holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Interprets the tensor as `(batch, channels, height, width)`.
    ///
    /// # Errors
    /// [`Error::Shape`] if the rank is not 4.
    pub fn dims4(&self) -> Result<[usize; 4]> {
        <[usize; 4]>::try_from(self.shape.as_slice()).map_err(|_| {
            Error::shape(format!(
                "expected a 4-dimensional (batch, channels, height, width) tensor, got shape {:?}",
                self.shape
            ))
        })
    }

    /// Copies the tensor to `device`.
    #[must_use]
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.clone(),
            device,
        }
    }

    /// Moves the tensor to `device` without copying the buffer.
    #[must_use]
    pub fn into_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Copies the tensor to accelerator `id`.
    #[must_use]
    pub fn to_accelerator(&self, id: u32) -> Self {
        self.to_device(Device::Accelerator(id))
    }

    /// Copies the tensor back to host memory.
    #[must_use]
    pub fn to_host(&self) -> Self {
        self.to_device(Device::Host)
    }

    /// Fails unless `other` lives on the same device as `self`.
    ///
    /// # Errors
    /// [`Error::DeviceMismatch`] naming `self`'s device as expected.
    pub fn expect_same_device(&self, other: &Self) -> Result<()> {
        if self.device == other.device {
            Ok(())
        } else {
            Err(Error::DeviceMismatch {
                expected: self.device,
                found: other.device,
            })
        }
    }

    /// Adds `other` into `self` element-wise.
    ///
    /// # Errors
    /// - [`Error::DeviceMismatch`] if the tensors live on different devices.
    /// - [`Error::Shape`] if the shapes differ.
    pub fn accumulate(&mut self, other: &Self) -> Result<()> {
        self.expect_same_device(other)?;
        if self.shape != other.shape {
            return Err(Error::shape(format!(
                "cannot accumulate shape {:?} into {:?}",
                other.shape, self.shape
            )));
        }
        for (acc, g) in self.data.iter_mut().zip(&other.data) {
            *acc += *g;
        }
        Ok(())
    }

    /// Sets every element to zero.
    pub fn fill_zero(&mut self) {
        self.data.fill(0.0);
    }
}

/// A container for tracking gradients of values (used in autograd).
///
/// Layers own their learnable parameters as `WithGrad<Tensor>`; the gradient
/// slot always matches the value's shape and device.
#[derive(Debug, Clone, PartialEq)]
pub struct WithGrad<T> {
    /// The current value.
    pub value: T,
    /// The gradient accumulated since the last reset.
    pub grad: T,
}

impl WithGrad<Tensor> {
    /// Wraps `value` with a zeroed gradient of the same shape and device.
    #[must_use]
    pub fn new(value: Tensor) -> Self {
        let grad = Tensor::zeros_on(value.shape.clone(), value.device);
        Self { value, grad }
    }

    /// Shape of the parameter.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    /// Device of the parameter.
    #[must_use]
    pub const fn device(&self) -> Device {
        self.value.device()
    }

    /// Adds `grad` into the gradient slot.
    ///
    /// # Errors
    /// See [`Tensor::accumulate`].
    pub fn accumulate_grad(&mut self, grad: &Tensor) -> Result<()> {
        self.grad.accumulate(grad)
    }

    /// Resets the gradient slot to zero.
    pub fn zero_grad(&mut self) {
        self.grad.fill_zero();
    }

    /// Moves value and gradient to `device`.
    pub fn move_to(&mut self, device: Device) {
        self.value.device = device;
        self.grad.device = device;
    }
}

/// Defines a host tensor from nested literal arrays.
///
/// Supports arbitrary dimensionality as long as sublists are uniform in shape.
///
/// # Panics
/// Panics on ragged literals.
///
/// # Example
/// ```
/// use mlpconv::tensor;
/// let t = tensor!([[1.0, -2.0], [3.0, 4.0]]);
/// assert_eq!(t.shape(), &[2, 2]);
/// assert_eq!(t.data(), &[1.0, -2.0, 3.0, 4.0]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($lit:literal) => {
        $crate::tensors::Tensor::new(Vec::<usize>::new(), vec![$lit as f32])
    };

    ([ $( $lit:literal ),+ $(,)? ]) => {{
        let data = vec![$( $lit as f32 ),+];
        $crate::tensors::Tensor::new(vec![data.len()], data)
    }};

    ([ $( $inner:tt ),+ $(,)? ]) => {{
        let children = vec![ $( $crate::tensor!($inner) ),+ ];
        let first_shape = children[0].shape().to_vec();
        assert!(children.iter().all(|c| c.shape() == first_shape.as_slice()),
            "ragged tensor literal (rows have mismatched shapes)");
        let mut shape = vec![children.len()];
        shape.extend_from_slice(&first_shape);
        let mut data = Vec::with_capacity(children.len() * children[0].len());
        for c in children { data.extend(c.into_data()); }
        $crate::tensors::Tensor::new(shape, data)
    }};
}
