//! # `mlpconv`
//!
//! MLP-over-convolution layer chains ("Network in Network" blocks) with
//! manual backpropagation closures, lazily shaped parameters, host and
//! accelerator placement, and a per-call choice between generic and
//! accelerated kernels.
//!
//! ## Features
//!
//! - **Tensors**: `f32` N-dimensional arrays tagged with the device they live on
//! - **Autograd**: Functional-style forward passes returning backward closures
//! - **Layers**: [`Convolution2D`] with deferred input-channel inference and
//!   [`MlpConvolution2D`] chaining one spatial and several 1x1 convolutions
//! - **Kernel selection**: a [`Policy`] (`always`, `never`, `auto`) read from a
//!   scoped [`config`] at every call, plus capability negotiation with an
//!   installed [`AcceleratedBackend`](backend::AcceleratedBackend)
//! - **GPU Acceleration**: Optional `wgpu`-powered compute shaders
//!
//! ## Modules
//!
//! - [`tensors`] — Tensor, device and parameter types
//! - [`backprop`] — Differentiable operations
//! - [`layers`] — Convolution layers and activations
//! - [`backend`] — Policies, signatures, capabilities and the backend trait
//! - [`config`] — Process-wide defaults and scoped overrides
//! - [`ops`] — Kernels and per-call dispatch
//! - [`random`] — Seeding and parameter initializers
//!
//! ## Example
//!
//! ```rust
//! use mlpconv::{Activation, MlpConvolution2D, Tensor};
//!
//! let mut block = MlpConvolution2D::builder(&[16, 16, 8], (3, 3))
//!     .activation(Activation::Tanh)
//!     .seed(0)
//!     .build()?;
//!
//! let x = Tensor::zeros(vec![1, 3, 10, 10]);
//! let (y, trace) = block.forward_traced(&x)?;
//! assert_eq!(y.shape(), &[1, 8, 8, 8]);
//!
//! let gx = block.backward(&Tensor::zeros(y.shape().to_vec()), &trace)?;
//! assert_eq!(gx.shape(), x.shape());
//! # Ok::<(), mlpconv::Error>(())
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::type_complexity,
    clippy::many_single_char_names,
    clippy::cast_possible_truncation,
    clippy::similar_names,
    clippy::cast_precision_loss,
    clippy::unused_async,
    clippy::unnecessary_cast
)]
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod backprop;
pub mod config;
pub mod error;
pub mod layers;
pub mod ops;
pub mod random;
pub mod tensors;

pub use backend::Policy;
pub use error::{Error, Result};
pub use layers::{Activation, Convolution2D, Layer, MlpConvolution2D};
pub use tensors::{Device, Tensor};
