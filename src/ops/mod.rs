//! # Kernels and Operation Dispatch
//!
//! This module holds the kernel implementations and the layer that picks one
//! of them for every call.
//!
//! ## Submodules
//!
//! - [`cpu`] — Multi-threaded generic kernels (always available, always used for host tensors)
//! - [`gemm`] — In-process accelerated backend lowering convolutions to im2col + GEMM
//! - [`wgpu`] *(opt-in)* — GPU compute shader backend using `wgpu`
//! - [`dispatch`] — Per-call kernel selection and the differentiable operations
//!
//! ## Backend Selection
//!
//! Accelerated libraries implement
//! [`AcceleratedBackend`](crate::backend::AcceleratedBackend) and are installed
//! through [`config`](crate::config). The dispatch layer consults the kernel
//! policy and the backend's capabilities each time an operation runs.
//!
//! Example:
//! ```rust
//! use std::sync::Arc;
//! use mlpconv::backend::Policy;
//! use mlpconv::ops::gemm::GemmBackend;
//! use mlpconv::{config, tensor, Activation};
//!
//! let _backend = config::using_backend(Some(Arc::new(GemmBackend::new())));
//! let _policy = config::using_policy(Policy::Auto);
//! let x = tensor!([-1.0, 1.0]).to_accelerator(0);
//! let y = Activation::Relu.apply(&x).unwrap(); // runs on the gemm backend
//! assert_eq!(y.data(), &[0.0, 1.0]);
//! ```
//!
//! ## Extending the Backend
//!
//! To add a new operation:
//!
//! 1. Implement it in [`cpu`] and add an entry point to the backend trait
//! 2. Add it to the `dispatch` module for unified access
//! 3. Add shape/device checks in `dispatch`, never in a backend
//!
//! ## Feature Flags
//!
//! - `wgpu` — Enables the `wgpu` (WebGPU) backend

pub mod cpu;
pub mod dispatch;
pub mod gemm;
#[cfg(feature = "wgpu")]
pub mod wgpu;
