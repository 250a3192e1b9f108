//! Process-wide random state and parameter initializers.
//!
//! Layers do not draw weights from the shared generator directly. Each layer
//! takes one seed from it at construction ([`next_seed`]) and later fills its
//! weight from a private generator seeded with that value. A layer whose
//! weight is allocated lazily on the first forward call therefore ends up with
//! exactly the weights it would have had if allocated eagerly.

use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::error::{Error, Result};
use crate::tensors::{Device, Tensor};

lazy_static::lazy_static! {
    static ref GLOBAL_RNG: Mutex<StdRng> = Mutex::new(StdRng::from_os_rng());
}

/// Re-seeds the process-wide generator.
pub fn seed(seed: u64) {
    *GLOBAL_RNG.lock().unwrap_or_else(PoisonError::into_inner) = StdRng::seed_from_u64(seed);
}

/// Draws a fresh seed from the process-wide generator.
pub fn next_seed() -> u64 {
    GLOBAL_RNG
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .random()
}

/// Derives `count` seeds deterministically from `base`.
pub(crate) fn derive_seeds(base: u64, count: usize) -> Vec<u64> {
    let mut rng = StdRng::seed_from_u64(base);
    (0..count).map(|_| rng.random()).collect()
}

/// How a parameter is filled when it is allocated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Initializer {
    /// `N(0, scale * sqrt(1 / fan_in))`.
    LeCunNormal {
        /// Multiplier on the standard deviation.
        scale: f32,
    },
    /// Every element set to the value.
    Constant(f32),
}

impl Default for Initializer {
    fn default() -> Self {
        Self::LeCunNormal { scale: 1.0 }
    }
}

impl Initializer {
    /// Allocates a tensor of `shape` on `device`.
    ///
    /// `fan_in` is the number of inputs feeding one output element; `seed`
    /// drives the generator for random initializers.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] if the distribution parameters are unusable
    /// (zero `fan_in`, non-finite or negative scale).
    pub fn fill(&self, shape: &[usize], fan_in: usize, seed: u64, device: Device) -> Result<Tensor> {
        match *self {
            Self::Constant(value) => Ok(Tensor::full_on(shape.to_vec(), value, device)),
            Self::LeCunNormal { scale } => {
                if fan_in == 0 {
                    return Err(Error::invalid("LeCun normal initializer needs a non-zero fan-in"));
                }
                let std = scale * (1.0 / fan_in as f32).sqrt();
                let normal = Normal::new(0.0f32, std)
                    .map_err(|e| Error::invalid(format!("bad LeCun normal scale {scale}: {e}")))?;
                let mut rng = StdRng::seed_from_u64(seed);
                let len = shape.iter().product();
                let data = (0..len).map(|_| normal.sample(&mut rng)).collect();
                Ok(Tensor::from_parts(shape.to_vec(), data, device))
            }
        }
    }
}
