#![allow(dead_code)]

use std::sync::{Arc, Mutex, PoisonError};

use mlpconv::backend::{
    AcceleratedBackend, BackwardDataVariant, Capabilities, CapabilityProbe, ConvGeometry,
    EntryPoint,
};
use mlpconv::ops::gemm::GemmBackend;
use mlpconv::{Activation, Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A uniformly random tensor in `[-1, 1)`.
pub fn random_tensor(shape: &[usize], seed: u64, device: Device) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let len = shape.iter().product();
    let data = (0..len).map(|_| rng.random_range(-1.0f32..1.0)).collect();
    Tensor::try_new(shape.to_vec(), data, device).unwrap()
}

pub fn assert_close(a: &Tensor, b: &Tensor, tol: f32) {
    assert_eq!(a.shape(), b.shape());
    for (i, (x, y)) in a.data().iter().zip(b.data()).enumerate() {
        assert!((x - y).abs() <= tol * (1.0 + y.abs()), "element {i}: {x} vs {y}");
    }
}

/// Wraps a [`GemmBackend`] and records every entry point it serves.
pub struct RecordingBackend {
    inner: GemmBackend,
    calls: Mutex<Vec<EntryPoint>>,
}

impl RecordingBackend {
    pub fn new(inner: GemmBackend) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<EntryPoint> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn record(&self, entry: EntryPoint) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(entry);
    }
}

pub fn installed(backend: &Arc<RecordingBackend>) -> Option<Arc<dyn AcceleratedBackend>> {
    Some(Arc::clone(backend) as Arc<dyn AcceleratedBackend>)
}

impl CapabilityProbe for RecordingBackend {
    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }
}

impl AcceleratedBackend for RecordingBackend {
    fn convolution_forward(
        &self,
        geom: &ConvGeometry,
        x: &Tensor,
        w: &Tensor,
        b: Option<&Tensor>,
    ) -> Result<Tensor> {
        self.record(EntryPoint::ConvolutionForward);
        self.inner.convolution_forward(geom, x, w, b)
    }

    fn convolution_backward_data(
        &self,
        variant: BackwardDataVariant,
        geom: &ConvGeometry,
        w: &Tensor,
        gy: &Tensor,
    ) -> Result<Tensor> {
        self.record(variant.into());
        self.inner.convolution_backward_data(variant, geom, w, gy)
    }

    fn convolution_backward_filter(
        &self,
        geom: &ConvGeometry,
        x: &Tensor,
        gy: &Tensor,
    ) -> Result<Tensor> {
        self.record(EntryPoint::ConvolutionBackwardFilter);
        self.inner.convolution_backward_filter(geom, x, gy)
    }

    fn activation_forward(&self, kind: Activation, x: &Tensor) -> Result<Tensor> {
        self.record(EntryPoint::ActivationForward);
        self.inner.activation_forward(kind, x)
    }

    fn activation_backward(
        &self,
        kind: Activation,
        x: &Tensor,
        y: &Tensor,
        gy: &Tensor,
    ) -> Result<Tensor> {
        self.record(EntryPoint::ActivationBackward);
        self.inner.activation_backward(kind, x, y, gy)
    }
}
