use super::{Conv2dBackward, Conv2dGrads, Layer};
use crate::error::{Error, Result};
use crate::ops::dispatch::{self, Conv2dParams};
use crate::random::{self, Initializer};
use crate::tensors::{Device, Tensor, WithGrad};

/// Optional settings of a [`Convolution2D`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conv2dOptions {
    /// Stride `(sy, sx)`. Default `(1, 1)`.
    pub stride: (usize, usize),
    /// Zero padding `(ph, pw)`. Default `(0, 0)`.
    pub pad: (usize, usize),
    /// Dilation `(dy, dx)`. Default `(1, 1)`.
    pub dilation: (usize, usize),
    /// Omit the bias.
    pub nobias: bool,
    /// Weight initializer. Default LeCun normal.
    pub weight_init: Initializer,
    /// Bias initializer. Default zero.
    pub bias_init: Initializer,
    /// Seed for the initializers. Drawn from [`random::next_seed`] when `None`.
    pub seed: Option<u64>,
}

impl Default for Conv2dOptions {
    fn default() -> Self {
        Self {
            stride: (1, 1),
            pad: (0, 0),
            dilation: (1, 1),
            nobias: false,
            weight_init: Initializer::default(),
            bias_init: Initializer::Constant(0.0),
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
enum WeightState {
    Uninitialized,
    Initialized(WithGrad<Tensor>),
}

/// Two-dimensional convolution layer.
///
/// The weight has shape `(out_channels, in_channels, kh, kw)`. When the input
/// channel count is not given at construction, the weight is allocated on the
/// first forward call from the channel count of that call's input, and every
/// later input must have the same channel count.
///
/// # Example
/// ```rust
/// use mlpconv::layers::Convolution2D;
/// use mlpconv::tensors::Tensor;
///
/// let mut conv = Convolution2D::new(None, 4, (3, 3)).unwrap();
/// assert!(!conv.is_initialized());
///
/// let y = conv.forward(&Tensor::zeros(vec![2, 3, 8, 8])).unwrap();
/// assert_eq!(y.shape(), &[2, 4, 6, 6]);
/// assert_eq!(conv.weight_shape(), Some([4, 3, 3, 3]));
/// ```
#[derive(Debug, Clone)]
pub struct Convolution2D {
    weight: WeightState,
    bias: Option<WithGrad<Tensor>>,
    in_channels: Option<usize>,
    out_channels: usize,
    ksize: (usize, usize),
    params: Conv2dParams,
    weight_init: Initializer,
    weight_seed: u64,
    device: Device,
}

impl Convolution2D {
    /// A host convolution with default [`Conv2dOptions`].
    ///
    /// # Errors
    /// See [`Convolution2D::with_options`].
    pub fn new(in_channels: Option<usize>, out_channels: usize, ksize: (usize, usize)) -> Result<Self> {
        Self::with_options(in_channels, out_channels, ksize, Conv2dOptions::default())
    }

    /// A host convolution.
    ///
    /// The bias is allocated immediately; the weight only if `in_channels` is
    /// known.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] for a zero channel count, kernel dimension,
    /// stride or dilation, or an initializer that cannot be sampled.
    pub fn with_options(
        in_channels: Option<usize>,
        out_channels: usize,
        ksize: (usize, usize),
        options: Conv2dOptions,
    ) -> Result<Self> {
        if out_channels == 0 || in_channels == Some(0) {
            return Err(Error::invalid(format!(
                "channel counts must be positive (in {in_channels:?}, out {out_channels})"
            )));
        }
        if ksize.0 == 0 || ksize.1 == 0 {
            return Err(Error::invalid(format!("kernel size must be positive, got {ksize:?}")));
        }
        if options.stride.0 == 0 || options.stride.1 == 0 {
            return Err(Error::invalid(format!("stride must be positive, got {:?}", options.stride)));
        }
        if options.dilation.0 == 0 || options.dilation.1 == 0 {
            return Err(Error::invalid(format!(
                "dilation must be positive, got {:?}",
                options.dilation
            )));
        }

        let seed = options.seed.unwrap_or_else(random::next_seed);
        let seeds = random::derive_seeds(seed, 2);
        let (weight_seed, bias_seed) = (seeds[0], seeds[1]);

        let bias = if options.nobias {
            None
        } else {
            let b = options.bias_init.fill(&[out_channels], 1, bias_seed, Device::Host)?;
            Some(WithGrad::new(b))
        };

        let mut layer = Self {
            weight: WeightState::Uninitialized,
            bias,
            in_channels,
            out_channels,
            ksize,
            params: Conv2dParams {
                stride: options.stride,
                pad: options.pad,
                dilation: options.dilation,
            },
            weight_init: options.weight_init,
            weight_seed,
            device: Device::Host,
        };
        if let Some(c) = in_channels {
            layer.initialize(c)?;
        }
        Ok(layer)
    }

    fn initialize(&mut self, in_channels: usize) -> Result<()> {
        let shape = [self.out_channels, in_channels, self.ksize.0, self.ksize.1];
        let fan_in = in_channels * self.ksize.0 * self.ksize.1;
        let value = self.weight_init.fill(&shape, fan_in, self.weight_seed, self.device)?;
        log::debug!("allocated convolution weight {shape:?} on {}", self.device);
        self.weight = WeightState::Initialized(WithGrad::new(value));
        self.in_channels = Some(in_channels);
        Ok(())
    }

    /// Validates `x` against the layer and allocates the weight on first use.
    fn prepare(&mut self, x: &Tensor) -> Result<()> {
        let [_, c, _, _] = x.dims4()?;
        if x.device() != self.device {
            return Err(Error::DeviceMismatch {
                expected: self.device,
                found: x.device(),
            });
        }
        if let Some(expected) = self.in_channels
            && expected != c
        {
            return Err(Error::shape(format!(
                "layer expects {expected} input channels, got input of shape {:?}",
                x.shape()
            )));
        }
        if matches!(self.weight, WeightState::Uninitialized) {
            self.initialize(c)?;
        }
        Ok(())
    }

    fn operands(&self) -> Result<(&Tensor, Option<&Tensor>)> {
        match &self.weight {
            WeightState::Initialized(w) => Ok((&w.value, self.bias.as_ref().map(|b| &b.value))),
            WeightState::Uninitialized => Err(Error::invalid("convolution weight is not allocated")),
        }
    }

    /// Applies the convolution.
    ///
    /// # Errors
    /// - [`Error::Shape`] if `x` is not `(batch, channels, height, width)`, its
    ///   channel count differs from the layer's, or the output would be empty.
    /// - [`Error::DeviceMismatch`] if `x` is not on the layer's device.
    /// - [`Error::Environment`] if the kernel policy cannot be satisfied.
    pub fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        self.prepare(x)?;
        let (w, b) = self.operands()?;
        dispatch::conv2d_forward(x, w, b, self.params)
    }

    /// Like [`Convolution2D::forward`], also returning the backward closure.
    ///
    /// Pass the closure to [`Convolution2D::backward`] to accumulate parameter
    /// gradients.
    ///
    /// # Errors
    /// See [`Convolution2D::forward`].
    pub fn forward_traced(&mut self, x: &Tensor) -> Result<(Tensor, Box<Conv2dBackward>)> {
        self.prepare(x)?;
        let (w, b) = self.operands()?;
        dispatch::conv2d(x, w, b, self.params)
    }

    /// Runs `back` on `gy`, accumulates the parameter gradients and returns
    /// the input gradient.
    ///
    /// # Errors
    /// Errors of the closure and of [`Convolution2D::accumulate`].
    pub fn backward(&mut self, gy: &Tensor, back: &Conv2dBackward) -> Result<Tensor> {
        let grads = back(gy)?;
        self.accumulate(&grads)?;
        Ok(grads.input)
    }

    /// Adds `grads` into the weight and bias gradient slots.
    ///
    /// # Errors
    /// - [`Error::InvalidArgument`] if the weight is not allocated or the
    ///   presence of a bias gradient does not match the layer.
    /// - [`Error::Shape`] / [`Error::DeviceMismatch`] for mismatched gradients.
    pub fn accumulate(&mut self, grads: &Conv2dGrads) -> Result<()> {
        let WeightState::Initialized(weight) = &mut self.weight else {
            return Err(Error::invalid("cannot accumulate into an unallocated weight"));
        };
        weight.accumulate_grad(&grads.weight)?;
        match (&mut self.bias, &grads.bias) {
            (Some(bias), Some(g)) => bias.accumulate_grad(g),
            (None, None) => Ok(()),
            (Some(_), None) => Err(Error::invalid("missing bias gradient")),
            (None, Some(_)) => Err(Error::invalid("bias gradient for a layer without bias")),
        }
    }

    /// Input channel count, `None` until known.
    #[must_use]
    pub const fn in_channels(&self) -> Option<usize> {
        self.in_channels
    }

    /// Output channel count.
    #[must_use]
    pub const fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Kernel size `(kh, kw)`.
    #[must_use]
    pub const fn ksize(&self) -> (usize, usize) {
        self.ksize
    }

    /// Stride `(sy, sx)`.
    #[must_use]
    pub const fn stride(&self) -> (usize, usize) {
        self.params.stride
    }

    /// Zero padding `(ph, pw)`.
    #[must_use]
    pub const fn pad(&self) -> (usize, usize) {
        self.params.pad
    }

    /// Dilation `(dy, dx)`.
    #[must_use]
    pub const fn dilation(&self) -> (usize, usize) {
        self.params.dilation
    }

    /// The weight, once allocated.
    #[must_use]
    pub const fn weight(&self) -> Option<&WithGrad<Tensor>> {
        match &self.weight {
            WeightState::Initialized(w) => Some(w),
            WeightState::Uninitialized => None,
        }
    }

    /// Weight shape `(out, in, kh, kw)`, once the input channel count is known.
    #[must_use]
    pub fn weight_shape(&self) -> Option<[usize; 4]> {
        self.in_channels
            .map(|c| [self.out_channels, c, self.ksize.0, self.ksize.1])
    }

    /// The bias, unless constructed with `nobias`.
    #[must_use]
    pub const fn bias(&self) -> Option<&WithGrad<Tensor>> {
        self.bias.as_ref()
    }

    /// Whether the weight has been allocated.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        matches!(self.weight, WeightState::Initialized(_))
    }
}

impl Layer for Convolution2D {
    fn params(&self) -> Vec<&WithGrad<Tensor>> {
        self.weight().into_iter().chain(self.bias.as_ref()).collect()
    }

    fn params_mut(&mut self) -> Vec<&mut WithGrad<Tensor>> {
        let weight = match &mut self.weight {
            WeightState::Initialized(w) => Some(w),
            WeightState::Uninitialized => None,
        };
        weight.into_iter().chain(self.bias.as_mut()).collect()
    }

    fn to_device(&mut self, device: Device) {
        if device != self.device {
            log::debug!("moving convolution {:?} from {} to {device}", self.weight_shape(), self.device);
        }
        for p in self.params_mut() {
            p.move_to(device);
        }
        self.device = device;
    }

    fn device(&self) -> Device {
        self.device
    }
}
