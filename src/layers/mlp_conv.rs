use core::ops::{Deref, Index};

use super::{Activation, ActivationBackward, Conv2dBackward, Conv2dOptions, Convolution2D, Layer};
use crate::error::{Error, Result};
use crate::random::{self, Initializer};
use crate::tensors::{Device, Tensor, WithGrad};

/// Two-dimensional MLP convolution layer of Network in Network.
///
/// A chain of convolutions: the first uses the requested kernel size, stride
/// and padding, every later one is a 1x1 convolution (a per-pixel fully
/// connected layer across channels). The activation runs between consecutive
/// convolutions and not after the last one.
///
/// # Example
/// ```rust
/// use mlpconv::{MlpConvolution2D, Tensor};
///
/// let mut mlp = MlpConvolution2D::builder(&[8, 8, 4], (3, 3))
///     .in_channels(Some(3))
///     .pad((1, 1))
///     .seed(7)
///     .build()
///     .unwrap();
/// assert_eq!(mlp.len(), 3);
///
/// let y = mlp.forward(&Tensor::zeros(vec![2, 3, 5, 5])).unwrap();
/// assert_eq!(y.shape(), &[2, 4, 5, 5]);
/// ```
///
/// The layer structure is fixed once built; layers can be read and run but
/// never replaced:
///
/// ```compile_fail
/// use mlpconv::layers::Convolution2D;
/// use mlpconv::MlpConvolution2D;
///
/// let mut mlp = MlpConvolution2D::builder(&[4, 4, 2], (3, 3)).build().unwrap();
/// mlp[1] = Convolution2D::new(Some(4), 7, (3, 3)).unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct MlpConvolution2D {
    layers: Vec<Convolution2D>,
    activation: Activation,
}

/// Builder returned by [`MlpConvolution2D::builder`].
#[derive(Debug, Clone)]
#[must_use]
pub struct MlpConvolution2DBuilder {
    out_channels: Vec<usize>,
    ksize: (usize, usize),
    in_channels: Option<usize>,
    stride: (usize, usize),
    pad: (usize, usize),
    activation: Activation,
    weight_init: Initializer,
    bias_init: Initializer,
    nobias: bool,
    seed: Option<u64>,
}

impl MlpConvolution2DBuilder {
    /// Input channels of the first convolution. `None` (default) infers them
    /// from the first input.
    ///
    /// Only the first weight is deferred: every later convolution takes its
    /// input channels from the previous layer's output channels, so its
    /// weight is allocated by [`build`](Self::build).
    pub fn in_channels(mut self, in_channels: Option<usize>) -> Self {
        self.in_channels = in_channels;
        self
    }

    /// Stride of the first convolution. Default `(1, 1)`.
    pub fn stride(mut self, stride: (usize, usize)) -> Self {
        self.stride = stride;
        self
    }

    /// Zero padding of the first convolution. Default `(0, 0)`.
    pub fn pad(mut self, pad: (usize, usize)) -> Self {
        self.pad = pad;
        self
    }

    /// Activation between convolutions. Default [`Activation::Relu`].
    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Weight initializer of every convolution.
    pub fn weight_init(mut self, init: Initializer) -> Self {
        self.weight_init = init;
        self
    }

    /// Bias initializer of every convolution.
    pub fn bias_init(mut self, init: Initializer) -> Self {
        self.bias_init = init;
        self
    }

    /// Omit every bias.
    pub fn nobias(mut self, nobias: bool) -> Self {
        self.nobias = nobias;
        self
    }

    /// Derive all layer seeds from `seed` instead of the process-wide state.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Builds the chain.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] for an empty channel list or any argument a
    /// [`Convolution2D`] rejects.
    pub fn build(self) -> Result<MlpConvolution2D> {
        if self.out_channels.is_empty() {
            return Err(Error::invalid("out_channels must name at least one layer"));
        }

        let n = self.out_channels.len();
        let seeds = match self.seed {
            Some(base) => random::derive_seeds(base, n),
            None => (0..n).map(|_| random::next_seed()).collect(),
        };

        let mut layers = Vec::with_capacity(n);
        let mut in_channels = self.in_channels;
        for (i, (&out, seed)) in self.out_channels.iter().zip(seeds).enumerate() {
            let first = i == 0;
            let options = Conv2dOptions {
                stride: if first { self.stride } else { (1, 1) },
                pad: if first { self.pad } else { (0, 0) },
                dilation: (1, 1),
                nobias: self.nobias,
                weight_init: self.weight_init,
                bias_init: self.bias_init,
                seed: Some(seed),
            };
            let ksize = if first { self.ksize } else { (1, 1) };
            layers.push(Convolution2D::with_options(in_channels, out, ksize, options)?);
            in_channels = Some(out);
        }

        log::debug!(
            "built mlp convolution with channels {:?}, kernel {:?}, {:?}",
            self.out_channels,
            self.ksize,
            self.activation
        );
        Ok(MlpConvolution2D {
            layers,
            activation: self.activation,
        })
    }
}

/// Backward handle of [`MlpConvolution2D::forward_traced`].
///
/// Holds one convolution closure per layer and the activation closures
/// between them.
pub struct ChainBackward {
    convs: Vec<Box<Conv2dBackward>>,
    activations: Vec<Box<ActivationBackward>>,
}

impl ChainBackward {
    /// Number of convolutions traced.
    #[must_use]
    pub fn len(&self) -> usize {
        self.convs.len()
    }

    /// Whether nothing was traced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.convs.is_empty()
    }
}

impl core::fmt::Debug for ChainBackward {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChainBackward").field("layers", &self.convs.len()).finish()
    }
}

impl MlpConvolution2D {
    /// Starts a chain with one convolution per `out_channels` entry; the first
    /// has kernel size `ksize`.
    pub fn builder(out_channels: &[usize], ksize: (usize, usize)) -> MlpConvolution2DBuilder {
        MlpConvolution2DBuilder {
            out_channels: out_channels.to_vec(),
            ksize,
            in_channels: None,
            stride: (1, 1),
            pad: (0, 0),
            activation: Activation::default(),
            weight_init: Initializer::default(),
            bias_init: Initializer::Constant(0.0),
            nobias: false,
            seed: None,
        }
    }

    /// Computes `layer[n-1](act(... act(layer[0](x)) ...))`.
    ///
    /// # Errors
    /// Any error of [`Convolution2D::forward`] or [`Activation::apply`].
    pub fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        let activation = self.activation;
        let (first, rest) = self
            .layers
            .split_first_mut()
            .ok_or_else(|| Error::invalid("empty convolution chain"))?;
        let mut h = first.forward(x)?;
        for layer in rest {
            h = activation.apply(&h)?;
            h = layer.forward(&h)?;
        }
        Ok(h)
    }

    /// Like [`MlpConvolution2D::forward`], also returning the backward handle.
    ///
    /// # Errors
    /// See [`MlpConvolution2D::forward`].
    pub fn forward_traced(&mut self, x: &Tensor) -> Result<(Tensor, ChainBackward)> {
        let activation = self.activation;
        let mut convs = Vec::with_capacity(self.layers.len());
        let mut activations = Vec::with_capacity(self.layers.len().saturating_sub(1));

        let mut h = x.clone();
        for (i, layer) in self.layers.iter_mut().enumerate() {
            if i > 0 {
                let (y, back) = activation.apply_traced(&h)?;
                activations.push(back);
                h = y;
            }
            let (y, back) = layer.forward_traced(&h)?;
            convs.push(back);
            h = y;
        }
        Ok((h, ChainBackward { convs, activations }))
    }

    /// Propagates `gy` back through the chain.
    ///
    /// Parameter gradients are added to every layer's gradient slots; the
    /// gradient with respect to the chain's input is returned.
    ///
    /// # Errors
    /// - [`Error::InvalidArgument`] if `trace` came from a chain of another length.
    /// - Any error of the traced closures or of [`Convolution2D::accumulate`].
    pub fn backward(&mut self, gy: &Tensor, trace: &ChainBackward) -> Result<Tensor> {
        if trace.len() != self.layers.len() {
            return Err(Error::invalid(format!(
                "trace covers {} layers but the chain has {}",
                trace.len(),
                self.layers.len()
            )));
        }

        let mut g = gy.clone();
        for (i, (layer, back)) in self.layers.iter_mut().zip(&trace.convs).enumerate().rev() {
            g = layer.backward(&g, back)?;
            if i > 0 {
                g = trace.activations[i - 1](&g)?;
            }
        }
        Ok(g)
    }

    /// Moves every parameter to accelerator `id`.
    pub fn to_accelerator(&mut self, id: u32) {
        self.to_device(Device::Accelerator(id));
    }

    /// Moves every parameter to host memory.
    pub fn to_host(&mut self) {
        self.to_device(Device::Host);
    }

    /// Number of convolutions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Always `false`; a chain has at least one convolution.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Iterates over the convolutions in order.
    pub fn iter(&self) -> core::slice::Iter<'_, Convolution2D> {
        self.layers.iter()
    }

    /// The `index`-th convolution.
    ///
    /// # Errors
    /// [`Error::Index`] if `index >= len()`.
    pub fn get(&self, index: usize) -> Result<&Convolution2D> {
        let len = self.layers.len();
        self.layers.get(index).ok_or(Error::Index { index, len })
    }

    /// A handle running the `index`-th convolution on its own.
    ///
    /// # Errors
    /// [`Error::Index`] if `index >= len()`.
    pub fn layer_mut(&mut self, index: usize) -> Result<LayerMut<'_>> {
        let len = self.layers.len();
        self.layers
            .get_mut(index)
            .map(|conv| LayerMut { conv })
            .ok_or(Error::Index { index, len })
    }

    /// The activation between convolutions.
    #[must_use]
    pub const fn activation(&self) -> Activation {
        self.activation
    }

    /// Whether every weight has been allocated.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.layers.iter().all(Convolution2D::is_initialized)
    }
}

impl Layer for MlpConvolution2D {
    fn params(&self) -> Vec<&WithGrad<Tensor>> {
        self.layers.iter().flat_map(Layer::params).collect()
    }

    fn params_mut(&mut self) -> Vec<&mut WithGrad<Tensor>> {
        self.layers.iter_mut().flat_map(Layer::params_mut).collect()
    }

    fn to_device(&mut self, device: Device) {
        for layer in &mut self.layers {
            layer.to_device(device);
        }
    }

    fn device(&self) -> Device {
        self.layers.first().map_or(Device::Host, Layer::device)
    }
}

impl Index<usize> for MlpConvolution2D {
    type Output = Convolution2D;

    fn index(&self, index: usize) -> &Convolution2D {
        &self.layers[index]
    }
}


impl<'a> IntoIterator for &'a MlpConvolution2D {
    type Item = &'a Convolution2D;
    type IntoIter = core::slice::Iter<'a, Convolution2D>;

    fn into_iter(self) -> Self::IntoIter {
        self.layers.iter()
    }
}

/// Mutable access to one convolution of a chain.
///
/// Runs the layer and manages its gradients, but cannot replace it or move
/// it to another device.
#[derive(Debug)]
pub struct LayerMut<'a> {
    conv: &'a mut Convolution2D,
}

impl LayerMut<'_> {
    /// See [`Convolution2D::forward`].
    ///
    /// # Errors
    /// See [`Convolution2D::forward`].
    pub fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        self.conv.forward(x)
    }

    /// See [`Convolution2D::forward_traced`].
    ///
    /// # Errors
    /// See [`Convolution2D::forward`].
    pub fn forward_traced(&mut self, x: &Tensor) -> Result<(Tensor, Box<Conv2dBackward>)> {
        self.conv.forward_traced(x)
    }

    /// See [`Convolution2D::backward`].
    ///
    /// # Errors
    /// See [`Convolution2D::backward`].
    pub fn backward(&mut self, gy: &Tensor, back: &Conv2dBackward) -> Result<Tensor> {
        self.conv.backward(gy, back)
    }

    /// Zeroes the layer's gradients.
    pub fn zero_grad(&mut self) {
        self.conv.zero_grad();
    }
}

impl Deref for LayerMut<'_> {
    type Target = Convolution2D;

    fn deref(&self) -> &Convolution2D {
        &*self.conv
    }
}
