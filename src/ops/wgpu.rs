//! GPU-accelerated kernels using WGPU.
//!
//! This module implements the [`AcceleratedBackend`] entry points as WGSL
//! compute shaders:
//!
//! - `conv_forward` — direct convolution, one invocation per output element
//! - `conv_backward_data` — input gradient, gathered per input element
//! - `conv_backward_filter` — weight gradient, one invocation per weight
//! - `activation` — forward and backward of every [`Activation`]
//!
//! All shaders share one bind group layout: binding 0 holds the `u32`
//! dimensions, bindings 1 to 3 the read-only operands and binding 4 the
//! output. Tensors are uploaded for each call and read back through a
//! staging buffer, so outputs are ordinary tensors on the input's device.
//!
//! The GPU has a single backward-data algorithm; both
//! [`BackwardDataVariant`]s run it.

use std::sync::{mpsc, Arc};

use wgpu::util::DeviceExt;

use crate::backend::{
    AcceleratedBackend, BackwardDataVariant, Capabilities, CapabilityProbe, ConvGeometry,
};
use crate::error::Result;
use crate::layers::Activation;
use crate::tensors::Tensor;

const CONV_FORWARD: &str = include_str!("shaders/conv_forward.wgsl");
const CONV_BACKWARD_DATA: &str = include_str!("shaders/conv_backward_data.wgsl");
const CONV_BACKWARD_FILTER: &str = include_str!("shaders/conv_backward_filter.wgsl");
const ACTIVATION: &str = include_str!("shaders/activation.wgsl");

const WORKGROUP_SIZE: u32 = 64;
const MAX_GROUPS_PER_DIM: u32 = 65_535;

/// Basic wrapper for common GPU errors.
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    /// An error in requesting the adapter.
    #[error("adapter error: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),
    /// An error in requesting the GPU (device).
    #[error("device error: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
    /// Waiting for submitted work failed.
    #[error("poll error: {0}")]
    Poll(#[from] wgpu::PollError),
    /// Mapping the staging buffer failed.
    #[error("buffer mapping failed: {0}")]
    Map(#[from] wgpu::BufferAsyncError),
    /// Read-back data could not be interpreted.
    #[error("read-back failed: {0}")]
    Readback(String),
}

struct Pipelines {
    conv_forward: wgpu::ComputePipeline,
    conv_backward_data: wgpu::ComputePipeline,
    conv_backward_filter: wgpu::ComputePipeline,
    activation: wgpu::ComputePipeline,
}

/// Accelerated backend running on the default `wgpu` adapter.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    layout: wgpu::BindGroupLayout,
    pipelines: Pipelines,
    adapter_name: String,
}

impl core::fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("adapter", &self.adapter_name)
            .finish_non_exhaustive()
    }
}

lazy_static::lazy_static! {
    static ref SHARED: Option<Arc<WgpuBackend>> = match WgpuBackend::new() {
        Ok(backend) => Some(Arc::new(backend)),
        Err(err) => {
            log::warn!("wgpu backend unavailable: {err}");
            None
        }
    };
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    label: &str,
    source: &str,
) -> wgpu::ComputePipeline {
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        module: &module,
        entry_point: Some("main"),
        cache: None,
        compilation_options: wgpu::PipelineCompilationOptions::default(),
    })
}

/// Splits `groups` workgroups into a 2-D grid within the per-dimension limit.
fn grid(groups: u32) -> (u32, u32) {
    if groups <= MAX_GROUPS_PER_DIM {
        (groups.max(1), 1)
    } else {
        (MAX_GROUPS_PER_DIM, groups.div_ceil(MAX_GROUPS_PER_DIM))
    }
}

fn conv_dims(geom: &ConvGeometry, flag: u32, total: usize) -> [u32; 17] {
    let [n, c, h, w] = geom.input;
    let [oc, _, kh, kw] = geom.weight;
    [
        n as u32,
        c as u32,
        h as u32,
        w as u32,
        oc as u32,
        kh as u32,
        kw as u32,
        geom.output.0 as u32,
        geom.output.1 as u32,
        geom.stride.0 as u32,
        geom.stride.1 as u32,
        geom.pad.0 as u32,
        geom.pad.1 as u32,
        geom.dilation.0 as u32,
        geom.dilation.1 as u32,
        flag,
        total as u32,
    ]
}

impl WgpuBackend {
    /// Initializes a backend on the default adapter.
    ///
    /// # Errors
    /// [`GpuError::Adapter`] or [`GpuError::Device`] if no usable GPU is found.
    pub fn new() -> core::result::Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))?;
        let adapter_name = adapter.get_info().name;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("mlpconv"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))?;

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("mlpconv_bgl"),
            entries: &[
                storage_entry(0, true),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, true),
                storage_entry(4, false),
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("mlpconv_pipeline_layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipelines = Pipelines {
            conv_forward: pipeline(&device, &pipeline_layout, "conv_forward", CONV_FORWARD),
            conv_backward_data: pipeline(
                &device,
                &pipeline_layout,
                "conv_backward_data",
                CONV_BACKWARD_DATA,
            ),
            conv_backward_filter: pipeline(
                &device,
                &pipeline_layout,
                "conv_backward_filter",
                CONV_BACKWARD_FILTER,
            ),
            activation: pipeline(&device, &pipeline_layout, "activation", ACTIVATION),
        };

        log::debug!("wgpu backend ready on {adapter_name}");
        Ok(Self {
            device,
            queue,
            layout,
            pipelines,
            adapter_name,
        })
    }

    /// The process-wide instance, or `None` if no GPU could be initialized.
    #[must_use]
    pub fn shared() -> Option<Arc<Self>> {
        SHARED.clone()
    }

    fn upload(&self, label: &str, data: &[u8]) -> wgpu::Buffer {
        // zero-sized storage bindings are invalid
        let padded = [0u8; 4];
        let contents = if data.is_empty() { &padded[..] } else { data };
        self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents,
            usage: wgpu::BufferUsages::STORAGE,
        })
    }

    /// Runs `pipeline` over `len` output elements and reads the result back.
    fn run(
        &self,
        pipeline: &wgpu::ComputePipeline,
        dims: &[u32],
        inputs: [&[f32]; 3],
        len: usize,
    ) -> core::result::Result<Vec<f32>, GpuError> {
        let size = (len.max(1) * size_of::<f32>()) as u64;

        let dims_buffer = self.upload("dims", bytemuck::cast_slice(dims));
        let input_buffers = inputs.map(|data| self.upload("operand", bytemuck::cast_slice(data)));
        let output = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("output"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("mlpconv_bind_group"),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: dims_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: input_buffers[0].as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: input_buffers[1].as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: input_buffers[2].as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: output.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("mlpconv_encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("mlpconv_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let (gx, gy) = grid((len as u32).div_ceil(WORKGROUP_SIZE));
            pass.dispatch_workgroups(gx, gy, 1);
        }

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        encoder.copy_buffer_to_buffer(&output, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::PollType::Wait)?;
        rx.recv()
            .map_err(|e| GpuError::Readback(e.to_string()))??;

        let view = slice.get_mapped_range();
        let values = bytemuck::try_cast_slice::<u8, f32>(&view)
            .map_err(|e| GpuError::Readback(e.to_string()))?;
        let out = values[..len].to_vec();
        drop(view);
        staging.unmap();
        Ok(out)
    }
}

impl CapabilityProbe for WgpuBackend {
    fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::new(format!("wgpu ({})", self.adapter_name), 26_000);
        caps.supports_dilation = true;
        caps
    }
}

impl AcceleratedBackend for WgpuBackend {
    fn convolution_forward(
        &self,
        geom: &ConvGeometry,
        x: &Tensor,
        w: &Tensor,
        b: Option<&Tensor>,
    ) -> Result<Tensor> {
        let shape = geom.output_shape();
        let len = shape.iter().product();
        let dims = conv_dims(geom, u32::from(b.is_some()), len);
        let bias = b.map_or(&[][..], Tensor::data);
        let out = self.run(
            &self.pipelines.conv_forward,
            &dims,
            [x.data(), w.data(), bias],
            len,
        )?;
        Tensor::try_new(shape.to_vec(), out, x.device())
    }

    fn convolution_backward_data(
        &self,
        _variant: BackwardDataVariant,
        geom: &ConvGeometry,
        w: &Tensor,
        gy: &Tensor,
    ) -> Result<Tensor> {
        let len = geom.input.iter().product();
        let dims = conv_dims(geom, 0, len);
        let out = self.run(
            &self.pipelines.conv_backward_data,
            &dims,
            [w.data(), gy.data(), &[]],
            len,
        )?;
        Tensor::try_new(geom.input.to_vec(), out, gy.device())
    }

    fn convolution_backward_filter(
        &self,
        geom: &ConvGeometry,
        x: &Tensor,
        gy: &Tensor,
    ) -> Result<Tensor> {
        let len = geom.weight.iter().product();
        let dims = conv_dims(geom, 0, len);
        let out = self.run(
            &self.pipelines.conv_backward_filter,
            &dims,
            [x.data(), gy.data(), &[]],
            len,
        )?;
        Tensor::try_new(geom.weight.to_vec(), out, gy.device())
    }

    fn activation_forward(&self, kind: Activation, x: &Tensor) -> Result<Tensor> {
        let op = match kind {
            Activation::Relu => 0,
            Activation::Sigmoid => 1,
            Activation::Tanh => 2,
        };
        let out = self.run(
            &self.pipelines.activation,
            &[op, x.len() as u32],
            [x.data(), &[], &[]],
            x.len(),
        )?;
        Tensor::try_new(x.shape().to_vec(), out, x.device())
    }

    fn activation_backward(
        &self,
        kind: Activation,
        x: &Tensor,
        y: &Tensor,
        gy: &Tensor,
    ) -> Result<Tensor> {
        let op = match kind {
            Activation::Relu => 3,
            Activation::Sigmoid => 4,
            Activation::Tanh => 5,
        };
        let out = self.run(
            &self.pipelines.activation,
            &[op, gy.len() as u32],
            [x.data(), y.data(), gy.data()],
            gy.len(),
        )?;
        Tensor::try_new(gy.shape().to_vec(), out, gy.device())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_stays_within_the_dispatch_limit() {
        assert_eq!(grid(0), (1, 1));
        assert_eq!(grid(10), (10, 1));
        assert_eq!(grid(65_536), (65_535, 2));
    }
}
