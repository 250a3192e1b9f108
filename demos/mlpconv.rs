use std::error::Error;
use std::sync::Arc;

use mlpconv::backend::AcceleratedBackend;
use mlpconv::ops::gemm::GemmBackend;
use mlpconv::{config, Activation, Device, Layer, MlpConvolution2D, Policy, Tensor};

/// Fits a small block to map a diagonal stripe pattern onto its mirror image.
fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    // input channels are inferred from the first batch
    let mut block = MlpConvolution2D::builder(&[8, 8, 1], (3, 3))
        .pad((1, 1))
        .activation(Activation::Tanh)
        .seed(0)
        .build()?;

    let side = 8;
    let stripes: Vec<f32> = (0..side * side)
        .map(|i| if (i / side + i % side) % 3 == 0 { 1.0 } else { -1.0 })
        .collect();
    let mirrored: Vec<f32> = (0..side * side)
        .map(|i| stripes[(i / side) * side + (side - 1 - i % side)])
        .collect();

    let gemm: Arc<dyn AcceleratedBackend> = Arc::new(GemmBackend::new());
    config::set_global_backend(Some(gemm));

    for (label, device) in [("host", Device::Host), ("accelerator", Device::Accelerator(0))] {
        block.to_device(device);
        let x = Tensor::try_new(vec![1, 1, side, side], stripes.clone(), device)?;
        let target = Tensor::try_new(vec![1, 1, side, side], mirrored.clone(), device)?;

        let _policy = config::using_policy(Policy::Auto);
        for step in 0..200 {
            block.zero_grad();
            let (y, trace) = block.forward_traced(&x)?;

            // mean squared error and its gradient
            let n = y.len() as f32;
            let diff: Vec<f32> = y.data().iter().zip(target.data()).map(|(a, b)| a - b).collect();
            let loss = diff.iter().map(|d| d * d).sum::<f32>() / n;
            let grad = diff.iter().map(|d| 2.0 * d / n).collect();
            let gy = Tensor::try_new(y.shape().to_vec(), grad, device)?;
            block.backward(&gy, &trace)?;

            for p in block.params_mut() {
                let updated: Vec<f32> = p
                    .value
                    .data()
                    .iter()
                    .zip(p.grad.data())
                    .map(|(w, g)| w - 0.05 * g)
                    .collect();
                p.value = Tensor::try_new(p.shape().to_vec(), updated, device)?;
            }

            if step % 50 == 0 {
                println!("{label} step {step:>3}: loss={loss:.5}");
            }
        }
    }

    println!("parameters: {}", block.count_params());
    Ok(())
}
