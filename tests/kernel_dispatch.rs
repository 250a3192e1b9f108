mod common;

use common::{init_logger, installed, random_tensor, RecordingBackend};
use mlpconv::backend::{EntryPoint, Policy};
use mlpconv::layers::{Conv2dOptions, Convolution2D};
use mlpconv::ops::dispatch::{plan_activation, plan_convolution, ConvolutionPlan};
use mlpconv::ops::gemm::GemmBackend;
use mlpconv::{config, Activation, Device, Error, Layer, MlpConvolution2D, Tensor};

const ACCEL: Device = Device::Accelerator(0);

fn block() -> MlpConvolution2D {
    let mut mlp = MlpConvolution2D::builder(&[4, 3], (3, 3))
        .in_channels(Some(2))
        .seed(1)
        .build()
        .unwrap();
    mlp.to_accelerator(0);
    mlp
}

/// One forward and one backward pass on the accelerator.
fn round_trip(mlp: &mut MlpConvolution2D) -> mlpconv::Result<Tensor> {
    let x = random_tensor(&[2, 2, 6, 6], 2, ACCEL);
    let (y, trace) = mlp.forward_traced(&x)?;
    let gy = Tensor::full_on(y.shape().to_vec(), 1.0, ACCEL);
    mlp.backward(&gy, &trace)
}

#[test]
fn never_runs_no_vendor_entry_point() {
    init_logger();
    let rec = RecordingBackend::new(GemmBackend::new());
    let _backend = config::using_backend(installed(&rec));
    let _policy = config::using_policy(Policy::Never);

    round_trip(&mut block()).unwrap();
    assert!(rec.calls().is_empty(), "{:?}", rec.calls());
}

#[test]
fn always_runs_vendor_forward_and_v3_backward_data() {
    let rec = RecordingBackend::new(GemmBackend::new().with_library_version(8000));
    let _backend = config::using_backend(installed(&rec));
    let _policy = config::using_policy(Policy::Always);

    round_trip(&mut block()).unwrap();
    let calls = rec.calls();
    assert_eq!(
        calls,
        vec![
            EntryPoint::ConvolutionForward,
            EntryPoint::ActivationForward,
            EntryPoint::ConvolutionForward,
            EntryPoint::ConvolutionBackwardDataV3,
            EntryPoint::ConvolutionBackwardFilter,
            EntryPoint::ActivationBackward,
            EntryPoint::ConvolutionBackwardDataV3,
            EntryPoint::ConvolutionBackwardFilter,
        ]
    );
}

#[test]
fn old_library_versions_use_v2_backward_data() {
    let rec = RecordingBackend::new(GemmBackend::new().with_library_version(2999));
    let _backend = config::using_backend(installed(&rec));
    let _policy = config::using_policy(Policy::Always);

    round_trip(&mut block()).unwrap();
    let calls = rec.calls();
    assert!(calls.contains(&EntryPoint::ConvolutionBackwardDataV2));
    assert!(!calls.contains(&EntryPoint::ConvolutionBackwardDataV3));
}

#[test]
fn the_v3_threshold_is_negotiated_per_library() {
    let rec = RecordingBackend::new(
        GemmBackend::new()
            .with_library_version(8000)
            .with_backward_data_v3_min_version(9000),
    );
    let _backend = config::using_backend(installed(&rec));
    let _policy = config::using_policy(Policy::Always);

    round_trip(&mut block()).unwrap();
    assert!(rec.calls().contains(&EntryPoint::ConvolutionBackwardDataV2));
}

#[test]
fn auto_matches_the_probe() {
    let rec = RecordingBackend::new(GemmBackend::new());
    let _backend = config::using_backend(installed(&rec));
    let _policy = config::using_policy(Policy::Auto);

    round_trip(&mut block()).unwrap();
    assert!(rec.calls().contains(&EntryPoint::ConvolutionForward));

    // dilation is outside the gemm capabilities
    rec.clear();
    let opts = Conv2dOptions {
        dilation: (2, 2),
        ..Conv2dOptions::default()
    };
    let mut dilated = Convolution2D::with_options(Some(1), 2, (2, 2), opts).unwrap();
    dilated.to_device(ACCEL);
    let x = Tensor::zeros_on(vec![1, 1, 5, 5], ACCEL);
    let (y, back) = dilated.forward_traced(&x).unwrap();
    assert_eq!(y.shape(), &[1, 2, 3, 3]);
    dilated
        .backward(&Tensor::zeros_on(y.shape().to_vec(), ACCEL), &back)
        .unwrap();
    assert!(rec.calls().is_empty());
}

#[test]
fn always_with_an_unsupported_variant_fails_in_the_backend() {
    let rec = RecordingBackend::new(GemmBackend::new());
    let _backend = config::using_backend(installed(&rec));
    let _policy = config::using_policy(Policy::Always);

    let opts = Conv2dOptions {
        dilation: (2, 2),
        ..Conv2dOptions::default()
    };
    let mut dilated = Convolution2D::with_options(Some(1), 2, (2, 2), opts).unwrap();
    dilated.to_device(ACCEL);
    let err = dilated.forward(&Tensor::zeros_on(vec![1, 1, 5, 5], ACCEL)).unwrap_err();
    assert!(matches!(err, Error::Environment(_)));
}

#[test]
fn always_without_a_backend_is_an_environment_error() {
    let _backend = config::using_backend(None);
    let _policy = config::using_policy(Policy::Always);

    let err = round_trip(&mut block()).unwrap_err();
    assert!(matches!(err, Error::Environment(_)), "{err}");
}

#[test]
fn host_tensors_stay_on_the_generic_kernels() {
    let rec = RecordingBackend::new(GemmBackend::new());
    let _backend = config::using_backend(installed(&rec));
    let _policy = config::using_policy(Policy::Always);

    let mut mlp = block();
    mlp.to_host();
    let x = random_tensor(&[1, 2, 4, 4], 3, Device::Host);
    let (y, trace) = mlp.forward_traced(&x).unwrap();
    mlp.backward(&Tensor::zeros(y.shape().to_vec()), &trace).unwrap();
    assert!(rec.calls().is_empty());
}

#[test]
fn policy_is_read_when_the_backward_closure_runs() {
    let rec = RecordingBackend::new(GemmBackend::new());
    let _backend = config::using_backend(installed(&rec));

    let mut mlp = block();
    let x = random_tensor(&[1, 2, 5, 5], 4, ACCEL);
    let (y, trace) = config::with_policy(Policy::Never, || mlp.forward_traced(&x)).unwrap();
    assert!(rec.calls().is_empty());

    let _policy = config::using_policy(Policy::Always);
    mlp.backward(&Tensor::zeros_on(y.shape().to_vec(), ACCEL), &trace)
        .unwrap();
    let calls = rec.calls();
    assert!(!calls.contains(&EntryPoint::ConvolutionForward));
    assert!(calls.contains(&EntryPoint::ConvolutionBackwardFilter));
}

#[test]
fn plans_agree_with_the_executed_entry_points() {
    let rec = RecordingBackend::new(GemmBackend::new().with_library_version(2000));
    let _backend = config::using_backend(installed(&rec));

    let mut mlp = block();
    let geom = mlpconv::backend::ConvGeometry::new([2, 2, 6, 6], [4, 2, 3, 3], (1, 1), (0, 0), (1, 1))
        .unwrap();
    let sig = geom.signature(ACCEL);

    {
        let _policy = config::using_policy(Policy::Never);
        assert_eq!(
            plan_convolution(&sig).unwrap(),
            ConvolutionPlan {
                forward: EntryPoint::Generic,
                backward_data: EntryPoint::Generic,
                backward_filter: EntryPoint::Generic,
            }
        );
    }

    let _policy = config::using_policy(Policy::Auto);
    let plan = plan_convolution(&sig).unwrap();
    assert_eq!(plan.forward, EntryPoint::ConvolutionForward);
    assert_eq!(plan.backward_data, EntryPoint::ConvolutionBackwardDataV2);
    assert_eq!(plan.backward_filter, EntryPoint::ConvolutionBackwardFilter);

    round_trip(&mut mlp).unwrap();
    let calls = rec.calls();
    assert_eq!(calls.first(), Some(&plan.forward));
    assert!(calls.contains(&plan.backward_data));

    let act_sig = mlpconv::backend::OpSignature::activation(
        Activation::Relu,
        &Tensor::zeros_on(vec![1], ACCEL),
    );
    assert_eq!(
        plan_activation(&act_sig).unwrap(),
        (EntryPoint::ActivationForward, EntryPoint::ActivationBackward)
    );
}

#[test]
fn vendor_and_generic_gradients_agree() {
    let rec = RecordingBackend::new(GemmBackend::new());
    let _backend = config::using_backend(installed(&rec));

    let run = |policy: Policy| {
        let _policy = config::using_policy(policy);
        let mut mlp = block();
        let gx = round_trip(&mut mlp).unwrap();
        let grads: Vec<Tensor> = mlp.params().iter().map(|p| p.grad.clone()).collect();
        (gx, grads)
    };
    let (gx_generic, grads_generic) = run(Policy::Never);
    let (gx_vendor, grads_vendor) = run(Policy::Always);

    common::assert_close(&gx_vendor, &gx_generic, 1e-5);
    for (v, g) in grads_vendor.iter().zip(&grads_generic) {
        common::assert_close(v, g, 1e-5);
    }
}
