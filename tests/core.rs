use mlpconv::backprop::{activation, conv2d, Conv2dParams};
use mlpconv::random::{self, Initializer};
use mlpconv::tensors::{Device, Tensor};
use mlpconv::{tensor, Activation, Error};

#[test]
fn test_conv2d_backprop_numbers() {
    // 1x1x3x3 input, one 2x2 filter
    let x = Tensor::new(vec![1, 1, 3, 3], (1..=9).map(|v| v as f32).collect());
    let w = Tensor::new(vec![1, 1, 2, 2], vec![1.0, 0.0, 0.0, -1.0]);
    let b = tensor!([0.5]);

    let (y, back) = conv2d(&x, &w, Some(&b), Conv2dParams::default()).unwrap();
    assert_eq!(y.shape(), &[1, 1, 2, 2]);
    assert_eq!(y.data(), &[-3.5, -3.5, -3.5, -3.5]);

    let grads = back(&Tensor::new(vec![1, 1, 2, 2], vec![1.0; 4])).unwrap();
    // each filter tap sees a 2x2 window of x
    assert_eq!(grads.weight.data(), &[12.0, 16.0, 24.0, 28.0]);
    assert_eq!(grads.bias.unwrap().data(), &[4.0]);
    assert_eq!(
        grads.input.data(),
        &[1.0, 1.0, 0.0, 1.0, 0.0, -1.0, 0.0, -1.0, -1.0]
    );
}

#[test]
fn test_conv2d_stride_and_padding() {
    let x = Tensor::new(vec![1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]);
    let w = Tensor::new(vec![1, 1, 1, 1], vec![1.0]);
    let params = Conv2dParams {
        stride: (2, 2),
        pad: (1, 1),
        ..Conv2dParams::default()
    };
    let (y, back) = conv2d(&x, &w, None, params).unwrap();
    assert_eq!(y.shape(), &[1, 1, 2, 2]);
    // taps land on (-1,-1), (-1,1), (1,-1), (1,1)
    assert_eq!(y.data(), &[0.0, 0.0, 0.0, 4.0]);

    let grads = back(&Tensor::new(vec![1, 1, 2, 2], vec![1.0; 4])).unwrap();
    assert!(grads.bias.is_none());
    assert_eq!(grads.input.data(), &[0.0, 0.0, 0.0, 1.0]);
}

#[test]
fn test_conv2d_backward_closure_is_reusable() {
    let x = Tensor::new(vec![1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]);
    let w = Tensor::new(vec![2, 1, 1, 1], vec![1.0, -1.0]);
    let (y, back) = conv2d(&x, &w, None, Conv2dParams::default()).unwrap();
    let gy = Tensor::full_on(y.shape().to_vec(), 1.0, Device::Host);
    assert_eq!(back(&gy).unwrap(), back(&gy).unwrap());
    assert!(matches!(back(&Tensor::zeros(vec![1, 1, 2, 2])), Err(Error::Shape(_))));
}

#[test]
fn test_conv2d_rejects_bad_operands() {
    let x = Tensor::zeros(vec![1, 2, 4, 4]);
    let w = Tensor::zeros(vec![3, 1, 3, 3]);
    assert!(matches!(
        conv2d(&x, &w, None, Conv2dParams::default()),
        Err(Error::Shape(_))
    ));

    let w = Tensor::zeros(vec![3, 2, 3, 3]);
    let bad_bias = Tensor::zeros(vec![2]);
    assert!(matches!(
        conv2d(&x, &w, Some(&bad_bias), Conv2dParams::default()),
        Err(Error::Shape(_))
    ));

    let zero_stride = Conv2dParams {
        stride: (0, 1),
        ..Conv2dParams::default()
    };
    assert!(matches!(
        conv2d(&x, &w, None, zero_stride),
        Err(Error::InvalidArgument(_))
    ));

    assert!(matches!(
        conv2d(&x.to_accelerator(0), &w, None, Conv2dParams::default()),
        Err(Error::DeviceMismatch { .. })
    ));
}

#[test]
fn test_activation_backprop() {
    let (out, back) = activation(Activation::Relu, &tensor!([-1.0, 0.0, 2.0])).unwrap();
    assert_eq!(out.data(), &[0.0, 0.0, 2.0]);
    let grad_in = back(&tensor!([1.0, 1.0, 1.0])).unwrap();
    assert_eq!(grad_in.data(), &[0.0, 0.0, 1.0]);

    let (out, back) = activation(Activation::Sigmoid, &tensor!([0.0])).unwrap();
    assert_eq!(out.data(), &[0.5]);
    assert_eq!(back(&tensor!([1.0])).unwrap().data(), &[0.25]);

    let (out, back) = activation(Activation::Tanh, &tensor!([0.0])).unwrap();
    assert_eq!(out.data(), &[0.0]);
    assert_eq!(back(&tensor!([2.0])).unwrap().data(), &[2.0]);
}

#[test]
fn test_activation_gradient_must_match() {
    let (_, back) = activation(Activation::Tanh, &tensor!([1.0, 2.0])).unwrap();
    assert!(back(&tensor!([1.0])).is_err());
    assert!(back(&tensor!([1.0, 1.0]).to_accelerator(0)).is_err());
}

#[test]
fn test_initializers_are_deterministic() {
    let init = Initializer::LeCunNormal { scale: 1.0 };
    let a = init.fill(&[4, 3, 3, 3], 27, 99, Device::Host).unwrap();
    let b = init.fill(&[4, 3, 3, 3], 27, 99, Device::Host).unwrap();
    let c = init.fill(&[4, 3, 3, 3], 27, 100, Device::Host).unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);

    let zeros = Initializer::Constant(0.0).fill(&[5], 1, 0, Device::Accelerator(0)).unwrap();
    assert_eq!(zeros, Tensor::zeros_on(vec![5], Device::Accelerator(0)));
}

#[test]
fn test_global_reseed_replays_seeds() {
    random::seed(42);
    let first = [random::next_seed(), random::next_seed()];
    random::seed(42);
    assert_eq!(first, [random::next_seed(), random::next_seed()]);
}
