use mlpconv::tensor;
use mlpconv::tensors::{DType, Device, Tensor, WithGrad};
use mlpconv::Error;

#[test]
fn test_tensor_creation() {
    let t = Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(t.shape(), &[2, 2]);
    assert_eq!(t.data(), &[1.0, 2.0, 3.0, 4.0]);
    assert_eq!(t.device(), Device::Host);
    assert_eq!(t.dtype(), DType::F32);
    assert_eq!(t.rank(), 2);
    assert_eq!(t.len(), 4);
}

#[test]
fn test_tensor_shape_mismatch_panics() {
    let result = std::panic::catch_unwind(|| {
        Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0]);
    });
    assert!(result.is_err());
}

#[test]
fn test_try_new_reports_shape_errors() {
    let err = Tensor::try_new(vec![2, 3], vec![0.0; 5], Device::Host).unwrap_err();
    assert!(matches!(err, Error::Shape(_)));

    let t = Tensor::try_new(vec![3], vec![1.0; 3], Device::Accelerator(2)).unwrap();
    assert_eq!(t.device(), Device::Accelerator(2));
}

#[test]
fn test_tensor_macro() {
    let t = tensor!([[1.0, 2.0], [3.0, -4.0]]);
    assert_eq!(t.shape(), &[2, 2]);
    assert_eq!(t.data(), &[1.0, 2.0, 3.0, -4.0]);

    let cube = tensor!([[[1.0], [2.0]], [[3.0], [4.0]]]);
    assert_eq!(cube.shape(), &[2, 2, 1]);
}

#[test]
#[should_panic(expected = "ragged tensor literal")]
fn test_ragged_macro_panics() {
    let _ = tensor!([[1.0, 2.0], [3.0]]);
}

#[test]
fn test_dims4() {
    assert_eq!(Tensor::zeros(vec![1, 2, 3, 4]).dims4().unwrap(), [1, 2, 3, 4]);
    assert!(matches!(Tensor::zeros(vec![2, 3, 4]).dims4(), Err(Error::Shape(_))));
}

#[test]
fn test_device_transfer_keeps_data() {
    let t = tensor!([1.0, 2.0, 3.0]);
    let moved = t.to_accelerator(1);
    assert_eq!(moved.device(), Device::Accelerator(1));
    assert_eq!(moved.data(), t.data());
    assert_ne!(moved, t);
    assert_eq!(moved.to_host(), t);
    assert_eq!(t.clone().into_device(Device::Accelerator(1)), moved);
    assert_eq!(Device::Accelerator(1).to_string(), "accelerator:1");
}

#[test]
fn test_accumulate_requires_matching_device_and_shape() {
    let mut a = Tensor::full_on(vec![2], 1.0, Device::Host);
    a.accumulate(&tensor!([2.0, 3.0])).unwrap();
    assert_eq!(a.data(), &[3.0, 4.0]);

    let err = a.accumulate(&tensor!([1.0, 1.0]).to_accelerator(0)).unwrap_err();
    assert!(matches!(
        err,
        Error::DeviceMismatch {
            expected: Device::Host,
            found: Device::Accelerator(0)
        }
    ));
    assert!(matches!(a.accumulate(&tensor!([1.0])), Err(Error::Shape(_))));
    assert_eq!(a.data(), &[3.0, 4.0]);
}

#[test]
fn test_with_grad_lifecycle() {
    let mut p = WithGrad::new(tensor!([[1.0, 2.0], [3.0, 4.0]]));
    assert_eq!(p.grad, Tensor::zeros(vec![2, 2]));

    p.accumulate_grad(&tensor!([[1.0, 1.0], [1.0, 1.0]])).unwrap();
    p.accumulate_grad(&tensor!([[0.5, 0.5], [0.5, 0.5]])).unwrap();
    assert_eq!(p.grad.data(), &[1.5; 4]);

    p.move_to(Device::Accelerator(0));
    assert_eq!(p.device(), Device::Accelerator(0));
    assert_eq!(p.grad.device(), Device::Accelerator(0));
    assert!(p.accumulate_grad(&Tensor::zeros(vec![2, 2])).is_err());

    p.zero_grad();
    assert!(p.grad.data().iter().all(|&g| g == 0.0));
    assert_eq!(p.value.data(), &[1.0, 2.0, 3.0, 4.0]);
}
