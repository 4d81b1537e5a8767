use quill::prelude::*;

// This binary registers logical accelerators; the registry is
// process-wide, so availability checks that expect *no* accelerator
// live in a different test binary.

#[test]
fn transfer_is_asynchronous_and_reads_wait() {
    let accel = register_device(DeviceKind::Accel);
    let x = Array::from_f64_slice(&[1.0, 2.0, 3.0], 3, DType::F64).unwrap();
    let on_accel = x.place(accel).unwrap();
    assert_eq!(on_accel.device(), accel);
    // The read blocks until the transfer worker has materialized the
    // buffer; the values survive the trip.
    assert_eq!(on_accel.to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0]);
    assert!(on_accel.sync().is_ready());
}

#[test]
fn mixed_device_arithmetic_rejected() {
    let accel = register_device(DeviceKind::Accel);
    let a = Array::ones(2, DType::F64);
    let b = a.place(accel).unwrap();
    assert!(matches!(
        a.add(&b).unwrap_err(),
        Error::DeviceMismatch { .. }
    ));
    // Same device works.
    let c = a.place(accel).unwrap();
    assert_eq!(b.add(&c).unwrap().to_f64_vec().unwrap(), vec![2.0, 2.0]);
}

#[test]
fn gradient_flows_through_transfer() {
    let accel = register_device(DeviceKind::Accel);
    let f = move |xs: &[Array]| xs[0].place(accel)?.square()?.sum_all()?.place(Device::CPU);
    let x = Array::from_f64_slice(&[1.0, 2.0], 2, DType::F64).unwrap();
    let grads = gradient(f, &[0])(&[x]).unwrap();
    let g = &grads[0];
    assert_eq!(g.device(), Device::CPU);
    assert_eq!(g.to_f64_vec().unwrap(), vec![2.0, 4.0]);
}

#[test]
fn registry_enumerates_registered_devices() {
    let d0 = register_device(DeviceKind::Accel);
    let d1 = register_device(DeviceKind::Accel);
    let listed = devices(DeviceKind::Accel).unwrap();
    assert!(listed.contains(&d0));
    assert!(listed.contains(&d1));
    assert!(devices(DeviceKind::Cpu).unwrap().contains(&Device::CPU));
}
