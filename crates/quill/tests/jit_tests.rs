use std::sync::Arc;

use quill::prelude::*;

fn matmul_fn(xs: &[Array], _statics: &[StaticArg]) -> Result<Array> {
    xs[0].matmul(&xs[1])
}

#[test]
fn same_signature_builds_once() {
    let compiled = compile(matmul_fn);
    let a = Array::ones((2, 3), DType::F32);
    let b = Array::ones((3, 4), DType::F32);
    compiled.call(&[a.clone(), b.clone()], &[]).unwrap();
    compiled.call(&[a, b], &[]).unwrap();
    let stats = compiled.stats();
    assert_eq!(stats.builds, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
}

#[test]
fn new_shape_is_a_miss() {
    let compiled = compile(matmul_fn);
    let a = Array::ones((2, 3), DType::F32);
    let b = Array::ones((3, 4), DType::F32);
    compiled.call(&[a.clone(), b], &[]).unwrap();
    let b2 = Array::ones((3, 5), DType::F32);
    compiled.call(&[a, b2], &[]).unwrap();
    let stats = compiled.stats();
    assert_eq!(stats.builds, 2);
    assert_eq!(stats.misses, 2);
}

#[test]
fn compiled_result_matches_eager() {
    let compiled = compile(matmul_fn);
    let a = Array::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F64).unwrap();
    let b = Array::from_f64_slice(&[5.0, 6.0, 7.0, 8.0], (2, 2), DType::F64).unwrap();
    let compiled_out = compiled.call(&[a.clone(), b.clone()], &[]).unwrap();
    let eager_out = a.matmul(&b).unwrap();
    assert_eq!(
        compiled_out.to_f64_vec().unwrap(),
        eager_out.to_f64_vec().unwrap()
    );
}

#[test]
fn static_argument_change_is_a_miss() {
    // The static argument selects the exponent; its value is part of the
    // signature, so each value traces once.
    let f = |xs: &[Array], statics: &[StaticArg]| {
        let e = match statics[0] {
            StaticArg::Int(e) => e as f64,
            StaticArg::Bool(_) => 1.0,
        };
        xs[0].powf(e)
    };
    let compiled = compile(f);
    let x = Array::full((), 3.0, DType::F64);
    let squared = compiled.call(&[x.clone()], &[StaticArg::Int(2)]).unwrap();
    assert_eq!(squared.to_scalar().unwrap(), 9.0);
    let cubed = compiled.call(&[x.clone()], &[StaticArg::Int(3)]).unwrap();
    assert_eq!(cubed.to_scalar().unwrap(), 27.0);
    assert_eq!(compiled.stats().builds, 2);

    // Repeating a seen static value replays its plan.
    compiled.call(&[x], &[StaticArg::Int(2)]).unwrap();
    assert_eq!(compiled.stats().builds, 2);
    assert_eq!(compiled.stats().hits, 1);
}

#[test]
fn host_branch_on_traced_value_fails_with_remedy() {
    let f = |xs: &[Array], _: &[StaticArg]| {
        // Host-level control flow on an array value: unrepresentable in
        // a trace.
        if xs[0].sum_all()?.to_scalar()? > 0.0 {
            xs[0].affine(2.0, 0.0)
        } else {
            Ok(xs[0].clone())
        }
    };
    let compiled = compile(f);
    let x = Array::ones(3, DType::F64);
    let err = compiled.call(&[x], &[]).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("trace"), "unexpected message: {msg}");
    assert!(msg.contains("static"), "unexpected message: {msg}");
}

#[test]
fn trace_failure_names_the_offending_argument() {
    // The branch reads xs[1]; the error should point at argument 1.
    let f = |xs: &[Array], _: &[StaticArg]| {
        let _ = xs[1].sum_all()?.to_scalar()?;
        xs[0].sum_all()
    };
    let compiled = compile(f);
    let a = Array::ones(2, DType::F64);
    let b = Array::ones(3, DType::F64);
    let msg = compiled.call(&[a, b], &[]).unwrap_err().to_string();
    assert!(msg.contains("argument 1"), "unexpected message: {msg}");
}

#[test]
fn failed_build_is_cached_and_propagated() {
    let f = |xs: &[Array], _: &[StaticArg]| {
        let _ = xs[0].sum_all()?.to_scalar()?;
        Ok(xs[0].clone())
    };
    let compiled = compile(f);
    let x = Array::ones(2, DType::F64);
    assert!(compiled.call(&[x.clone()], &[]).is_err());
    // Second call is served from the failure cache, not retraced.
    assert!(compiled.call(&[x], &[]).is_err());
    let stats = compiled.stats();
    assert_eq!(stats.builds, 0);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
}

#[test]
fn concurrent_same_signature_builds_once() {
    let compiled = Arc::new(compile(matmul_fn));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let compiled = Arc::clone(&compiled);
        handles.push(std::thread::spawn(move || {
            let a = Array::ones((4, 4), DType::F32);
            let b = Array::ones((4, 4), DType::F32);
            compiled.call(&[a, b], &[]).unwrap()
        }));
    }
    for h in handles {
        let out = h.join().unwrap();
        assert_eq!(out.to_f64_vec().unwrap(), vec![4.0; 16]);
    }
    assert_eq!(compiled.stats().builds, 1);
}

#[test]
fn captured_constant_participates_in_plan() {
    let bias = Array::from_f64_slice(&[1.0, 2.0], 2, DType::F64).unwrap();
    let compiled = compile(move |xs: &[Array], _: &[StaticArg]| xs[0].add(&bias));
    let x = Array::zeros(2, DType::F64);
    let first = compiled.call(&[x.clone()], &[]).unwrap();
    let second = compiled.call(&[x], &[]).unwrap();
    assert_eq!(first.to_f64_vec().unwrap(), vec![1.0, 2.0]);
    assert_eq!(second.to_f64_vec().unwrap(), vec![1.0, 2.0]);
    assert_eq!(compiled.stats().builds, 1);
}

#[test]
fn plan_replays_update_and_reductions() {
    let f = |xs: &[Array], _: &[StaticArg]| {
        let patched = xs[0].update(
            &Index::Slice {
                dim: 0,
                start: 0,
                len: 1,
            },
            &xs[1],
        )?;
        patched.sum(&[0], false)
    };
    let compiled = compile(f);
    let x = Array::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F64).unwrap();
    let v = Array::from_f64_slice(&[10.0, 20.0], (1, 2), DType::F64).unwrap();
    let out = compiled.call(&[x.clone(), v.clone()], &[]).unwrap();
    assert_eq!(out.to_f64_vec().unwrap(), vec![13.0, 24.0]);
    // Replay with different values, same signature.
    let x2 = Array::zeros((2, 2), DType::F64);
    let out2 = compiled.call(&[x2, v], &[]).unwrap();
    assert_eq!(out2.to_f64_vec().unwrap(), vec![10.0, 20.0]);
    assert_eq!(compiled.stats().builds, 1);
}
