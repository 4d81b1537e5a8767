use quill::prelude::*;
use quill::value_and_gradient;

fn assert_close(a: f64, b: f64, tol: f64) {
    assert!((a - b).abs() <= tol, "expected {b}, got {a} (tol {tol})");
}

fn scalar(v: f64) -> Array {
    Array::full((), v, DType::F64)
}

#[test]
fn square_gradient_is_two_x() {
    let f = |xs: &[Array]| xs[0].square()?.sum_all();
    let df = gradient(f, &[0]);
    let grads = df(&[scalar(3.0)]).unwrap();
    assert_eq!(grads[0].to_scalar().unwrap(), 6.0);
}

#[test]
fn polynomial_partial_derivatives() {
    // h(x, y) = x^2 + 3xy + y^2 at (2, 1): dh/dx = 7, dh/dy = 8.
    let h = |xs: &[Array]| {
        let (x, y) = (&xs[0], &xs[1]);
        x.square()?
            .add(&x.mul(y)?.affine(3.0, 0.0)?)?
            .add(&y.square()?)
    };
    let dh = gradient(h, &[0, 1]);
    let grads = dh(&[scalar(2.0), scalar(1.0)]).unwrap();
    assert_eq!(grads[0].to_scalar().unwrap(), 7.0);
    assert_eq!(grads[1].to_scalar().unwrap(), 8.0);
}

#[test]
fn gradient_matches_finite_differences() {
    let f = |xs: &[Array]| {
        let x = &xs[0];
        x.sin()?.mul(&x.exp()?)?.add(&x.square()?)?.sum_all()
    };
    let x0 = 0.7;
    let grads = gradient(f, &[0])(&[scalar(x0)]).unwrap();
    let analytic = grads[0].to_scalar().unwrap();

    let h = 1e-6;
    let at = |v: f64| f(&[scalar(v)]).unwrap().to_scalar().unwrap();
    let numeric = (at(x0 + h) - at(x0 - h)) / (2.0 * h);
    assert_close(analytic, numeric, 1e-4);
}

#[test]
fn value_and_gradient_shares_one_pass() {
    let f = |xs: &[Array]| xs[0].square()?.sum_all();
    let vdf = value_and_gradient(f, &[0]);
    let (value, grads) = vdf(&[scalar(4.0)]).unwrap();
    assert_eq!(value.to_scalar().unwrap(), 16.0);
    assert_eq!(grads[0].to_scalar().unwrap(), 8.0);
}

#[test]
fn second_derivative_of_cube() {
    // d^2/dx^2 x^3 = 6x: differentiating the gradient closure re-traces
    // its recorded backward expressions.
    let f = |xs: &[Array]| xs[0].powf(3.0)?.sum_all();
    let ddf = gradient(
        move |xs: &[Array]| {
            let grads = gradient(f, &[0])(xs)?;
            Ok(grads[0].clone())
        },
        &[0],
    );
    let grads = ddf(&[scalar(2.0)]).unwrap();
    assert_close(grads[0].to_scalar().unwrap(), 12.0, 1e-9);
}

#[test]
fn gradient_through_functional_update() {
    // y = sum(update(x, slice, v) * w): the overwritten region's weight
    // flows to v, the rest to x.
    let f = |xs: &[Array]| {
        let updated = xs[0].update(
            &Index::Slice {
                dim: 0,
                start: 0,
                len: 1,
            },
            &xs[1],
        )?;
        updated.sum_all()
    };
    let x = Array::from_f64_slice(&[1.0, 2.0, 3.0], 3, DType::F64).unwrap();
    let v = Array::full(1, 9.0, DType::F64);
    let grads = gradient(f, &[0, 1])(&[x, v]).unwrap();
    assert_eq!(grads[0].to_f64_vec().unwrap(), vec![0.0, 1.0, 1.0]);
    assert_eq!(grads[1].to_f64_vec().unwrap(), vec![1.0]);
}

#[test]
fn aliased_input_reported_at_every_position() {
    // The same array passed at two requested positions: both entries get
    // the full accumulated gradient, whatever the argnum order.
    let f = |xs: &[Array]| xs[0].mul(&xs[1])?.sum_all();
    let x = scalar(3.0);
    let grads = gradient(f, &[0, 1])(&[x.clone(), x.clone()]).unwrap();
    assert_eq!(grads[0].to_scalar().unwrap(), 6.0);
    assert_eq!(grads[1].to_scalar().unwrap(), 6.0);
    let reversed = gradient(f, &[1, 0])(&[x.clone(), x]).unwrap();
    assert_eq!(reversed[0].to_scalar().unwrap(), 6.0);
    assert_eq!(reversed[1].to_scalar().unwrap(), 6.0);
}

#[test]
fn unused_input_gets_zero_gradient() {
    let f = |xs: &[Array]| xs[0].sum_all();
    let grads = gradient(f, &[0, 1])(&[scalar(1.0), Array::ones(3, DType::F64)]).unwrap();
    assert_eq!(grads[1].to_f64_vec().unwrap(), vec![0.0; 3]);
}

#[test]
fn argnum_out_of_range_fails() {
    let f = |xs: &[Array]| xs[0].sum_all();
    assert!(gradient(f, &[1])(&[scalar(1.0)]).is_err());
}

#[test]
fn non_scalar_output_rejected() {
    let f = |xs: &[Array]| xs[0].square();
    let err = gradient(f, &[0])(&[Array::ones(3, DType::F64)]).unwrap_err();
    assert!(matches!(err, Error::NotAScalar { .. }));
}

#[test]
fn gradient_through_where_cond() {
    // relu(x) = where(x > 0, x, 0); gradient is the positive mask.
    let f = |xs: &[Array]| {
        let x = &xs[0];
        let mask = x.gt(&x.zeros_like())?;
        mask.where_cond(x, &x.zeros_like())?.sum_all()
    };
    let x = Array::from_f64_slice(&[-1.0, 2.0, -3.0, 4.0], 4, DType::F64).unwrap();
    let grads = gradient(f, &[0])(&[x]).unwrap();
    assert_eq!(
        grads[0].to_f64_vec().unwrap(),
        vec![0.0, 1.0, 0.0, 1.0]
    );
}

#[test]
fn gradient_through_matmul_chain() {
    // loss = mean((x @ w)^2); checked against finite differences on w.
    let x = Array::from_f64_slice(&[1.0, -2.0, 0.5, 3.0], (2, 2), DType::F64).unwrap();
    let f = move |xs: &[Array]| x.matmul(&xs[0])?.square()?.mean_all();
    let w0 = Array::from_f64_slice(&[0.3, -0.1, 0.7, 0.2], (2, 2), DType::F64).unwrap();
    let grads = gradient(&f, &[0])(&[w0.clone()]).unwrap();
    let analytic = grads[0].to_f64_vec().unwrap();

    let h = 1e-6;
    let base = w0.to_f64_vec().unwrap();
    for i in 0..4 {
        let mut plus = base.clone();
        let mut minus = base.clone();
        plus[i] += h;
        minus[i] -= h;
        let at = |vals: &[f64]| {
            let w = Array::from_f64_slice(vals, (2, 2), DType::F64).unwrap();
            f(&[w]).unwrap().to_scalar().unwrap()
        };
        let numeric = (at(&plus) - at(&minus)) / (2.0 * h);
        assert_close(analytic[i], numeric, 1e-4);
    }
}
