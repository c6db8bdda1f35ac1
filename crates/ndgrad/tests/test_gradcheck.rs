//! Numerical gradient checks for the bundled operations.

use approx::assert_relative_eq;
use ndgrad::autograd::{BackwardOptions, Engine, Variable};
use ndgrad::ops::{add, duplicate, mul, neg, reentrant_square, scale, square, sum};
use ndgrad::{DenseTensor, Result};

/// Compute numerical gradient using central difference.
///
/// grad_i ≈ (f(x + eps*e_i) - f(x - eps*e_i)) / (2*eps)
fn numerical_gradient<F>(f: F, x: &[f64], eps: f64) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64,
{
    let mut grad = vec![0.0; x.len()];
    let mut x_plus = x.to_vec();
    let mut x_minus = x.to_vec();

    for i in 0..x.len() {
        x_plus[i] = x[i] + eps;
        x_minus[i] = x[i] - eps;
        grad[i] = (f(&x_plus) - f(&x_minus)) / (2.0 * eps);
        x_plus[i] = x[i];
        x_minus[i] = x[i];
    }
    grad
}

type Var = Variable<DenseTensor>;

/// loss(x, w) = sum(w * x^2 - 3x + dup(x).0 * dup(x).1 + reentrant_square(x))
fn loss(x: &Var, w: &Var) -> Result<Var> {
    let quad = mul(w, &square(x)?)?;
    let lin = neg(&scale(x, 3.0)?)?;
    let (p, q) = duplicate(x)?;
    let cross = mul(&p, &q)?;
    let nested = reentrant_square(x)?;
    sum(&add(&add(&add(&quad, &lin)?, &cross)?, &nested)?)
}

fn loss_value(x: &[f64], w: &[f64]) -> f64 {
    let len = x.len();
    let x = Variable::new(DenseTensor::from_vec(x.to_vec(), &[len]).unwrap());
    let w = Variable::new(DenseTensor::from_vec(w.to_vec(), &[len]).unwrap());
    loss(&x, &w).unwrap().value().data()[0]
}

#[test]
fn test_numerical_gradient_composite() {
    let eps = 1e-5;
    let x_data = vec![0.5, -1.25, 2.0];
    let w_data = vec![1.5, 0.25, -0.75];

    let x = Variable::leaf(DenseTensor::from_vec(x_data.clone(), &[3]).unwrap(), true);
    let w = Variable::leaf(DenseTensor::from_vec(w_data.clone(), &[3]).unwrap(), true);
    loss(&x, &w).unwrap().backward().unwrap();

    let num_x = numerical_gradient(|v| loss_value(v, &w_data), &x_data, eps);
    let num_w = numerical_gradient(|v| loss_value(&x_data, v), &w_data, eps);

    let grad_x = x.grad().unwrap();
    let grad_w = w.grad().unwrap();
    for i in 0..3 {
        assert_relative_eq!(grad_x.data()[i], num_x[i], epsilon = 1e-6);
        assert_relative_eq!(grad_w.data()[i], num_w[i], epsilon = 1e-6);
    }
}

#[test]
fn test_grad_matches_backward() {
    let x = Variable::leaf(DenseTensor::from_vec(vec![1.0, 2.0], &[2]).unwrap(), true);
    let w = Variable::leaf(DenseTensor::from_vec(vec![0.5, -1.0], &[2]).unwrap(), true);
    let out = loss(&x, &w).unwrap();
    let engine = Engine::default();

    let captured = engine
        .grad(
            &[(&out, DenseTensor::scalar(1.0))],
            &[&x, &w],
            BackwardOptions::default().with_keep_graph(true),
        )
        .unwrap();
    assert!(x.grad().is_none());

    engine
        .backward(&[(&out, DenseTensor::scalar(1.0))])
        .unwrap();
    for (capture, leaf) in captured.iter().zip([&x, &w]) {
        let capture = capture.as_ref().unwrap();
        let accumulated = leaf.grad().unwrap();
        for (c, a) in capture.data().iter().zip(accumulated.data()) {
            assert_relative_eq!(*c, *a, epsilon = 1e-12);
        }
    }
}
