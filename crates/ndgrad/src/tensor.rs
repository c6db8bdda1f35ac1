//! Tensor value interface consumed by the backward engine.
//!
//! The engine never looks inside a gradient: it needs a shape to validate
//! slots against, an addition to sum contributions that target the same slot,
//! and a way to build the implicit `1` seed for scalar roots. "No gradient" is
//! represented by `Option::None`, never by a materialized zero.
//!
//! [`DenseTensor`] is a small row-major `f64` implementation used by the
//! bundled operations and the tests.

use crate::error::{GraphError, Result};
use std::fmt::Debug;

/// Value type that can flow along the edges of the backward graph.
pub trait GradValue: Clone + Debug + Send + Sync + 'static {
    /// Shape of the value. Scalars have an empty shape.
    fn shape(&self) -> &[usize];

    /// Sum of two gradients of the same shape.
    fn add(&self, other: &Self) -> Result<Self>;

    /// A value of the same shape filled with ones.
    fn ones_like(&self) -> Self;

    /// Number of elements.
    fn numel(&self) -> usize {
        self.shape().iter().product()
    }
}

impl GradValue for f64 {
    fn shape(&self) -> &[usize] {
        &[]
    }

    fn add(&self, other: &Self) -> Result<Self> {
        Ok(self + other)
    }

    fn ones_like(&self) -> Self {
        1.0
    }
}

/// Dense row-major tensor of `f64`.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor {
    data: Vec<f64>,
    shape: Vec<usize>,
}

impl DenseTensor {
    /// Create a tensor from data and shape.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::ShapeMismatch` if the data length does not match
    /// the product of the shape.
    pub fn from_vec(data: Vec<f64>, shape: &[usize]) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(GraphError::ShapeMismatch {
                expected: shape.to_vec(),
                actual: vec![data.len()],
            });
        }
        Ok(Self {
            data,
            shape: shape.to_vec(),
        })
    }

    /// Zero-dimensional tensor holding one value.
    pub fn scalar(value: f64) -> Self {
        Self {
            data: vec![value],
            shape: Vec::new(),
        }
    }

    /// Tensor filled with `value`.
    pub fn full(shape: &[usize], value: f64) -> Self {
        Self {
            data: vec![value; shape.iter().product()],
            shape: shape.to_vec(),
        }
    }

    /// Tensor filled with zeros.
    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    /// Tensor filled with ones.
    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0)
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Value at a linear (row-major) index.
    pub fn get_linear(&self, index: usize) -> Option<f64> {
        self.data.get(index).copied()
    }

    /// Sum of all elements.
    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// Apply `f` to every element.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            data: self.data.iter().map(|&x| f(x)).collect(),
            shape: self.shape.clone(),
        }
    }

    /// Combine two tensors of identical shape element by element.
    pub fn zip_map(&self, other: &Self, f: impl Fn(f64, f64) -> f64) -> Result<Self> {
        if self.shape != other.shape {
            return Err(GraphError::ShapeMismatch {
                expected: self.shape.clone(),
                actual: other.shape.clone(),
            });
        }
        Ok(Self {
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(&a, &b)| f(a, b))
                .collect(),
            shape: self.shape.clone(),
        })
    }
}

impl GradValue for DenseTensor {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn add(&self, other: &Self) -> Result<Self> {
        self.zip_map(other, |a, b| a + b)
    }

    fn ones_like(&self) -> Self {
        Self::ones(&self.shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_checks_length() {
        assert!(DenseTensor::from_vec(vec![1.0, 2.0, 3.0], &[3]).is_ok());
        let err = DenseTensor::from_vec(vec![1.0, 2.0], &[3]).unwrap_err();
        assert!(matches!(err, GraphError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_scalar_has_empty_shape() {
        let s = DenseTensor::scalar(2.5);
        assert!(s.shape().is_empty());
        assert_eq!(s.len(), 1);
        assert_eq!(GradValue::numel(&s), 1);
        assert_eq!(s.get_linear(0), Some(2.5));
    }

    #[test]
    fn test_add_rejects_shape_mismatch() {
        let a = DenseTensor::ones(&[2]);
        let b = DenseTensor::ones(&[3]);
        assert!(GradValue::add(&a, &b).is_err());

        let c = GradValue::add(&a, &DenseTensor::full(&[2], 2.0)).unwrap();
        assert_eq!(c.data(), &[3.0, 3.0]);
    }

    #[test]
    fn test_f64_grad_value() {
        assert_eq!(GradValue::add(&1.5_f64, &2.0).unwrap(), 3.5);
        assert_eq!(2.0_f64.ones_like(), 1.0);
        assert!(GradValue::shape(&3.0_f64).is_empty());
    }
}
