//! Elementwise differentiable operations on [`DenseTensor`].

use crate::autograd::{Function, GradList, Node, SavedTensor, Variable, record};
use crate::error::{GraphError, Result};
use crate::tensor::DenseTensor;

type Var = Variable<DenseTensor>;
type Grads = GradList<DenseTensor>;

fn single(mut outputs: Vec<Var>) -> Result<Var> {
    outputs
        .pop()
        .ok_or_else(|| GraphError::Internal("operation recorded no output".into()))
}

fn first(grads: Grads) -> Option<DenseTensor> {
    grads.into_iter().next().flatten()
}

/// Backward function for `a + b`.
#[derive(Debug)]
pub struct AddBackward;

impl Function<DenseTensor> for AddBackward {
    fn apply(&self, node: &Node<DenseTensor>, grads: Grads) -> Result<Grads> {
        let grad = first(grads);
        Ok((0..2)
            .map(|i| {
                if node.should_compute_output(i) {
                    grad.clone()
                } else {
                    None
                }
            })
            .collect())
    }
}

/// Elementwise sum.
pub fn add(a: &Var, b: &Var) -> Result<Var> {
    let value = a.value().zip_map(b.value(), |x, y| x + y)?;
    single(record(AddBackward, &[a, b], vec![value])?)
}

/// Backward function for `a * b`.
#[derive(Debug)]
pub struct MulBackward {
    /// Saved input a.
    lhs: SavedTensor<DenseTensor>,
    /// Saved input b.
    rhs: SavedTensor<DenseTensor>,
}

impl Function<DenseTensor> for MulBackward {
    fn apply(&self, node: &Node<DenseTensor>, grads: Grads) -> Result<Grads> {
        let Some(grad) = first(grads) else {
            return Ok(vec![None, None]);
        };
        let grad_lhs = if node.should_compute_output(0) {
            let rhs = self.rhs.get("MulBackward")?;
            Some(grad.zip_map(&rhs, |g, y| g * y)?)
        } else {
            None
        };
        let grad_rhs = if node.should_compute_output(1) {
            let lhs = self.lhs.get("MulBackward")?;
            Some(grad.zip_map(&lhs, |g, x| g * x)?)
        } else {
            None
        };
        Ok(vec![grad_lhs, grad_rhs])
    }

    fn release_variables(&self) {
        self.lhs.release();
        self.rhs.release();
    }
}

/// Elementwise product.
pub fn mul(a: &Var, b: &Var) -> Result<Var> {
    let value = a.value().zip_map(b.value(), |x, y| x * y)?;
    let backward = MulBackward {
        lhs: SavedTensor::new(a.value_arc()),
        rhs: SavedTensor::new(b.value_arc()),
    };
    single(record(backward, &[a, b], vec![value])?)
}

/// Backward function for `x * x`.
#[derive(Debug)]
pub struct SquareBackward {
    input: SavedTensor<DenseTensor>,
}

impl Function<DenseTensor> for SquareBackward {
    fn apply(&self, _node: &Node<DenseTensor>, grads: Grads) -> Result<Grads> {
        let Some(grad) = first(grads) else {
            return Ok(vec![None]);
        };
        let input = self.input.get("SquareBackward")?;
        Ok(vec![Some(grad.zip_map(&input, |g, x| 2.0 * x * g)?)])
    }

    fn release_variables(&self) {
        self.input.release();
    }
}

pub fn square(x: &Var) -> Result<Var> {
    let value = x.value().map(|v| v * v);
    let backward = SquareBackward {
        input: SavedTensor::new(x.value_arc()),
    };
    single(record(backward, &[x], vec![value])?)
}

/// Backward function for multiplication by a constant.
#[derive(Debug)]
pub struct ScaleBackward {
    factor: f64,
}

impl Function<DenseTensor> for ScaleBackward {
    fn apply(&self, _node: &Node<DenseTensor>, grads: Grads) -> Result<Grads> {
        Ok(vec![first(grads).map(|g| g.map(|v| v * self.factor))])
    }
}

pub fn scale(x: &Var, factor: f64) -> Result<Var> {
    let value = x.value().map(|v| v * factor);
    single(record(ScaleBackward { factor }, &[x], vec![value])?)
}

pub fn neg(x: &Var) -> Result<Var> {
    scale(x, -1.0)
}

/// Backward function for the identity.
#[derive(Debug)]
pub struct IdentityBackward;

impl Function<DenseTensor> for IdentityBackward {
    fn apply(&self, _node: &Node<DenseTensor>, grads: Grads) -> Result<Grads> {
        Ok(vec![first(grads)])
    }
}

pub fn identity(x: &Var) -> Result<Var> {
    single(record(IdentityBackward, &[x], vec![x.value().clone()])?)
}

/// Backward function for the sum of all elements.
#[derive(Debug)]
pub struct SumBackward {
    shape: Vec<usize>,
}

impl Function<DenseTensor> for SumBackward {
    fn apply(&self, _node: &Node<DenseTensor>, grads: Grads) -> Result<Grads> {
        Ok(vec![first(grads).map(|g| DenseTensor::full(&self.shape, g.sum()))])
    }
}

/// Sum of all elements as a scalar tensor.
pub fn sum(x: &Var) -> Result<Var> {
    let value = DenseTensor::scalar(x.value().sum());
    let backward = SumBackward {
        shape: x.shape().to_vec(),
    };
    single(record(backward, &[x], vec![value])?)
}

/// Backward function for [`duplicate`]: two input slots, one output.
#[derive(Debug)]
pub struct DuplicateBackward;

impl Function<DenseTensor> for DuplicateBackward {
    fn apply(&self, _node: &Node<DenseTensor>, grads: Grads) -> Result<Grads> {
        let mut total: Option<DenseTensor> = None;
        for grad in grads.into_iter().flatten() {
            total = Some(match total {
                Some(acc) => acc.zip_map(&grad, |a, b| a + b)?,
                None => grad,
            });
        }
        Ok(vec![total])
    }
}

/// Two outputs equal to `x`, produced by one node with two input slots.
pub fn duplicate(x: &Var) -> Result<(Var, Var)> {
    let value = x.value().clone();
    let mut outputs = record(DuplicateBackward, &[x], vec![value.clone(), value])?;
    let second = single(outputs.split_off(1))?;
    let first = single(outputs)?;
    Ok((first, second))
}
