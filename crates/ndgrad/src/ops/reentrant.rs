//! Operations whose backward runs a nested backward pass.

use super::elementwise::square;
use crate::autograd::{
    BackwardOptions, Engine, Function, GradList, GradModeGuard, Node, SavedTensor, Variable,
    record,
};
use crate::error::{GraphError, Result};
use crate::tensor::DenseTensor;

/// Backward of [`reentrant_square`]: rebuilds `x * x` from the saved input
/// with recording on and differentiates it with a nested pass.
#[derive(Debug)]
pub struct ReentrantSquareBackward {
    input: SavedTensor<DenseTensor>,
}

impl Function<DenseTensor> for ReentrantSquareBackward {
    fn apply(
        &self,
        node: &Node<DenseTensor>,
        grads: GradList<DenseTensor>,
    ) -> Result<GradList<DenseTensor>> {
        let Some(grad) = grads.into_iter().next().flatten() else {
            return Ok(vec![None]);
        };
        if !node.should_compute_output(0) {
            return Ok(vec![None]);
        }
        let input = self.input.get("ReentrantSquareBackward")?;

        let _grad_mode = GradModeGuard::new(true);
        let x = Variable::leaf(input.as_ref().clone(), true);
        let y = square(&x)?;
        let mut grads = Engine::default().grad(&[(&y, grad)], &[&x], BackwardOptions::default())?;
        Ok(vec![grads.pop().flatten()])
    }

    fn release_variables(&self) {
        self.input.release();
    }
}

/// `x * x`, differentiated through a nested backward pass.
pub fn reentrant_square(x: &Variable<DenseTensor>) -> Result<Variable<DenseTensor>> {
    let value = x.value().map(|v| v * v);
    let backward = ReentrantSquareBackward {
        input: SavedTensor::new(x.value_arc()),
    };
    record(backward, &[x], vec![value])?
        .pop()
        .ok_or_else(|| GraphError::Internal("reentrant_square recorded no output".into()))
}

/// Apply [`reentrant_square`] `depth` times.
pub fn nested_squares(x: &Variable<DenseTensor>, depth: usize) -> Result<Variable<DenseTensor>> {
    let mut current = x.clone();
    for _ in 0..depth {
        current = reentrant_square(&current)?;
    }
    Ok(current)
}
