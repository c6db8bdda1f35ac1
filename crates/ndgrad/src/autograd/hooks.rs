//! Pre- and post-execution hooks on graph nodes.
//!
//! Hooks run in registration order. A pre-hook sees the gradients about to be
//! handed to a node and may replace them; a post-hook sees what the node
//! produced (and what it was given) and may replace the result. Neither may
//! change the number of gradients, and an error from either aborts the pass.

use super::node::GradList;
use crate::error::Result;
use crate::tensor::GradValue;

/// Runs before a node's backward computation.
pub trait FunctionPreHook<T: GradValue>: Send + Sync {
    fn call(&self, grads: GradList<T>) -> Result<GradList<T>>;
}

/// Runs after a node's backward computation.
pub trait FunctionPostHook<T: GradValue>: Send + Sync {
    fn call(&self, outputs: GradList<T>, inputs: &[Option<T>]) -> Result<GradList<T>>;
}

impl<T, F> FunctionPreHook<T> for F
where
    T: GradValue,
    F: Fn(GradList<T>) -> Result<GradList<T>> + Send + Sync,
{
    fn call(&self, grads: GradList<T>) -> Result<GradList<T>> {
        self(grads)
    }
}

impl<T, F> FunctionPostHook<T> for F
where
    T: GradValue,
    F: Fn(GradList<T>, &[Option<T>]) -> Result<GradList<T>> + Send + Sync,
{
    fn call(&self, outputs: GradList<T>, inputs: &[Option<T>]) -> Result<GradList<T>> {
        self(outputs, inputs)
    }
}

/// Pre-hook that rewrites the gradient of a single input slot.
///
/// Installed by [`Variable::register_hook`](super::Variable::register_hook).
/// Slots without a gradient are left untouched.
pub struct SlotHook<F> {
    slot: usize,
    f: F,
}

impl<F> SlotHook<F> {
    pub fn new(slot: usize, f: F) -> Self {
        Self { slot, f }
    }
}

impl<T, F> FunctionPreHook<T> for SlotHook<F>
where
    T: GradValue,
    F: Fn(&T) -> Result<T> + Send + Sync,
{
    fn call(&self, mut grads: GradList<T>) -> Result<GradList<T>> {
        if let Some(Some(grad)) = grads.get(self.slot) {
            let replaced = (self.f)(grad)?;
            grads[self.slot] = Some(replaced);
        }
        Ok(grads)
    }
}
