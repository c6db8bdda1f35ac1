//! Built-in node kinds.
//!
//! - [`ErrorFunction`]: fails whenever it is run.
//! - [`DelayedError`]: identity forward whose backward fails.
//! - [`GraphRoot`]: zero-input node that emits the seed gradients of a pass.
//! - [`AccumulateGrad`]: sink that sums gradients into a leaf variable.
//! - [`BackwardFn`]: wraps a closure as a named backward function.

use super::builder;
use super::node::{Function, GradList, Node};
use super::variable::{AutogradMeta, Variable};
use crate::error::{GraphError, Result};
use crate::tensor::GradValue;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::Weak;

/// Node that raises `GraphError::Unsupported` with a fixed message.
///
/// Stands in for the backward of operations that have none.
#[derive(Debug, Clone)]
pub struct ErrorFunction {
    msg: String,
}

impl ErrorFunction {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into() }
    }

    pub fn message(&self) -> &str {
        &self.msg
    }
}

impl<T: GradValue> Function<T> for ErrorFunction {
    fn apply(&self, _node: &Node<T>, _grads: GradList<T>) -> Result<GradList<T>> {
        Err(GraphError::Unsupported(self.msg.clone()))
    }
}

/// Like [`ErrorFunction`], but inserted behind an identity forward so that
/// an operation can be used once and fail only when differentiated.
#[derive(Debug, Clone)]
pub struct DelayedError {
    msg: String,
}

impl DelayedError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into() }
    }
}

impl<T: GradValue> Function<T> for DelayedError {
    fn apply(&self, _node: &Node<T>, _grads: GradList<T>) -> Result<GradList<T>> {
        Err(GraphError::Unsupported(self.msg.clone()))
    }
}

/// Pass `input` through unchanged, so that backward through the result fails
/// with `msg`.
///
/// The result is always a new variable. Without recording it shares the
/// value but not the graph binding of `input`.
pub fn delayed_error<T: GradValue>(
    msg: impl Into<String>,
    input: &Variable<T>,
) -> Result<Variable<T>> {
    if !builder::should_record(&[input]) {
        return Ok(input.detach());
    }
    let mut outputs = builder::record(
        DelayedError::new(msg),
        &[input],
        vec![input.value().clone()],
    )?;
    outputs
        .pop()
        .ok_or_else(|| GraphError::Internal("delayed_error produced no output".into()))
}

/// Zero-input node emitting the seed gradients of a backward pass.
#[derive(Debug, Clone)]
pub struct GraphRoot<T: GradValue> {
    outputs: Vec<T>,
}

impl<T: GradValue> GraphRoot<T> {
    pub fn new(outputs: Vec<T>) -> Self {
        Self { outputs }
    }
}

impl<T: GradValue> Function<T> for GraphRoot<T> {
    fn apply(&self, _node: &Node<T>, _grads: GradList<T>) -> Result<GradList<T>> {
        Ok(self.outputs.iter().cloned().map(Some).collect())
    }
}

/// Gradient sink of a leaf variable.
///
/// One input slot, no outputs. Incoming gradients are added to the leaf's
/// stored gradient. If the leaf is gone the gradient is dropped.
pub struct AccumulateGrad<T: GradValue> {
    meta: Weak<Mutex<AutogradMeta<T>>>,
}

impl<T: GradValue> AccumulateGrad<T> {
    pub(crate) fn new(meta: Weak<Mutex<AutogradMeta<T>>>) -> Self {
        Self { meta }
    }
}

impl<T: GradValue> Function<T> for AccumulateGrad<T> {
    fn apply(&self, _node: &Node<T>, grads: GradList<T>) -> Result<GradList<T>> {
        let Some(Some(incoming)) = grads.into_iter().next() else {
            return Ok(Vec::new());
        };
        let Some(meta) = self.meta.upgrade() else {
            return Ok(Vec::new());
        };
        let mut meta = meta.lock();
        let updated = match &meta.grad {
            Some(existing) => existing.add(&incoming)?,
            None => incoming,
        };
        meta.grad = Some(updated);
        Ok(Vec::new())
    }

    fn name(&self) -> String {
        "AccumulateGrad".to_string()
    }
}

/// A named backward function built from a closure.
pub struct BackwardFn<T, F> {
    name: String,
    f: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> BackwardFn<T, F>
where
    T: GradValue,
    F: Fn(GradList<T>) -> Result<GradList<T>> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
            _marker: PhantomData,
        }
    }
}

impl<T, F> Function<T> for BackwardFn<T, F>
where
    T: GradValue,
    F: Fn(GradList<T>) -> Result<GradList<T>> + Send + Sync,
{
    fn apply(&self, _node: &Node<T>, grads: GradList<T>) -> Result<GradList<T>> {
        (self.f)(grads)
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
