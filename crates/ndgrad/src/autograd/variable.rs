//! Values tracked by the backward graph.
//!
//! A [`Variable`] pairs a value with its gradient-edge binding: the node and
//! input slot that should receive the gradient of this value when backward
//! runs. Variables produced by recorded operations are bound to the node the
//! operation created. Leaves have no binding; a leaf that requires gradients
//! routes them to an [`AccumulateGrad`] sink, which sums them into the leaf's
//! stored gradient.
//!
//! Cloning a `Variable` yields another handle to the same value and binding.

use super::edge::Edge;
use super::functions::AccumulateGrad;
use super::hooks::SlotHook;
use super::node::{Node, NodeRef};
use crate::error::{GraphError, Result};
use crate::tensor::GradValue;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Autograd state shared by all handles of one variable.
pub(crate) struct AutogradMeta<T: GradValue> {
    pub(crate) grad_edge: Option<Edge<T>>,
    pub(crate) requires_grad: bool,
    pub(crate) grad: Option<T>,
    pub(crate) grad_accumulator: Option<NodeRef<T>>,
}

/// A value together with its place in the backward graph.
pub struct Variable<T: GradValue> {
    value: Arc<T>,
    meta: Arc<Mutex<AutogradMeta<T>>>,
}

impl<T: GradValue> Variable<T> {
    /// Leaf that does not require gradients.
    pub fn new(value: T) -> Self {
        Self::leaf(value, false)
    }

    /// Leaf variable; with `requires_grad` its gradients are accumulated.
    pub fn leaf(value: T, requires_grad: bool) -> Self {
        Self::from_parts(Arc::new(value), None, requires_grad)
    }

    /// Variable whose gradient flows into `edge`.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::InvalidEdge` if the edge's slot does not exist on
    /// its node.
    pub fn from_edge(value: T, edge: Edge<T>) -> Result<Self> {
        edge.check_slot()?;
        let requires_grad = edge.is_valid();
        let edge = edge.is_valid().then_some(edge);
        Ok(Self::from_parts(Arc::new(value), edge, requires_grad))
    }

    fn from_parts(value: Arc<T>, grad_edge: Option<Edge<T>>, requires_grad: bool) -> Self {
        Self {
            value,
            meta: Arc::new(Mutex::new(AutogradMeta {
                grad_edge,
                requires_grad,
                grad: None,
                grad_accumulator: None,
            })),
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Shared handle to the value, for saving it in a backward function.
    pub fn value_arc(&self) -> Arc<T> {
        Arc::clone(&self.value)
    }

    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    pub fn requires_grad(&self) -> bool {
        let meta = self.meta.lock();
        meta.requires_grad || meta.grad_edge.is_some()
    }

    /// True if no recorded operation produced this variable.
    pub fn is_leaf(&self) -> bool {
        self.meta.lock().grad_edge.is_none()
    }

    /// Node that receives this variable's gradient, for non-leaves.
    pub fn grad_fn(&self) -> Option<NodeRef<T>> {
        self.meta
            .lock()
            .grad_edge
            .as_ref()
            .and_then(|edge| edge.function().cloned())
    }

    /// Slot of [`grad_fn`](Self::grad_fn) this variable feeds.
    pub fn output_nr(&self) -> u32 {
        self.meta
            .lock()
            .grad_edge
            .as_ref()
            .map_or(0, |edge| edge.input_nr())
    }

    /// Where this variable's gradient goes.
    ///
    /// The bound edge for non-leaves, slot 0 of the leaf's accumulator for
    /// leaves that require gradients, and an empty edge otherwise.
    pub fn gradient_edge(&self) -> Edge<T> {
        if let Some(edge) = self.meta.lock().grad_edge.clone() {
            return edge;
        }
        match self.grad_accumulator() {
            Some(node) => Edge::new(node, 0),
            None => Edge::empty(),
        }
    }

    /// The `AccumulateGrad` sink of a leaf that requires gradients.
    ///
    /// Created on first use; later calls return the same node.
    pub fn grad_accumulator(&self) -> Option<NodeRef<T>> {
        let mut meta = self.meta.lock();
        if meta.grad_edge.is_some() || !meta.requires_grad {
            return None;
        }
        if let Some(node) = &meta.grad_accumulator {
            return Some(Arc::clone(node));
        }
        let node = Node::sink(AccumulateGrad::new(Arc::downgrade(&self.meta)), 0);
        node.add_input_metadata(self.value.shape());
        meta.grad_accumulator = Some(Arc::clone(&node));
        Some(node)
    }

    /// Bind this variable to `edge`, replacing any previous binding.
    ///
    /// A binding to a slot the node does not have is rejected and leaves the
    /// previous binding in place.
    pub fn set_gradient_edge(&self, edge: Edge<T>) -> Result<()> {
        edge.check_slot()?;
        let mut meta = self.meta.lock();
        if edge.is_valid() {
            meta.grad_edge = Some(edge);
        } else {
            meta.grad_edge = None;
            meta.requires_grad = false;
        }
        Ok(())
    }

    /// Accumulated gradient of a leaf.
    pub fn grad(&self) -> Option<T> {
        self.meta.lock().grad.clone()
    }

    pub fn zero_grad(&self) {
        self.meta.lock().grad = None;
    }

    /// New leaf sharing this value, cut off from the graph.
    pub fn detach(&self) -> Self {
        Self::from_parts(Arc::clone(&self.value), None, false)
    }

    /// Transform this variable's gradient before its node consumes it.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::NoGradientEdge` if the variable is not part of a
    /// graph.
    pub fn register_hook<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&T) -> Result<T> + Send + Sync + 'static,
    {
        let edge = self.gradient_edge();
        let node = edge.function().ok_or(GraphError::NoGradientEdge)?;
        node.add_pre_hook(SlotHook::new(edge.input_nr() as usize, f));
        Ok(())
    }

    /// True if both handles refer to the same variable.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.meta, &other.meta)
    }
}

impl<T: GradValue> Clone for Variable<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            meta: Arc::clone(&self.meta),
        }
    }
}

impl<T: GradValue> fmt::Debug for Variable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = self.meta.lock();
        f.debug_struct("Variable")
            .field("value", &self.value)
            .field("requires_grad", &(meta.requires_grad || meta.grad_edge.is_some()))
            .field("grad_edge", &meta.grad_edge)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::functions::ErrorFunction;

    #[test]
    fn test_plain_leaf_has_no_edge() {
        let x = Variable::new(1.0_f64);
        assert!(x.is_leaf());
        assert!(!x.requires_grad());
        assert!(!x.gradient_edge().is_valid());
        assert!(x.grad_accumulator().is_none());
    }

    #[test]
    fn test_leaf_accumulator_is_cached() {
        let x = Variable::leaf(1.0_f64, true);
        let first = x.gradient_edge();
        let second = x.gradient_edge();

        assert!(first.is_valid());
        assert_eq!(first, second);
        assert_eq!(first.input_nr(), 0);
        let node = first.function().unwrap();
        assert_eq!(node.name(), "AccumulateGrad");
        assert_eq!(node.num_inputs(), 1);
        assert_eq!(node.num_outputs(), 0);
    }

    #[test]
    fn test_binding_is_last_wins() {
        let a: NodeRef<f64> = Node::sink(ErrorFunction::new("a"), 1);
        let b: NodeRef<f64> = Node::sink(ErrorFunction::new("b"), 2);
        let x = Variable::from_edge(3.0, Edge::new(a.clone(), 0)).unwrap();
        assert!(!x.is_leaf());
        assert!(Arc::ptr_eq(&x.grad_fn().unwrap(), &a));

        x.set_gradient_edge(Edge::new(b.clone(), 1)).unwrap();
        assert!(Arc::ptr_eq(&x.grad_fn().unwrap(), &b));
        assert_eq!(x.output_nr(), 1);
    }

    #[test]
    fn test_binding_to_missing_slot_is_rejected() {
        let a: NodeRef<f64> = Node::sink(ErrorFunction::new("a"), 1);
        let err = Variable::from_edge(3.0, Edge::new(a.clone(), 1)).unwrap_err();
        assert!(matches!(err, GraphError::InvalidEdge { input_nr: 1, num_inputs: 1, .. }));

        let x = Variable::from_edge(3.0, Edge::new(a.clone(), 0)).unwrap();
        let err = x.set_gradient_edge(Edge::new(a.clone(), 7)).unwrap_err();
        assert!(matches!(err, GraphError::InvalidEdge { input_nr: 7, .. }));
        assert_eq!(x.gradient_edge(), Edge::new(a, 0));
    }

    #[test]
    fn test_clone_shares_binding_and_detach_does_not() {
        let x = Variable::leaf(2.0_f64, true);
        let y = x.clone();
        let d = x.detach();

        assert!(x.same_as(&y));
        assert!(!x.same_as(&d));
        assert!(!d.requires_grad());
        assert_eq!(*d.value(), 2.0);
    }

    #[test]
    fn test_register_hook_needs_graph() {
        let x = Variable::new(1.0_f64);
        let err = x.register_hook(|g: &f64| Ok(*g)).unwrap_err();
        assert!(matches!(err, GraphError::NoGradientEdge));

        let y = Variable::leaf(1.0_f64, true);
        y.register_hook(|g: &f64| Ok(*g * 2.0)).unwrap();
        assert_eq!(y.grad_accumulator().unwrap().num_pre_hooks(), 1);
    }
}
