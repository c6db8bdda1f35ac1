//! Edges of the backward graph.

use super::node::NodeRef;
use crate::error::{GraphError, Result};
use crate::tensor::GradValue;
use std::fmt;
use std::sync::Arc;

/// Where a gradient flows next: input slot `input_nr` of `function`.
///
/// An empty edge (no function) marks an input that was constant or did not
/// require gradients. Gradients sent along it are dropped.
pub struct Edge<T: GradValue> {
    function: Option<NodeRef<T>>,
    input_nr: u32,
}

impl<T: GradValue> Edge<T> {
    pub fn new(function: NodeRef<T>, input_nr: u32) -> Self {
        Self {
            function: Some(function),
            input_nr,
        }
    }

    /// Edge that leads nowhere.
    pub fn empty() -> Self {
        Self {
            function: None,
            input_nr: 0,
        }
    }

    /// False for empty edges.
    pub fn is_valid(&self) -> bool {
        self.function.is_some()
    }

    pub fn function(&self) -> Option<&NodeRef<T>> {
        self.function.as_ref()
    }

    pub fn into_function(self) -> Option<NodeRef<T>> {
        self.function
    }

    pub fn input_nr(&self) -> u32 {
        self.input_nr
    }

    /// Fails with `GraphError::InvalidEdge` if the slot does not exist on the
    /// target node. Empty edges always pass.
    pub fn check_slot(&self) -> Result<()> {
        let Some(target) = &self.function else {
            return Ok(());
        };
        if self.input_nr >= target.num_inputs() {
            return Err(GraphError::InvalidEdge {
                target: target.name(),
                input_nr: self.input_nr,
                num_inputs: target.num_inputs(),
            });
        }
        Ok(())
    }
}

impl<T: GradValue> Clone for Edge<T> {
    fn clone(&self) -> Self {
        Self {
            function: self.function.clone(),
            input_nr: self.input_nr,
        }
    }
}

impl<T: GradValue> Default for Edge<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: GradValue> PartialEq for Edge<T> {
    fn eq(&self, other: &Self) -> bool {
        let same_node = match (&self.function, &other.function) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_node && self.input_nr == other.input_nr
    }
}

impl<T: GradValue> Eq for Edge<T> {}

impl<T: GradValue> fmt::Debug for Edge<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(node) => write!(
                f,
                "Edge({} #{}, {})",
                node.name(),
                node.sequence_nr(),
                self.input_nr
            ),
            None => f.write_str("Edge(empty)"),
        }
    }
}
