//! Graph builder: wires new nodes into the graph as forward operations run.
//!
//! A differentiable operation computes its forward values, then calls
//! [`record`] with its backward function, its inputs and its outputs. The
//! builder creates one node whose next edges are the inputs' gradient edges
//! (in input order) and binds each output to a fresh input slot of that node.
//!
//! With recording disabled (see [`GradMode`]) the builder does nothing: no
//! node is allocated and no output is bound.

use super::edge::Edge;
use super::grad_mode::GradMode;
use super::node::{EdgeList, Function, Node, NodeRef};
use super::variable::Variable;
use crate::error::Result;
use crate::tensor::GradValue;

/// Gradient edges of `inputs`, in order; empty edges for inputs that do not
/// require gradients. Returns an empty list when recording is disabled.
pub fn collect_producer_edges<T: GradValue>(inputs: &[&Variable<T>]) -> EdgeList<T> {
    if !GradMode::is_enabled() {
        return EdgeList::new();
    }
    inputs.iter().map(|input| input.gradient_edge()).collect()
}

pub fn any_variable_requires_grad<T: GradValue>(inputs: &[&Variable<T>]) -> bool {
    inputs.iter().any(|input| input.requires_grad())
}

/// True if an operation over `inputs` has to be recorded.
pub fn should_record<T: GradValue>(inputs: &[&Variable<T>]) -> bool {
    GradMode::is_enabled() && any_variable_requires_grad(inputs)
}

/// Bind `output` to slot `slot` of `node`. A second call overwrites the first.
///
/// # Errors
///
/// Returns `GraphError::InvalidEdge` if `node` has no slot `slot`; the
/// previous binding is kept.
pub fn bind_output<T: GradValue>(output: &Variable<T>, node: &NodeRef<T>, slot: u32) -> Result<()> {
    output.set_gradient_edge(Edge::new(node.clone(), slot))
}

/// Give `node` a new input slot for `output` and bind `output` to it.
///
/// Returns the new slot.
pub fn add_gradient_edge<T: GradValue>(output: &Variable<T>, node: &NodeRef<T>) -> Result<u32> {
    let slot = node.add_input_metadata(output.shape());
    bind_output(output, node, slot)?;
    Ok(slot)
}

/// Record one forward operation.
///
/// Wraps `outputs` in variables; when recording, they are bound to a new node
/// running `function` whose next edges lead to the producers of `inputs`.
pub fn record<T, F>(
    function: F,
    inputs: &[&Variable<T>],
    outputs: Vec<T>,
) -> Result<Vec<Variable<T>>>
where
    T: GradValue,
    F: Function<T> + 'static,
{
    let outputs: Vec<Variable<T>> = outputs.into_iter().map(Variable::new).collect();
    if !should_record(inputs) {
        return Ok(outputs);
    }

    let node = Node::new(function, 0, collect_producer_edges(inputs))?;
    for output in &outputs {
        add_gradient_edge(output, &node)?;
    }
    Ok(outputs)
}
