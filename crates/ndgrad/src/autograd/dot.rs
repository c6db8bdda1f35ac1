//! Export of the backward graph for inspection.
//!
//! [`to_petgraph`] copies the part of the graph reachable from some nodes into
//! a `petgraph` graph, with one vertex per node labelled `Name #seq` and one
//! edge per next edge weighted by the target slot. [`to_dot`] renders the same
//! graph as Graphviz text.

use super::node::NodeRef;
use crate::tensor::GradValue;
use petgraph::algo::toposort;
use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::sync::Arc;

/// Reachable backward graph from `roots`.
pub fn to_petgraph<T: GradValue>(roots: &[NodeRef<T>]) -> DiGraph<String, u32> {
    let mut graph: DiGraph<String, u32> = DiGraph::new();
    let mut index_of: HashMap<usize, NodeIndex> = HashMap::new();
    let mut stack: Vec<NodeRef<T>> = Vec::new();

    for root in roots {
        let key = Arc::as_ptr(root) as usize;
        if !index_of.contains_key(&key) {
            index_of.insert(key, graph.add_node(label(root)));
            stack.push(root.clone());
        }
    }

    while let Some(node) = stack.pop() {
        let from = index_of[&(Arc::as_ptr(&node) as usize)];
        for edge in node.next_edges() {
            let slot = edge.input_nr();
            let Some(target) = edge.into_function() else {
                continue;
            };
            let key = Arc::as_ptr(&target) as usize;
            let to = match index_of.get(&key) {
                Some(&index) => index,
                None => {
                    let index = graph.add_node(label(&target));
                    index_of.insert(key, index);
                    stack.push(target);
                    index
                }
            };
            graph.add_edge(from, to, slot);
        }
    }
    graph
}

/// Graphviz rendering of the reachable backward graph.
pub fn to_dot<T: GradValue>(roots: &[NodeRef<T>]) -> String {
    let graph = to_petgraph(roots);
    format!("{:?}", Dot::with_config(&graph, &[Config::EdgeNoLabel]))
}

/// Node labels in an order where every node precedes the nodes it sends
/// gradients to, or `None` if the graph has a cycle.
pub fn dispatch_order(graph: &DiGraph<String, u32>) -> Option<Vec<String>> {
    toposort(graph, None)
        .ok()
        .map(|order| order.into_iter().map(|index| graph[index].clone()).collect())
}

fn label<T: GradValue>(node: &NodeRef<T>) -> String {
    format!("{} #{}", node.name(), node.sequence_nr())
}
