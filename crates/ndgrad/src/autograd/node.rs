//! Graph nodes: units of backward computation.
//!
//! A [`Node`] owns one [`Function`] (the backward computation), the ordered
//! list of edges its output gradients travel along, and its hooks. Nodes are
//! shared through [`NodeRef`] (`Arc`): a node lives as long as some variable's
//! gradient edge or some other node's edge still points at it.
//!
//! # Sequence numbers
//!
//! Every node takes a sequence number from a counter local to the thread that
//! built it. Within one thread a node is always newer than the nodes it points
//! at, which gives the engine its dispatch order. Nodes built on different
//! threads draw from independent counters, so their numbers may overlap or
//! interleave; ordering across threads is only a tie-break heuristic.

use super::edge::Edge;
use super::hooks::{FunctionPostHook, FunctionPreHook};
use crate::error::{GraphError, Result};
use crate::tensor::GradValue;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Ordered gradients, one per slot. `None` means no gradient flows there.
pub type GradList<T> = Vec<Option<T>>;

/// Outgoing edges of a node, most nodes have few.
pub type EdgeList<T> = SmallVec<[Edge<T>; 4]>;

/// Shared handle to a graph node.
pub type NodeRef<T> = Arc<Node<T>>;

static NEXT_THREAD_TAG: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static NEXT_SEQUENCE_NR: Cell<u64> = const { Cell::new(0) };
    static THREAD_TAG: u64 = NEXT_THREAD_TAG.fetch_add(1, Ordering::Relaxed);
}

fn next_sequence_nr() -> u64 {
    NEXT_SEQUENCE_NR.with(|nr| {
        let current = nr.get();
        nr.set(current + 1);
        current
    })
}

/// Number of nodes constructed so far on the calling thread.
pub fn nodes_created_on_thread() -> u64 {
    NEXT_SEQUENCE_NR.with(|nr| nr.get())
}

fn current_thread_tag() -> u64 {
    THREAD_TAG.with(|tag| *tag)
}

/// Backward computation of one differentiable operation.
///
/// `apply` receives one gradient per input slot of `node` and must return one
/// gradient per next edge. Functions should skip work for outputs where
/// [`Node::should_compute_output`] is false and return `None` there.
pub trait Function<T: GradValue>: Send + Sync {
    fn apply(&self, node: &Node<T>, grads: GradList<T>) -> Result<GradList<T>>;

    /// Name used in errors, logs and graph dumps.
    fn name(&self) -> String {
        let full = std::any::type_name::<Self>();
        let base = full.split('<').next().unwrap_or(full);
        base.rsplit("::").next().unwrap_or(base).to_string()
    }

    /// Drop values saved for backward once the node will not run again.
    fn release_variables(&self) {}
}

/// A unit of backward computation in the graph.
pub struct Node<T: GradValue> {
    sequence_nr: u64,
    thread_tag: u64,
    num_inputs: AtomicU32,
    input_shapes: Mutex<Vec<Option<Vec<usize>>>>,
    next_edges: RwLock<EdgeList<T>>,
    pre_hooks: Mutex<Vec<Arc<dyn FunctionPreHook<T>>>>,
    post_hooks: Mutex<Vec<Arc<dyn FunctionPostHook<T>>>>,
    function: Box<dyn Function<T>>,
}

impl<T: GradValue> Node<T> {
    /// Build a node with `num_inputs` gradient slots and the given outgoing
    /// edges, taking a fresh sequence number from the calling thread.
    ///
    /// # Errors
    ///
    /// Fails if an edge targets a slot its node does not have, or points at a
    /// node built later on this thread.
    pub fn new<F>(
        function: F,
        num_inputs: u32,
        next_edges: impl IntoIterator<Item = Edge<T>>,
    ) -> Result<NodeRef<T>>
    where
        F: Function<T> + 'static,
    {
        let next_edges: EdgeList<T> = next_edges.into_iter().collect();
        let sequence_nr = next_sequence_nr();
        let thread_tag = current_thread_tag();
        for edge in &next_edges {
            check_edge(sequence_nr, thread_tag, edge)?;
        }
        Ok(Arc::new(Self::build(
            sequence_nr,
            thread_tag,
            Box::new(function),
            num_inputs,
            next_edges,
        )))
    }

    /// Build a node with no outgoing edges, such as a gradient sink.
    pub fn sink<F>(function: F, num_inputs: u32) -> NodeRef<T>
    where
        F: Function<T> + 'static,
    {
        Arc::new(Self::build(
            next_sequence_nr(),
            current_thread_tag(),
            Box::new(function),
            num_inputs,
            EdgeList::new(),
        ))
    }

    fn build(
        sequence_nr: u64,
        thread_tag: u64,
        function: Box<dyn Function<T>>,
        num_inputs: u32,
        next_edges: EdgeList<T>,
    ) -> Self {
        Self {
            sequence_nr,
            thread_tag,
            num_inputs: AtomicU32::new(num_inputs),
            input_shapes: Mutex::new(Vec::new()),
            next_edges: RwLock::new(next_edges),
            pre_hooks: Mutex::new(Vec::new()),
            post_hooks: Mutex::new(Vec::new()),
            function,
        }
    }

    pub fn sequence_nr(&self) -> u64 {
        self.sequence_nr
    }

    pub fn name(&self) -> String {
        self.function.name()
    }

    pub fn function(&self) -> &dyn Function<T> {
        self.function.as_ref()
    }

    // Inputs

    pub fn num_inputs(&self) -> u32 {
        self.num_inputs.load(Ordering::Acquire)
    }

    /// Add one input slot and return the previous count.
    ///
    /// Construction-time only: must not race with a backward pass that is
    /// already accumulating into this node.
    pub fn bump_inputs(&self) -> u32 {
        self.num_inputs.fetch_add(1, Ordering::AcqRel)
    }

    /// Add one input slot that expects gradients of `shape`; returns the slot.
    pub fn add_input_metadata(&self, shape: &[usize]) -> u32 {
        let mut shapes = self.input_shapes.lock();
        let slot = self.bump_inputs();
        let index = slot as usize;
        if shapes.len() <= index {
            shapes.resize(index + 1, None);
        }
        shapes[index] = Some(shape.to_vec());
        slot
    }

    /// Expected gradient shape for a slot, when one was recorded.
    pub fn input_shape(&self, slot: u32) -> Option<Vec<usize>> {
        self.input_shapes.lock().get(slot as usize).cloned().flatten()
    }

    // Outputs ("next edges")

    pub fn num_outputs(&self) -> usize {
        self.next_edges.read().len()
    }

    pub fn next_edge(&self, index: usize) -> Option<Edge<T>> {
        self.next_edges.read().get(index).cloned()
    }

    /// Snapshot of the outgoing edges.
    pub fn next_edges(&self) -> EdgeList<T> {
        self.next_edges.read().clone()
    }

    pub fn set_next_edge(&self, index: usize, edge: Edge<T>) -> Result<()> {
        check_edge(self.sequence_nr, self.thread_tag, &edge)?;
        let mut edges = self.next_edges.write();
        let len = edges.len();
        match edges.get_mut(index) {
            Some(slot) => {
                *slot = edge;
                Ok(())
            }
            None => Err(GraphError::EdgeIndex {
                name: self.name(),
                index,
                len,
            }),
        }
    }

    pub fn add_next_edge(&self, edge: Edge<T>) -> Result<()> {
        check_edge(self.sequence_nr, self.thread_tag, &edge)?;
        self.next_edges.write().push(edge);
        Ok(())
    }

    /// True if output `index` feeds a node, i.e. its gradient is wanted.
    pub fn should_compute_output(&self, index: usize) -> bool {
        self.next_edges
            .read()
            .get(index)
            .is_some_and(|edge| edge.is_valid())
    }

    // Hooks

    pub fn add_pre_hook(&self, hook: impl FunctionPreHook<T> + 'static) {
        self.pre_hooks.lock().push(Arc::new(hook));
    }

    pub fn add_post_hook(&self, hook: impl FunctionPostHook<T> + 'static) {
        self.post_hooks.lock().push(Arc::new(hook));
    }

    pub fn num_pre_hooks(&self) -> usize {
        self.pre_hooks.lock().len()
    }

    pub fn num_post_hooks(&self) -> usize {
        self.post_hooks.lock().len()
    }

    pub fn clear_pre_hooks(&self) {
        self.pre_hooks.lock().clear();
    }

    pub fn clear_post_hooks(&self) {
        self.post_hooks.lock().clear();
    }

    pub fn release_variables(&self) {
        self.function.release_variables();
    }

    /// Run the backward computation: pre-hooks, `apply`, post-hooks.
    ///
    /// `grads` must hold exactly `num_inputs` entries; the result holds
    /// exactly `num_outputs` entries.
    pub fn invoke(&self, grads: GradList<T>) -> Result<GradList<T>> {
        let expected_inputs = self.num_inputs() as usize;
        if grads.len() != expected_inputs {
            return Err(GraphError::InputArity {
                name: self.name(),
                expected: expected_inputs,
                actual: grads.len(),
            });
        }

        // Hooks may register further hooks, so never call them under the lock.
        let pre_hooks = self.pre_hooks.lock().clone();
        let post_hooks = self.post_hooks.lock().clone();

        let mut grads = grads;
        for hook in &pre_hooks {
            grads = hook.call(grads)?;
            if grads.len() != expected_inputs {
                return Err(GraphError::HookArity {
                    kind: "pre",
                    name: self.name(),
                    expected: expected_inputs,
                    actual: grads.len(),
                });
            }
        }

        let inputs = if post_hooks.is_empty() {
            None
        } else {
            Some(grads.clone())
        };

        let mut outputs = self.function.apply(self, grads)?;
        let expected_outputs = self.num_outputs();
        if outputs.len() != expected_outputs {
            return Err(GraphError::OutputArity {
                name: self.name(),
                expected: expected_outputs,
                actual: outputs.len(),
            });
        }

        if let Some(inputs) = inputs {
            for hook in &post_hooks {
                outputs = hook.call(outputs, &inputs)?;
                if outputs.len() != expected_outputs {
                    return Err(GraphError::HookArity {
                        kind: "post",
                        name: self.name(),
                        expected: expected_outputs,
                        actual: outputs.len(),
                    });
                }
            }
        }
        Ok(outputs)
    }
}

fn check_edge<T: GradValue>(sequence_nr: u64, thread_tag: u64, edge: &Edge<T>) -> Result<()> {
    let Some(target) = edge.function() else {
        return Ok(());
    };
    edge.check_slot()?;
    if target.thread_tag == thread_tag && target.sequence_nr >= sequence_nr {
        return Err(GraphError::CycleDetected {
            source_seq: sequence_nr,
            target_seq: target.sequence_nr,
        });
    }
    Ok(())
}

// Long chains would otherwise be freed recursively, one stack frame per node.
impl<T: GradValue> Drop for Node<T> {
    fn drop(&mut self) {
        let mut stack: Vec<NodeRef<T>> = self
            .next_edges
            .get_mut()
            .drain(..)
            .filter_map(Edge::into_function)
            .collect();
        while let Some(node) = stack.pop() {
            if let Ok(mut node) = Arc::try_unwrap(node) {
                stack.extend(
                    node.next_edges
                        .get_mut()
                        .drain(..)
                        .filter_map(Edge::into_function),
                );
            }
        }
    }
}

impl<T: GradValue> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name())
            .field("sequence_nr", &self.sequence_nr)
            .field("num_inputs", &self.num_inputs())
            .field("num_outputs", &self.num_outputs())
            .finish()
    }
}
