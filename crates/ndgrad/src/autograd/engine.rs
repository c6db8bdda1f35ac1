//! Backward engine: executes the graph behind one or more roots.
//!
//! A pass moves through four phases:
//!
//! 1. **Seeding.** The roots' gradient edges become the next edges of a
//!    [`GraphRoot`] node that emits the seed gradients.
//! 2. **Discovery.** Every node reachable from the root is visited once and
//!    the number of edges targeting it is counted. A node is ready once that
//!    many contributions arrived, whichever slots they hit.
//! 3. **Dispatch.** Ready nodes are popped highest sequence number first and
//!    invoked with their accumulated input buffer. Each produced gradient is
//!    summed into the buffer of the node its edge targets.
//! 4. **Drain.** The pass ends when nothing is ready. Any error aborts it at
//!    once, dropping all pending buffers.
//!
//! Backward functions run with graph recording disabled. A backward function
//! may start a nested pass; the nested pass has its own buffers and ready
//! queue, and its depth is bounded by [`EngineConfig::max_reentrant_depth`].

use super::anomaly::{AnomalyMode, AnomalyTracker};
use super::edge::Edge;
use super::functions::GraphRoot;
use super::grad_mode::GradModeGuard;
use super::input_buffer::InputBuffer;
use super::node::{Node, NodeRef};
use super::variable::Variable;
use crate::error::{GraphError, Result};
use crate::tensor::GradValue;
use log::{debug, error, trace, warn};
use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

const DEFAULT_MAX_REENTRANT_DEPTH: usize = 64;

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Keep saved values after a pass so the graph can be run again.
    pub keep_graph: bool,
    /// Record parent chains and attach them to errors.
    pub anomaly_mode: bool,
    /// Maximum nesting of backward passes started from backward functions.
    pub max_reentrant_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            keep_graph: false,
            anomaly_mode: false,
            max_reentrant_depth: DEFAULT_MAX_REENTRANT_DEPTH,
        }
    }
}

impl EngineConfig {
    pub fn with_keep_graph(mut self, keep_graph: bool) -> Self {
        self.keep_graph = keep_graph;
        self
    }

    pub fn with_anomaly_mode(mut self, anomaly_mode: bool) -> Self {
        self.anomaly_mode = anomaly_mode;
        self
    }

    pub fn with_max_reentrant_depth(mut self, depth: usize) -> Self {
        self.max_reentrant_depth = depth;
        self
    }

    /// Read `NDGRAD_KEEP_GRAPH`, `NDGRAD_ANOMALY` and
    /// `NDGRAD_MAX_REENTRANT_DEPTH`. Unset or malformed values keep their
    /// defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            keep_graph: lookup("NDGRAD_KEEP_GRAPH")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(defaults.keep_graph),
            anomaly_mode: lookup("NDGRAD_ANOMALY")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(defaults.anomaly_mode),
            max_reentrant_depth: lookup("NDGRAD_MAX_REENTRANT_DEPTH")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.max_reentrant_depth),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackwardOptions {
    /// Overrides [`EngineConfig::keep_graph`] for this call.
    pub keep_graph: Option<bool>,
}

impl BackwardOptions {
    pub fn with_keep_graph(mut self, keep_graph: bool) -> Self {
        self.keep_graph = Some(keep_graph);
        self
    }
}

thread_local! {
    static REENTRANT_DEPTH: Cell<usize> = const { Cell::new(0) };
    static DEPTH_LIMIT: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// Tracks pass nesting on the current thread.
///
/// A nested pass is bounded by the tighter of its own limit and the limit of
/// every pass it runs inside.
struct DepthGuard {
    prev_limit: usize,
}

impl DepthGuard {
    fn enter(limit: usize) -> Result<Self> {
        let depth = REENTRANT_DEPTH.with(|d| d.get()) + 1;
        let prev_limit = DEPTH_LIMIT.with(|l| l.get());
        let limit = limit.min(prev_limit);
        if depth > limit {
            return Err(GraphError::ReentrantDepthExceeded { depth });
        }
        REENTRANT_DEPTH.with(|d| d.set(depth));
        DEPTH_LIMIT.with(|l| l.set(limit));
        Ok(Self { prev_limit })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        REENTRANT_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
        DEPTH_LIMIT.with(|l| l.set(self.prev_limit));
    }
}

/// Depth of the backward pass running on this thread, 0 outside any pass.
pub fn current_depth() -> usize {
    REENTRANT_DEPTH.with(|d| d.get())
}

/// Runs backward passes.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Back-propagate `seed` gradients from each root into the graph.
    ///
    /// Roots without a gradient edge are skipped.
    pub fn backward<T: GradValue>(&self, roots: &[(&Variable<T>, T)]) -> Result<()> {
        self.backward_with(roots, BackwardOptions::default())
    }

    pub fn backward_with<T: GradValue>(
        &self,
        roots: &[(&Variable<T>, T)],
        options: BackwardOptions,
    ) -> Result<()> {
        let keep_graph = options.keep_graph.unwrap_or(self.config.keep_graph);
        self.execute(root_edges(roots), keep_graph, &[])?;
        Ok(())
    }

    /// Gradients of `outputs` with respect to `inputs`, returned instead of
    /// accumulated. Only nodes on a path to some input run.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::NoGradientEdge` if an input is not part of a graph.
    pub fn grad<T: GradValue>(
        &self,
        outputs: &[(&Variable<T>, T)],
        inputs: &[&Variable<T>],
        options: BackwardOptions,
    ) -> Result<Vec<Option<T>>> {
        let captures = inputs
            .iter()
            .map(|input| {
                let edge = input.gradient_edge();
                if edge.is_valid() {
                    Ok(edge)
                } else {
                    Err(GraphError::NoGradientEdge)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        let keep_graph = options.keep_graph.unwrap_or(self.config.keep_graph);
        self.execute(root_edges(outputs), keep_graph, &captures)
    }

    /// Run one pass from `(edge, seed)` roots.
    ///
    /// With no `captures`, every reachable node runs. Otherwise only nodes on
    /// a path to a captured edge run, and the gradient arriving at each
    /// captured edge is returned in order.
    pub fn execute<T: GradValue>(
        &self,
        roots: Vec<(Edge<T>, T)>,
        keep_graph: bool,
        captures: &[Edge<T>],
    ) -> Result<Vec<Option<T>>> {
        let _depth = DepthGuard::enter(self.config.max_reentrant_depth)?;
        let _grad_mode = GradModeGuard::new(false);

        let (edges, seeds): (Vec<_>, Vec<_>) =
            roots.into_iter().filter(|(edge, _)| edge.is_valid()).unzip();
        if edges.is_empty() {
            debug!("backward pass has no roots with a gradient edge");
            return Ok(vec![None; captures.len()]);
        }

        let root = Node::new(GraphRoot::new(seeds), 0, edges)?;
        let anomaly = self.config.anomaly_mode || AnomalyMode::is_enabled();
        let mut task = GraphTask::new(root, keep_graph, captures, anomaly);
        debug!(
            "backward pass started: depth {}, {} nodes, {} captures, keep_graph {}",
            current_depth(),
            task.dependencies.len(),
            captures.len(),
            keep_graph
        );
        task.run()?;
        debug!("backward pass finished: depth {}", current_depth());
        Ok(task.captured)
    }
}

fn root_edges<T: GradValue>(roots: &[(&Variable<T>, T)]) -> Vec<(Edge<T>, T)> {
    roots
        .iter()
        .filter_map(|(variable, seed)| {
            let edge = variable.gradient_edge();
            if edge.is_valid() {
                Some((edge, seed.clone()))
            } else {
                warn!("dropping backward root without a gradient edge: {variable:?}");
                None
            }
        })
        .collect()
}

fn node_key<T: GradValue>(node: &NodeRef<T>) -> usize {
    Arc::as_ptr(node) as usize
}

/// A node whose contributions all arrived.
struct ReadyEntry<T: GradValue> {
    sequence_nr: u64,
    order: u64,
    node: NodeRef<T>,
    inputs: InputBuffer<T>,
}

impl<T: GradValue> PartialEq for ReadyEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: GradValue> Eq for ReadyEntry<T> {}

impl<T: GradValue> PartialOrd for ReadyEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Max-heap: highest sequence number first, then earliest ready.
impl<T: GradValue> Ord for ReadyEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence_nr
            .cmp(&other.sequence_nr)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// State of one backward pass.
struct GraphTask<T: GradValue> {
    keep_graph: bool,
    /// Remaining contributions per reachable node.
    dependencies: HashMap<usize, usize>,
    /// Nodes that run; `None` means all of them.
    needed: Option<HashSet<usize>>,
    not_ready: HashMap<usize, InputBuffer<T>>,
    ready: BinaryHeap<ReadyEntry<T>>,
    next_order: u64,
    /// Captured (node, slot) pairs with their output index.
    capture_slots: HashMap<usize, Vec<(u32, usize)>>,
    captured: Vec<Option<T>>,
    anomaly: Option<AnomalyTracker>,
    /// Holds every reachable node for the whole pass so that node keys stay
    /// unique.
    _reachable: Vec<NodeRef<T>>,
}

impl<T: GradValue> GraphTask<T> {
    fn new(root: NodeRef<T>, keep_graph: bool, captures: &[Edge<T>], anomaly: bool) -> Self {
        let mut capture_slots: HashMap<usize, Vec<(u32, usize)>> = HashMap::new();
        for (index, edge) in captures.iter().enumerate() {
            if let Some(node) = edge.function() {
                capture_slots
                    .entry(node_key(node))
                    .or_default()
                    .push((edge.input_nr(), index));
            }
        }

        let post_order = discover(&root);
        let needed = (!captures.is_empty()).then(|| {
            let mut needed = HashSet::new();
            for node in &post_order {
                let feeds_needed = node.next_edges().iter().any(|edge| {
                    edge.function().is_some_and(|target| {
                        let key = node_key(target);
                        capture_slots.contains_key(&key) || needed.contains(&key)
                    })
                });
                if feeds_needed {
                    needed.insert(node_key(node));
                }
            }
            needed
        });

        let mut dependencies: HashMap<usize, usize> = HashMap::new();
        for node in &post_order {
            dependencies.entry(node_key(node)).or_insert(0);
            let runs = needed
                .as_ref()
                .is_none_or(|needed| needed.contains(&node_key(node)));
            if !runs {
                continue;
            }
            for edge in node.next_edges() {
                if let Some(target) = edge.function() {
                    *dependencies.entry(node_key(target)).or_insert(0) += 1;
                }
            }
        }

        let anomaly = anomaly.then(|| {
            let mut tracker = AnomalyTracker::default();
            tracker.record_root(node_key(&root), root.name());
            tracker
        });

        let mut task = Self {
            keep_graph,
            dependencies,
            needed,
            not_ready: HashMap::new(),
            ready: BinaryHeap::new(),
            next_order: 0,
            capture_slots,
            captured: vec![None; captures.len()],
            anomaly,
            _reachable: post_order,
        };
        task.push_ready(root, InputBuffer::new(0));
        task
    }

    fn push_ready(&mut self, node: NodeRef<T>, inputs: InputBuffer<T>) {
        let order = self.next_order;
        self.next_order += 1;
        self.ready.push(ReadyEntry {
            sequence_nr: node.sequence_nr(),
            order,
            node,
            inputs,
        });
    }

    fn run(&mut self) -> Result<()> {
        while let Some(ReadyEntry { node, inputs, .. }) = self.ready.pop() {
            self.dispatch(&node, inputs)
                .map_err(|source| self.node_failed(&node, source))?;
        }
        if !self.not_ready.is_empty() {
            return Err(GraphError::Internal(format!(
                "{} nodes never received all of their gradients",
                self.not_ready.len()
            )));
        }
        Ok(())
    }

    fn dispatch(&mut self, node: &NodeRef<T>, inputs: InputBuffer<T>) -> Result<()> {
        let key = node_key(node);
        if let Some(slots) = self.capture_slots.get(&key) {
            for &(slot, index) in slots {
                self.captured[index] = inputs.get(slot as usize).cloned();
            }
        }

        let runs = self.needed.as_ref().is_none_or(|needed| needed.contains(&key));
        if !runs {
            trace!("skipping {} #{}", node.name(), node.sequence_nr());
            return Ok(());
        }

        trace!("invoking {} #{}", node.name(), node.sequence_nr());
        let outputs = node.invoke(inputs.into_vec())?;
        if !self.keep_graph {
            node.release_variables();
        }

        for (edge, grad) in node.next_edges().into_iter().zip(outputs) {
            let slot = edge.input_nr();
            let Some(target) = edge.into_function() else {
                continue;
            };
            self.deliver(key, target, slot, grad)?;
        }
        Ok(())
    }

    fn deliver(
        &mut self,
        source: usize,
        target: NodeRef<T>,
        slot: u32,
        grad: Option<T>,
    ) -> Result<()> {
        if let (Some(grad), Some(expected)) = (&grad, target.input_shape(slot)) {
            if grad.shape() != expected.as_slice() {
                return Err(GraphError::ShapeMismatch {
                    expected,
                    actual: grad.shape().to_vec(),
                });
            }
        }

        let key = node_key(&target);
        if let Some(tracker) = &mut self.anomaly {
            tracker.record_edge(source, key, || target.name());
        }

        let remaining = self.dependencies.get_mut(&key).ok_or_else(|| {
            GraphError::Internal(format!(
                "{} #{} was not discovered before dispatch",
                target.name(),
                target.sequence_nr()
            ))
        })?;
        if *remaining == 0 {
            return Err(GraphError::Internal(format!(
                "{} #{} received more gradients than edges lead to it",
                target.name(),
                target.sequence_nr()
            )));
        }
        *remaining -= 1;
        let is_ready = *remaining == 0;

        let mut buffer = self
            .not_ready
            .remove(&key)
            .unwrap_or_else(|| InputBuffer::new(target.num_inputs() as usize));
        buffer.add(slot as usize, grad)?;
        if is_ready {
            self.push_ready(target, buffer);
        } else {
            self.not_ready.insert(key, buffer);
        }
        Ok(())
    }

    fn node_failed(&self, node: &NodeRef<T>, source: GraphError) -> GraphError {
        let trace = self
            .anomaly
            .as_ref()
            .map(|tracker| tracker.trace(node_key(node)))
            .unwrap_or_default();
        if !trace.is_empty() {
            error!(
                "backward of {} #{} failed: {source}; traceback: {}",
                node.name(),
                node.sequence_nr(),
                trace.join(" -> ")
            );
        }
        GraphError::NodeFailed {
            name: node.name(),
            sequence_nr: node.sequence_nr(),
            trace,
            source: Box::new(source),
        }
    }
}

/// Reachable nodes in post-order: every node after all nodes it points at.
fn discover<T: GradValue>(root: &NodeRef<T>) -> Vec<NodeRef<T>> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    let mut stack: Vec<(NodeRef<T>, Vec<NodeRef<T>>)> = Vec::new();

    visited.insert(node_key(root));
    stack.push((root.clone(), children(root)));
    while let Some((_, pending)) = stack.last_mut() {
        match pending.pop() {
            Some(child) => {
                if visited.insert(node_key(&child)) {
                    let grandchildren = children(&child);
                    stack.push((child, grandchildren));
                }
            }
            None => {
                if let Some((node, _)) = stack.pop() {
                    order.push(node);
                }
            }
        }
    }
    order
}

fn children<T: GradValue>(node: &NodeRef<T>) -> Vec<NodeRef<T>> {
    node.next_edges()
        .into_iter()
        .filter_map(|edge| edge.into_function())
        .collect()
}

impl<T: GradValue> Variable<T> {
    /// Back-propagate from this single-element variable with seed `1`.
    ///
    /// Uses an engine configured from the environment.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::ShapeMismatch` if the value has more than one
    /// element and `GraphError::NoGradientEdge` if it is not in a graph.
    pub fn backward(&self) -> Result<()> {
        if self.value().numel() != 1 {
            return Err(GraphError::ShapeMismatch {
                expected: Vec::new(),
                actual: self.shape().to_vec(),
            });
        }
        self.backward_with_grad(self.value().ones_like())
    }

    /// Back-propagate from this variable with an explicit seed gradient.
    pub fn backward_with_grad(&self, seed: T) -> Result<()> {
        if !self.gradient_edge().is_valid() {
            return Err(GraphError::NoGradientEdge);
        }
        Engine::new(EngineConfig::from_env()).backward(&[(self, seed)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::functions::{BackwardFn, ErrorFunction};
    use crate::autograd::node::GradList;
    use approx::assert_relative_eq;

    #[test]
    fn test_config_from_lookup() {
        let config = EngineConfig::from_lookup(|key| match key {
            "NDGRAD_KEEP_GRAPH" => Some("yes".to_string()),
            "NDGRAD_ANOMALY" => Some("maybe".to_string()),
            "NDGRAD_MAX_REENTRANT_DEPTH" => Some(" 8 ".to_string()),
            _ => None,
        });
        assert!(config.keep_graph);
        assert!(!config.anomaly_mode);
        assert_eq!(config.max_reentrant_depth, 8);

        assert_eq!(EngineConfig::from_lookup(|_| None), EngineConfig::default());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn test_ready_order_prefers_newer_nodes() {
        let old: NodeRef<f64> = Node::sink(ErrorFunction::new("old"), 0);
        let new: NodeRef<f64> = Node::sink(ErrorFunction::new("new"), 0);
        let mut heap = BinaryHeap::new();
        for (order, node) in [(0, old.clone()), (1, new.clone()), (2, old.clone())] {
            heap.push(ReadyEntry {
                sequence_nr: node.sequence_nr(),
                order,
                node,
                inputs: InputBuffer::new(0),
            });
        }
        let popped: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|e| e.order)).collect();
        assert_eq!(popped, vec![1, 0, 2]);
    }

    #[test]
    fn test_execute_without_roots_is_noop() {
        let engine = Engine::default();
        let result = engine.execute::<f64>(vec![(Edge::empty(), 1.0)], false, &[]);
        assert!(result.unwrap().is_empty());
    }

    #[test]
    fn test_seed_shape_is_checked() {
        let x = Variable::leaf(crate::tensor::DenseTensor::zeros(&[2]), true);
        let err = Engine::default()
            .backward(&[(&x, crate::tensor::DenseTensor::ones(&[3]))])
            .unwrap_err();
        assert!(matches!(err.root_cause(), GraphError::ShapeMismatch { .. }));
        assert!(matches!(err, GraphError::NodeFailed { ref name, .. } if name == "GraphRoot"));
    }

    #[test]
    fn test_direct_leaf_backward() {
        let x = Variable::leaf(2.0_f64, true);
        Engine::default().backward(&[(&x, 3.0)]).unwrap();
        Engine::default().backward(&[(&x, 0.5)]).unwrap();
        assert_relative_eq!(x.grad().unwrap(), 3.5);
    }

    #[test]
    fn test_nested_depth_limit() {
        let engine = Engine::new(EngineConfig::default().with_max_reentrant_depth(0));
        let x = Variable::leaf(1.0_f64, true);
        let err = engine.backward(&[(&x, 1.0)]).unwrap_err();
        assert!(matches!(err, GraphError::ReentrantDepthExceeded { depth: 1 }));
        assert_eq!(current_depth(), 0);
    }

    #[test]
    fn test_unreached_slot_is_delivered_as_none() {
        let x = Variable::leaf(1.0_f64, true);
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let record = seen.clone();
        let node = Node::new(
            BackwardFn::new("TwoSlots", move |grads: GradList<f64>| {
                *record.lock() = Some(grads.clone());
                Ok(vec![grads[0]])
            }),
            2,
            [x.gradient_edge()],
        )
        .unwrap();
        let y = Variable::from_edge(1.0, Edge::new(node, 0)).unwrap();

        Engine::default().backward(&[(&y, 4.0)]).unwrap();
        assert_eq!(*seen.lock(), Some(vec![Some(4.0), None]));
        assert_relative_eq!(x.grad().unwrap(), 4.0);
    }
}
