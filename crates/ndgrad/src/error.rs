//! Error types for ndgrad.

use thiserror::Error;

/// Result type alias using [`GraphError`].
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors raised while building or executing a backward graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// An edge points at a slot the target node does not have.
    #[error("invalid edge: slot {input_nr} out of range for `{target}` with {num_inputs} inputs")]
    InvalidEdge {
        target: String,
        input_nr: u32,
        num_inputs: u32,
    },

    /// Next-edge index past the end of a node's edge list.
    #[error("`{name}` has {len} next edges, index {index} is out of range")]
    EdgeIndex {
        name: String,
        index: usize,
        len: usize,
    },

    /// An edge would point from a node to an equal-or-newer node.
    #[error(
        "cycle detected: node #{source_seq} cannot send gradients to newer node #{target_seq}"
    )]
    CycleDetected { source_seq: u64, target_seq: u64 },

    /// The gradient list handed to a node does not match `num_inputs`.
    #[error("`{name}` expected {expected} input gradients, got {actual}")]
    InputArity {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// A node returned a different number of gradients than it has edges.
    #[error("`{name}` returned {actual} gradients for {expected} next edges")]
    OutputArity {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// A pre- or post-hook changed the length of the gradient list.
    #[error("{kind} hook on `{name}` changed gradient count from {expected} to {actual}")]
    HookArity {
        kind: &'static str,
        name: String,
        expected: usize,
        actual: usize,
    },

    /// Gradient shape does not match what the receiving slot expects.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A user-provided backward computation or hook failed.
    #[error("{0}")]
    Computation(String),

    /// Differentiating through an operation that declared no backward.
    #[error("{0}")]
    Unsupported(String),

    /// A dispatched node raised an error; carries the node's context.
    #[error("backward of `{name}` (#{sequence_nr}) failed: {source}")]
    NodeFailed {
        name: String,
        sequence_nr: u64,
        /// Root-to-failure chain of node names, filled in anomaly mode.
        trace: Vec<String>,
        #[source]
        source: Box<GraphError>,
    },

    /// Saved values were already freed by an earlier backward pass.
    #[error(
        "`{name}` was already run by a backward pass that released its saved values; \
         pass keep_graph to backward through the graph a second time"
    )]
    SavedTensorReleased { name: String },

    /// Nested backward passes went deeper than the configured limit.
    #[error("re-entrant backward depth {depth} exceeds the configured limit")]
    ReentrantDepthExceeded { depth: usize },

    /// A value asked for gradients is not connected to any graph.
    #[error("value does not require grad and has no gradient edge")]
    NoGradientEdge,

    /// Engine bookkeeping broke an internal invariant.
    #[error("internal engine error: {0}")]
    Internal(String),
}

impl GraphError {
    /// Shorthand for a [`GraphError::Computation`] error.
    pub fn computation(msg: impl Into<String>) -> Self {
        GraphError::Computation(msg.into())
    }

    /// Walk through `NodeFailed` wrappers to the error that started it.
    pub fn root_cause(&self) -> &GraphError {
        match self {
            GraphError::NodeFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
