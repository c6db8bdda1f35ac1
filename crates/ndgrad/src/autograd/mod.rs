//! Reverse-mode automatic differentiation graph and backward engine.
//!
//! Forward operations record one [`Node`] each through the graph builder.
//! Every node points, through its [`Edge`]s, at the nodes that must receive
//! the gradients of its inputs; every produced [`Variable`] is bound to the
//! node and slot that receive its own gradient. The [`Engine`] walks this
//! graph backwards from one or more roots.
//!
//! # Architecture
//!
//! ```text
//! Variable ──gradient edge──► Node ──next edge──► AccumulateGrad
//!    │                         │                      │
//!    ▼                         ▼                      ▼
//!  value (Arc)          Function::apply          leaf .grad
//!                       pre/post hooks
//! ```
//!
//! # Example
//!
//! ```
//! use ndgrad::autograd::Variable;
//! use ndgrad::ops::{identity, square};
//! use ndgrad::tensor::DenseTensor;
//!
//! let a = Variable::leaf(DenseTensor::scalar(3.0), true);
//! let loss = identity(&square(&a).unwrap()).unwrap();
//! loss.backward().unwrap();
//!
//! assert_eq!(a.grad().unwrap().data(), &[6.0]);
//! ```
//!
//! # Key Types
//!
//! - [`Node`] and [`Function`]: a unit of backward computation
//! - [`Edge`]: where a gradient flows next
//! - [`Variable`]: value plus gradient-edge binding
//! - [`Engine`]: runs backward passes
//! - [`GradModeGuard`] / [`NoGradGuard`]: thread-scoped recording switch

mod anomaly;
mod builder;
mod dot;
mod edge;
mod engine;
mod functions;
mod grad_mode;
mod hooks;
mod input_buffer;
mod node;
mod saved_tensor;
mod variable;

pub use anomaly::{AnomalyMode, DetectAnomalyGuard};
pub use builder::{
    add_gradient_edge, any_variable_requires_grad, bind_output, collect_producer_edges, record,
    should_record,
};
pub use dot::{dispatch_order, to_dot, to_petgraph};
pub use edge::Edge;
pub use engine::{BackwardOptions, Engine, EngineConfig, current_depth};
pub use functions::{
    AccumulateGrad, BackwardFn, DelayedError, ErrorFunction, GraphRoot, delayed_error,
};
pub use grad_mode::{GradMode, GradModeGuard, NoGradGuard, no_grad};
pub use hooks::{FunctionPostHook, FunctionPreHook, SlotHook};
pub use input_buffer::InputBuffer;
pub use node::{EdgeList, Function, GradList, Node, NodeRef, nodes_created_on_thread};
pub use saved_tensor::SavedTensor;
pub use variable::Variable;
