//! ndgrad - reverse-mode automatic differentiation graph engine
//!
//! This crate records a dynamic backward graph while forward operations run
//! and executes it to back-propagate gradients from one or more outputs into
//! every upstream input.
//!
//! # Architecture
//!
//! ```text
//! Level 1: Operations (ops module)
//!     → add, mul, square, sum, ...
//!
//! Level 2: Graph builder (autograd::record)
//!     → one node per operation, outputs bound to its input slots
//!
//! Level 3: Backward engine (autograd::Engine)
//!     → dependency counting, sequence-ordered dispatch, accumulation
//! ```
//!
//! The engine is generic over the value type through [`GradValue`]; the
//! bundled operations use [`DenseTensor`].
//!
//! # Example
//!
//! ```
//! use ndgrad::autograd::{Engine, Variable};
//! use ndgrad::ops::{mul, sum};
//! use ndgrad::tensor::DenseTensor;
//!
//! let a = Variable::leaf(DenseTensor::from_vec(vec![1.0, 2.0], &[2]).unwrap(), true);
//! let b = Variable::leaf(DenseTensor::from_vec(vec![3.0, 4.0], &[2]).unwrap(), true);
//! let loss = sum(&mul(&a, &b).unwrap()).unwrap();
//!
//! Engine::default()
//!     .backward(&[(&loss, DenseTensor::scalar(1.0))])
//!     .unwrap();
//! assert_eq!(a.grad().unwrap().data(), &[3.0, 4.0]);
//! ```

pub mod autograd;
pub mod error;
pub mod ops;
pub mod tensor;

pub use error::{GraphError, Result};
pub use tensor::{DenseTensor, GradValue};
