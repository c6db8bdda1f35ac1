//! Differentiable operations on [`DenseTensor`](crate::tensor::DenseTensor).
//!
//! Each operation computes its forward value eagerly and registers a backward
//! function through [`record`](crate::autograd::record).

mod elementwise;
mod reentrant;

pub use elementwise::{
    AddBackward, DuplicateBackward, IdentityBackward, MulBackward, ScaleBackward,
    SquareBackward, SumBackward, add, duplicate, identity, mul, neg, scale, square, sum,
};
pub use reentrant::{ReentrantSquareBackward, nested_squares, reentrant_square};
