//! Utility types and functions for rayflow.
//!
//! This module contains fundamental types used throughout the library:
//! - [`Tensor`] - Dense row-major tensors backed by `ndarray`
//! - [`Error`] / [`Result`] - Error handling
//! - Math type re-exports from glam and point-cloud [`Bounds`]

mod error;
mod math;
mod tensor;

pub use error::*;
pub use math::*;
pub use tensor::*;
