//! # stoat-core
//!
//! Core primitives for the Stoat recurrence engine.
//!
//! This crate provides:
//! - [`Tensor`] — n-dimensional array over Arc-shared storage; cloning
//!   aliases the buffer, `slice` produces leading-axis views, `copy_from`
//!   duplicates data through the shared buffer
//! - [`Shape`] / [`Layout`] — shape, strides, and memory layout
//! - [`DType`] — element types (f16, bf16, f32, f64, i64)
//! - [`Backend`] trait — abstraction over compute devices
//! - [`Scope`] — chained variable namespaces with parent fallthrough, the
//!   substrate per-step programs execute against

pub mod backend;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod scope;
pub mod shape;
pub mod tensor;

pub use backend::{Backend, BackendDevice, BackendStorage, BinaryOp, UnaryOp};
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use layout::Layout;
pub use scope::{Scope, Variable};
pub use shape::Shape;
pub use tensor::Tensor;
