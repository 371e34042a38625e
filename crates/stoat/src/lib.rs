//! # Stoat
//!
//! A scope-driven recurrent execution engine: run a fixed step program once
//! per sequence position, threading recurrent state between per-step
//! variable scopes by zero-copy aliasing — and run the differentiated step
//! program in reverse to push gradients back through the whole sequence.
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `stoat-core` | Tensor, Shape, Layout, DType, Backend trait, Scope |
//! | `stoat-cpu` | CPU backend (rayon matmul, rand init) |
//! | `stoat` | Program description, block executor, recurrence drivers |
//!
//! ## Modules
//!
//! - [`program`] — `Program` / `Block` / `OpDesc` / `OpKind`, plus the
//!   recurrence wiring attributes (`Link`, `MemoryAttr`, `Argument`)
//! - [`exec`] — the block [`Executor`] and the forward/backward recurrence
//!   drivers with their [`StepScopes`] sequencer
//! - [`grad`] — gradient naming and backward-block emission

/// Re-export core types.
pub use stoat_core::{
    backend::{Backend, BackendDevice, BackendStorage, BinaryOp, UnaryOp},
    DType, Error, Layout, Result, Scope, Shape, Tensor, Variable, WithDType,
};

/// Re-export the CPU backend.
pub use stoat_cpu::{CpuBackend, CpuDevice, CpuStorage, CpuTensor};

pub mod exec;
pub mod grad;
pub mod program;

pub use exec::{Executor, RecurrentGradOp, RecurrentOp, StepScopes};

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::exec::{Executor, RecurrentGradOp, RecurrentOp, StepScopes};
    pub use crate::grad::{grad_block, grad_name};
    pub use crate::program::{Argument, Block, Link, MemoryAttr, OpDesc, OpKind, Program};
    pub use crate::{CpuBackend, CpuDevice, CpuTensor, DType, Scope, Shape, Tensor};
}
