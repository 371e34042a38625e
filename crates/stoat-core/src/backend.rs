use crate::dtype::DType;
use crate::error::Result;
use crate::layout::Layout;
use crate::shape::Shape;
use std::fmt;

// Backend — Abstraction over compute devices
//
// The recurrence engine never touches element data directly; every numeric
// kernel and every device copy goes through this trait. A backend provides
// its own storage type, so new devices can be added as separate crates
// without modifying stoat-core, and Tensor<B> monomorphizes per backend.

/// Identifies a compute device (e.g. "cpu", "cuda:0").
pub trait BackendDevice: Clone + fmt::Debug + Send + Sync + 'static {
    /// A human-readable name for this device.
    fn name(&self) -> String;
}

/// A storage buffer holding tensor data on a specific device.
pub trait BackendStorage: Clone + Send + Sync + 'static {
    /// The data type of the elements in this storage.
    fn dtype(&self) -> DType;

    /// Total number of elements in this storage.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Square,
    Sign,
    Tanh,
    Sigmoid,
    Relu,
}

/// The main backend trait. Implementing this for a struct (e.g. CpuBackend)
/// makes it a complete compute backend for Stoat.
///
/// All operations take storage + layout (which encodes shape/strides/offset,
/// so views are read in place) and return new storage — except
/// [`Backend::copy_strided`], the single mutating primitive, which is what
/// writes a step's output into its slot of a sequence aggregate.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    /// The device type for this backend.
    type Device: BackendDevice;
    /// The storage type for this backend.
    type Storage: BackendStorage;

    /// Allocate storage filled with zeros.
    fn zeros(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Allocate storage filled with a constant value.
    fn full(shape: &Shape, val: f64, dtype: DType, device: &Self::Device)
        -> Result<Self::Storage>;

    /// Create storage from a flat f64 slice, converting to the target dtype.
    fn from_f64_slice(data: &[f64], dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Create storage with random uniform values in [0, 1).
    fn rand_uniform(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Create storage with random normal values (mean 0, std 1).
    fn rand_normal(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Apply a binary op element-wise: `result[i] = op(lhs[i], rhs[i])`.
    /// The layouts handle non-contiguous (view) access.
    fn binary_op(
        op: BinaryOp,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    /// Apply a unary op element-wise.
    fn unary_op(op: UnaryOp, input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// Affine transform: `result = input * mul + add`.
    fn affine(input: &Self::Storage, layout: &Layout, mul: f64, add: f64)
        -> Result<Self::Storage>;

    /// 2-D matrix multiply: `C = A @ B` for A [m, k] and B [k, n].
    /// Operands may be views (e.g. transposed layouts).
    fn matmul(
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    /// Copy `src`'s elements (in logical order) into `dst`'s elements (in
    /// logical order), following both layouts. This is the device-copy
    /// primitive: it always duplicates data and is the only way storage is
    /// mutated after creation.
    fn copy_strided(
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        src: &Self::Storage,
        src_layout: &Layout,
    ) -> Result<()>;

    /// Read the elements out to host f64s in logical order (for inspection
    /// and tests).
    fn to_f64_vec(input: &Self::Storage, layout: &Layout) -> Result<Vec<f64>>;
}
