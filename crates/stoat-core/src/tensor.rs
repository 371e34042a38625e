use std::sync::{Arc, RwLock};

use crate::backend::{Backend, BinaryOp, UnaryOp};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::Shape;

// Tensor — A handle over shared, device-resident storage
//
// A Tensor is a dense n-dimensional array: a layout (shape + strides +
// offset) over a storage buffer that lives behind Arc<RwLock<_>>. That
// memory model is what the recurrence engine's wiring is built on:
//
//   - Cloning a Tensor is O(1) and aliases the same buffer. Binding a clone
//     into another scope *is* the share-data link — no copy, no transfer
//     of ownership.
//   - `slice(begin, end)` produces a view of a leading-axis sub-range:
//     new layout, same storage. Slicing step `t` out of a sequence tensor
//     costs nothing.
//   - `copy_from` writes through the handle into the shared buffer, so
//     copying a step output into `aggregate.slice(t, t + 1)` fills the
//     aggregate every other alias sees.
//
// There is no autograd tape here. Gradients in this engine are computed by
// running explicitly differentiated step programs, so a tensor never
// records the operation that produced it.

struct TensorInner<B: Backend> {
    /// The raw data, shared between all views of the same buffer.
    storage: Arc<RwLock<B::Storage>>,
    /// Memory layout: shape + strides + offset into the storage.
    layout: Layout,
    /// Element type.
    dtype: DType,
    /// The device this tensor lives on.
    device: B::Device,
}

/// An n-dimensional array on a specific backend.
///
/// Cloning is cheap (Arc increment) and produces an alias of the same
/// storage, not a copy.
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, device={:?})",
            self.inner.layout.shape(),
            self.inner.dtype,
            self.inner.device,
        )
    }
}

impl<B: Backend> Tensor<B> {
    fn from_storage(storage: B::Storage, layout: Layout, dtype: DType, device: B::Device) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                storage: Arc::new(RwLock::new(storage)),
                layout,
                dtype,
                device,
            }),
        }
    }

    /// Create a view sharing the same storage with a different layout.
    fn view_with_layout(&self, layout: Layout) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                storage: Arc::clone(&self.inner.storage),
                layout,
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
            }),
        }
    }

    // Accessors

    /// The shape of this tensor.
    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    /// Number of dimensions (rank).
    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    /// Total number of elements.
    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    /// The device this tensor is on.
    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    /// The memory layout (shape + strides + offset).
    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    /// Whether this tensor aliases the same storage buffer as `other`.
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner.storage, &other.inner.storage)
    }

    fn read_storage(&self) -> Result<std::sync::RwLockReadGuard<'_, B::Storage>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    fn write_storage(&self) -> Result<std::sync::RwLockWriteGuard<'_, B::Storage>> {
        self.inner
            .storage
            .write()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    // Creation

    /// Create a tensor filled with zeros.
    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::zeros(&shape, dtype, device)?;
        Ok(Self::from_storage(storage, layout, dtype, device.clone()))
    }

    /// Create a tensor filled with a constant value.
    pub fn full(
        shape: impl Into<Shape>,
        val: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::full(&shape, val, dtype, device)?;
        Ok(Self::from_storage(storage, layout, dtype, device.clone()))
    }

    /// Create a tensor from a flat slice of f64 values, converted to `dtype`.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: shape.clone(),
                expected: shape.elem_count(),
                got: data.len(),
            });
        }
        let layout = Layout::contiguous(shape);
        let storage = B::from_f64_slice(data, dtype, device)?;
        Ok(Self::from_storage(storage, layout, dtype, device.clone()))
    }

    /// Create a tensor with random uniform values in [0, 1).
    pub fn rand(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::rand_uniform(&shape, dtype, device)?;
        Ok(Self::from_storage(storage, layout, dtype, device.clone()))
    }

    /// Create a tensor with random normal values (mean 0, std 1).
    pub fn randn(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::rand_normal(&shape, dtype, device)?;
        Ok(Self::from_storage(storage, layout, dtype, device.clone()))
    }

    /// Create a zero tensor with the same shape, dtype, and device as `other`.
    pub fn zeros_like(other: &Self) -> Result<Self> {
        Self::zeros(other.shape().clone(), other.dtype(), other.device())
    }

    // Views (no data copy)

    /// Slice `[begin, end)` along the leading axis. The result aliases a
    /// contiguous sub-range of this tensor's buffer; its leading dimension
    /// is `end - begin`.
    pub fn slice(&self, begin: usize, end: usize) -> Result<Self> {
        if self.rank() == 0 {
            return Err(Error::DimOutOfRange { dim: 0, rank: 0 });
        }
        if end < begin {
            return Err(Error::msg(format!(
                "slice: begin {} exceeds end {}",
                begin, end
            )));
        }
        let layout = self.inner.layout.narrow(0, begin, end - begin)?;
        Ok(self.view_with_layout(layout))
    }

    /// Remove a size-1 dimension. `slice(t, t + 1)?.squeeze(0)?` turns the
    /// t-th step of a sequence tensor into a per-step view with the time
    /// axis dropped.
    pub fn squeeze(&self, dim: usize) -> Result<Self> {
        let layout = self.inner.layout.squeeze(dim)?;
        Ok(self.view_with_layout(layout))
    }

    /// Transpose a 2-D tensor (view — strides swap, no data movement).
    pub fn t(&self) -> Result<Self> {
        let layout = self.inner.layout.transpose(0, 1)?;
        Ok(self.view_with_layout(layout))
    }

    // Copies

    /// Copy `src`'s contents into this tensor's storage region, element by
    /// element in logical order. Always duplicates data — the two tensors
    /// stay independent unless they already alias.
    ///
    /// The element counts must match; the shapes need not (copying a
    /// per-step tensor into a `[1, ...]` aggregate slice is the normal
    /// case). Writes go through the shared buffer, so every alias of this
    /// tensor observes the new values.
    pub fn copy_from(&self, src: &Self) -> Result<()> {
        if self.dtype() != src.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: src.dtype(),
            });
        }
        if self.elem_count() != src.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: self.shape().clone(),
                expected: self.elem_count(),
                got: src.elem_count(),
            });
        }
        if self.shares_storage_with(src) {
            // reading and writing the same buffer would deadlock on the
            // storage lock; detour through a materialized copy
            let data = src.to_f64_vec()?;
            let detached =
                Self::from_f64_slice(&data, src.shape().clone(), src.dtype(), src.device())?;
            return self.copy_from(&detached);
        }
        let src_storage = src.read_storage()?;
        let mut dst_storage = self.write_storage()?;
        B::copy_strided(
            &mut dst_storage,
            &self.inner.layout,
            &src_storage,
            &src.inner.layout,
        )
    }

    /// Read the elements out to host f64s in logical order.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let storage = self.read_storage()?;
        B::to_f64_vec(&storage, &self.inner.layout)
    }

    // Elementwise arithmetic

    /// Element-wise addition. Shapes must match exactly.
    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Add)
    }

    /// Element-wise subtraction.
    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Sub)
    }

    /// Element-wise multiplication.
    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Mul)
    }

    /// Element-wise division.
    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Div)
    }

    fn binary_op(&self, rhs: &Self, op: BinaryOp) -> Result<Self> {
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        if self.shape() != rhs.shape() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: rhs.shape().clone(),
            });
        }
        let lhs_storage = self.read_storage()?;
        let rhs_storage = rhs.read_storage()?;
        let result = B::binary_op(
            op,
            &lhs_storage,
            &self.inner.layout,
            &rhs_storage,
            &rhs.inner.layout,
        )?;
        let layout = Layout::contiguous(self.shape().clone());
        Ok(Self::from_storage(
            result,
            layout,
            self.inner.dtype,
            self.inner.device.clone(),
        ))
    }

    /// Element-wise negation.
    pub fn neg(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Neg)
    }

    /// Element-wise square.
    pub fn square(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Square)
    }

    /// Element-wise sign: -1, 0, or 1.
    pub fn sign(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sign)
    }

    /// Element-wise tanh.
    pub fn tanh(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Tanh)
    }

    /// Element-wise sigmoid.
    pub fn sigmoid(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sigmoid)
    }

    /// ReLU: max(0, x).
    pub fn relu(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Relu)
    }

    fn unary_op(&self, op: UnaryOp) -> Result<Self> {
        let storage = self.read_storage()?;
        let result = B::unary_op(op, &storage, &self.inner.layout)?;
        let layout = Layout::contiguous(self.shape().clone());
        Ok(Self::from_storage(
            result,
            layout,
            self.inner.dtype,
            self.inner.device.clone(),
        ))
    }

    /// Affine transform: `self * mul + add`.
    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        let storage = self.read_storage()?;
        let result = B::affine(&storage, &self.inner.layout, mul, add)?;
        let layout = Layout::contiguous(self.shape().clone());
        Ok(Self::from_storage(
            result,
            layout,
            self.inner.dtype,
            self.inner.device.clone(),
        ))
    }

    /// 2-D matrix multiply: `self @ rhs` for [m, k] @ [k, n].
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        let (m, k1) = (self.shape().dim(0)?, self.shape().dim(1)?);
        let (k2, n) = (rhs.shape().dim(0)?, rhs.shape().dim(1)?);
        if k1 != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
        }
        let lhs_storage = self.read_storage()?;
        let rhs_storage = rhs.read_storage()?;
        let result = B::matmul(
            &lhs_storage,
            &self.inner.layout,
            &rhs_storage,
            &rhs.inner.layout,
        )?;
        let layout = Layout::contiguous(Shape::from((m, n)));
        Ok(Self::from_storage(
            result,
            layout,
            self.inner.dtype,
            self.inner.device.clone(),
        ))
    }
}
