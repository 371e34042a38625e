//! # stoat-cpu
//!
//! CPU backend for Stoat: per-dtype `Vec` storage, generic kernels over
//! [`WithDType`], and a rayon-parallel matmul. All kernels read through
//! layouts, so views (slices, transposes) are consumed in place without
//! materializing contiguous copies.

use half::{bf16, f16};
use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;

use stoat_core::backend::{Backend, BackendDevice, BackendStorage, BinaryOp, UnaryOp};
use stoat_core::{DType, Error, Layout, Result, Shape, Tensor, WithDType};

/// A tensor on the CPU backend.
pub type CpuTensor = Tensor<CpuBackend>;

/// The CPU device. There is only one.
#[derive(Debug, Clone)]
pub struct CpuDevice;

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }
}

/// CPU storage: one `Vec` per supported dtype.
#[derive(Debug, Clone)]
pub enum CpuStorage {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    I64(Vec<i64>),
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F16(_) => DType::F16,
            CpuStorage::BF16(_) => DType::BF16,
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
            CpuStorage::I64(_) => DType::I64,
        }
    }

    fn len(&self) -> usize {
        match self {
            CpuStorage::F16(v) => v.len(),
            CpuStorage::BF16(v) => v.len(),
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F64(v) => v.len(),
            CpuStorage::I64(v) => v.len(),
        }
    }
}

/// Dispatch on one storage, producing storage of the same dtype.
macro_rules! map_storage {
    ($s:expr, |$v:ident| $body:expr) => {
        match $s {
            CpuStorage::F16($v) => CpuStorage::F16($body),
            CpuStorage::BF16($v) => CpuStorage::BF16($body),
            CpuStorage::F32($v) => CpuStorage::F32($body),
            CpuStorage::F64($v) => CpuStorage::F64($body),
            CpuStorage::I64($v) => CpuStorage::I64($body),
        }
    };
}

/// Dispatch on a pair of storages, which must share a dtype.
macro_rules! zip_storage {
    ($l:expr, $r:expr, |$a:ident, $b:ident| $body:expr) => {
        match ($l, $r) {
            (CpuStorage::F16($a), CpuStorage::F16($b)) => Ok(CpuStorage::F16($body)),
            (CpuStorage::BF16($a), CpuStorage::BF16($b)) => Ok(CpuStorage::BF16($body)),
            (CpuStorage::F32($a), CpuStorage::F32($b)) => Ok(CpuStorage::F32($body)),
            (CpuStorage::F64($a), CpuStorage::F64($b)) => Ok(CpuStorage::F64($body)),
            (CpuStorage::I64($a), CpuStorage::I64($b)) => Ok(CpuStorage::I64($body)),
            (l, r) => Err(Error::DTypeMismatch {
                expected: l.dtype(),
                got: r.dtype(),
            }),
        }
    };
}

/// Build storage of the requested dtype from an f64 value stream.
fn collect_storage(dtype: DType, data: impl Iterator<Item = f64>) -> CpuStorage {
    match dtype {
        DType::F16 => CpuStorage::F16(data.map(f16::from_f64).collect()),
        DType::BF16 => CpuStorage::BF16(data.map(bf16::from_f64).collect()),
        DType::F32 => CpuStorage::F32(data.map(|v| v as f32).collect()),
        DType::F64 => CpuStorage::F64(data.collect()),
        DType::I64 => CpuStorage::I64(data.map(|v| v as i64).collect()),
    }
}

// Generic kernels. Arithmetic goes through f64, which is exact for every
// supported dtype's value range and keeps each kernel a single definition.

fn unary_kernel<T: WithDType>(op: UnaryOp, data: &[T], layout: &Layout) -> Vec<T> {
    layout
        .strided_indices()
        .map(|i| {
            let v = data[i].to_f64();
            T::from_f64(match op {
                UnaryOp::Neg => -v,
                UnaryOp::Square => v * v,
                UnaryOp::Sign => {
                    if v > 0.0 {
                        1.0
                    } else if v < 0.0 {
                        -1.0
                    } else {
                        0.0
                    }
                }
                UnaryOp::Tanh => v.tanh(),
                UnaryOp::Sigmoid => 1.0 / (1.0 + (-v).exp()),
                UnaryOp::Relu => v.max(0.0),
            })
        })
        .collect()
}

fn binary_kernel<T: WithDType>(
    op: BinaryOp,
    lhs: &[T],
    lhs_layout: &Layout,
    rhs: &[T],
    rhs_layout: &Layout,
) -> Vec<T> {
    lhs_layout
        .strided_indices()
        .zip(rhs_layout.strided_indices())
        .map(|(i, j)| {
            let a = lhs[i].to_f64();
            let b = rhs[j].to_f64();
            T::from_f64(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
            })
        })
        .collect()
}

fn affine_kernel<T: WithDType>(data: &[T], layout: &Layout, mul: f64, add: f64) -> Vec<T> {
    layout
        .strided_indices()
        .map(|i| T::from_f64(data[i].to_f64() * mul + add))
        .collect()
}

/// Row-parallel 2-D matmul. Operands are read through their layouts, so
/// transposed views multiply without a contiguous copy.
fn matmul_kernel<T: WithDType>(
    lhs: &[T],
    lhs_layout: &Layout,
    rhs: &[T],
    rhs_layout: &Layout,
) -> Vec<T> {
    let (m, k) = (lhs_layout.dims()[0], lhs_layout.dims()[1]);
    let n = rhs_layout.dims()[1];
    let (lo, ls0, ls1) = (
        lhs_layout.offset(),
        lhs_layout.strides()[0],
        lhs_layout.strides()[1],
    );
    let (ro, rs0, rs1) = (
        rhs_layout.offset(),
        rhs_layout.strides()[0],
        rhs_layout.strides()[1],
    );
    (0..m)
        .into_par_iter()
        .flat_map_iter(|i| {
            (0..n)
                .map(|j| {
                    let mut acc = 0.0f64;
                    for p in 0..k {
                        let a = lhs[lo + i * ls0 + p * ls1].to_f64();
                        let b = rhs[ro + p * rs0 + j * rs1].to_f64();
                        acc += a * b;
                    }
                    T::from_f64(acc)
                })
                .collect::<Vec<T>>()
        })
        .collect()
}

fn copy_kernel<T: WithDType>(
    dst: &mut [T],
    dst_layout: &Layout,
    src: &[T],
    src_layout: &Layout,
) {
    for (d, s) in dst_layout
        .strided_indices()
        .zip(src_layout.strided_indices())
    {
        dst[d] = src[s];
    }
}

fn to_f64_kernel<T: WithDType>(data: &[T], layout: &Layout) -> Vec<f64> {
    layout
        .strided_indices()
        .map(|i| data[i].to_f64())
        .collect()
}

/// The CPU compute backend.
#[derive(Debug, Clone)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn zeros(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let n = shape.elem_count();
        Ok(collect_storage(dtype, std::iter::repeat(0.0).take(n)))
    }

    fn full(shape: &Shape, val: f64, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let n = shape.elem_count();
        Ok(collect_storage(dtype, std::iter::repeat(val).take(n)))
    }

    fn from_f64_slice(data: &[f64], dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(collect_storage(dtype, data.iter().copied()))
    }

    fn rand_uniform(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let mut rng = rand::thread_rng();
        let n = shape.elem_count();
        Ok(collect_storage(dtype, (0..n).map(|_| rng.gen::<f64>())))
    }

    fn rand_normal(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let mut rng = rand::thread_rng();
        let n = shape.elem_count();
        Ok(collect_storage(
            dtype,
            (0..n).map(|_| rng.sample::<f64, _>(StandardNormal)),
        ))
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        zip_storage!(lhs, rhs, |a, b| binary_kernel(
            op, a, lhs_layout, b, rhs_layout
        ))
    }

    fn unary_op(op: UnaryOp, input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        Ok(map_storage!(input, |v| unary_kernel(op, v, layout)))
    }

    fn affine(input: &CpuStorage, layout: &Layout, mul: f64, add: f64) -> Result<CpuStorage> {
        Ok(map_storage!(input, |v| affine_kernel(v, layout, mul, add)))
    }

    fn matmul(
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        if lhs_layout.rank() != 2 || rhs_layout.rank() != 2 {
            return Err(Error::msg(format!(
                "matmul expects 2-D operands, got {} and {}",
                lhs_layout.shape(),
                rhs_layout.shape()
            )));
        }
        zip_storage!(lhs, rhs, |a, b| matmul_kernel(
            a, lhs_layout, b, rhs_layout
        ))
    }

    fn copy_strided(
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        src: &CpuStorage,
        src_layout: &Layout,
    ) -> Result<()> {
        match (dst, src) {
            (CpuStorage::F16(d), CpuStorage::F16(s)) => copy_kernel(d, dst_layout, s, src_layout),
            (CpuStorage::BF16(d), CpuStorage::BF16(s)) => copy_kernel(d, dst_layout, s, src_layout),
            (CpuStorage::F32(d), CpuStorage::F32(s)) => copy_kernel(d, dst_layout, s, src_layout),
            (CpuStorage::F64(d), CpuStorage::F64(s)) => copy_kernel(d, dst_layout, s, src_layout),
            (CpuStorage::I64(d), CpuStorage::I64(s)) => copy_kernel(d, dst_layout, s, src_layout),
            (d, s) => {
                return Err(Error::DTypeMismatch {
                    expected: d.dtype(),
                    got: s.dtype(),
                })
            }
        }
        Ok(())
    }

    fn to_f64_vec(input: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
        Ok(match input {
            CpuStorage::F16(v) => to_f64_kernel(v, layout),
            CpuStorage::BF16(v) => to_f64_kernel(v, layout),
            CpuStorage::F32(v) => to_f64_kernel(v, layout),
            CpuStorage::F64(v) => to_f64_kernel(v, layout),
            CpuStorage::I64(v) => to_f64_kernel(v, layout),
        })
    }
}
