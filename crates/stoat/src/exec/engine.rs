// Executor — Runs one block of a program against a scope
//
// Ops resolve their input names through the scope chain (parameters live in
// an enclosing scope and are found by fallthrough) and bind fresh output
// tensors into the scope they run in. `create_local_scope` wraps execution
// in a transient child scope whose variables are dropped on return; the
// recurrence drivers pass `false` because the per-step scope they hand in
// already plays that role — and must survive for the backward pass.

use stoat_core::{Backend, Error, Result, Scope, Shape, Tensor};

use crate::exec::recurrent::{RecurrentGradOp, RecurrentOp};
use crate::program::{Block, OpDesc, OpKind, Program};

/// Executes program blocks against scopes on a given device.
pub struct Executor<B: Backend> {
    device: B::Device,
}

impl<B: Backend> Executor<B> {
    pub fn new(device: B::Device) -> Self {
        Executor { device }
    }

    /// The device this executor allocates on.
    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Execute one block of the program against the given scope,
    /// synchronously. Any operator failure aborts the block; already-bound
    /// outputs of earlier ops remain visible.
    pub fn run(
        &self,
        program: &Program,
        scope: &Scope<B>,
        block_id: usize,
        create_local_scope: bool,
    ) -> Result<()> {
        let block = program.block(block_id)?;
        if create_local_scope {
            let local = scope.new_child();
            self.run_block(program, block, &local)
        } else {
            self.run_block(program, block, scope)
        }
    }

    fn run_block(&self, program: &Program, block: &Block, scope: &Scope<B>) -> Result<()> {
        for op in &block.ops {
            self.run_op(program, op, scope)?;
        }
        Ok(())
    }

    /// Execute a single op against a scope. Public so callers (and the
    /// recurrence drivers) can reuse the numeric kernels — gradient
    /// summation and accumulator zeroing run through `Sum` and
    /// `FillConstant` here rather than as bespoke driver code.
    pub fn run_op(&self, program: &Program, op: &OpDesc, scope: &Scope<B>) -> Result<()> {
        match &op.kind {
            OpKind::Identity => {
                let x = input(scope, op, 0)?;
                bind(scope, op, 0, x)
            }

            OpKind::Add => {
                let r = input(scope, op, 0)?.add(&input(scope, op, 1)?)?;
                bind(scope, op, 0, r)
            }
            OpKind::Sub => {
                let r = input(scope, op, 0)?.sub(&input(scope, op, 1)?)?;
                bind(scope, op, 0, r)
            }
            OpKind::Mul => {
                let r = input(scope, op, 0)?.mul(&input(scope, op, 1)?)?;
                bind(scope, op, 0, r)
            }
            OpKind::Div => {
                let r = input(scope, op, 0)?.div(&input(scope, op, 1)?)?;
                bind(scope, op, 0, r)
            }

            OpKind::Neg => {
                let r = input(scope, op, 0)?.neg()?;
                bind(scope, op, 0, r)
            }
            OpKind::Scale { factor } => {
                let r = input(scope, op, 0)?.affine(*factor, 0.0)?;
                bind(scope, op, 0, r)
            }
            OpKind::Tanh => {
                let r = input(scope, op, 0)?.tanh()?;
                bind(scope, op, 0, r)
            }
            OpKind::Sigmoid => {
                let r = input(scope, op, 0)?.sigmoid()?;
                bind(scope, op, 0, r)
            }
            OpKind::Relu => {
                let r = input(scope, op, 0)?.relu()?;
                bind(scope, op, 0, r)
            }

            // dx = dy * (1 - y^2)
            OpKind::TanhGrad => {
                let y = input(scope, op, 0)?;
                let dy = input(scope, op, 1)?;
                let r = y.square()?.affine(-1.0, 1.0)?.mul(&dy)?;
                bind(scope, op, 0, r)
            }
            // dx = dy * y * (1 - y)
            OpKind::SigmoidGrad => {
                let y = input(scope, op, 0)?;
                let dy = input(scope, op, 1)?;
                let r = y.mul(&y.affine(-1.0, 1.0)?)?.mul(&dy)?;
                bind(scope, op, 0, r)
            }
            // dx = dy where x > 0
            OpKind::ReluGrad => {
                let x = input(scope, op, 0)?;
                let dy = input(scope, op, 1)?;
                let r = x.sign()?.relu()?.mul(&dy)?;
                bind(scope, op, 0, r)
            }

            OpKind::Matmul => {
                let r = input(scope, op, 0)?.matmul(&input(scope, op, 1)?)?;
                bind(scope, op, 0, r)
            }
            OpKind::MatmulGrad => {
                let a = input(scope, op, 0)?;
                let b = input(scope, op, 1)?;
                let dc = input(scope, op, 2)?;
                let da = dc.matmul(&b.t()?)?;
                let db = a.t()?.matmul(&dc)?;
                bind(scope, op, 0, da)?;
                bind(scope, op, 1, db)
            }

            OpKind::Sum => {
                let mut acc = input(scope, op, 0)?;
                for idx in 1..op.inputs.len() {
                    acc = acc.add(&input(scope, op, idx)?)?;
                }
                bind(scope, op, 0, acc)
            }

            OpKind::FillConstant {
                shape,
                dtype,
                value,
            } => {
                let t = Tensor::full(Shape::new(shape.clone()), *value, *dtype, &self.device)?;
                bind(scope, op, 0, t)
            }

            OpKind::Recurrent(arg) => RecurrentOp::new(arg).run(self, program, scope),
            OpKind::RecurrentGrad(arg) => RecurrentGradOp::new(arg).run(self, program, scope),
        }
    }
}

fn input<B: Backend>(scope: &Scope<B>, op: &OpDesc, idx: usize) -> Result<Tensor<B>> {
    let name = op.inputs.get(idx).ok_or_else(|| {
        Error::msg(format!(
            "{} op expects an input at index {}, but only {} were given",
            op.kind.name(),
            idx,
            op.inputs.len()
        ))
    })?;
    scope.find_tensor(name)
}

fn bind<B: Backend>(scope: &Scope<B>, op: &OpDesc, idx: usize, tensor: Tensor<B>) -> Result<()> {
    let name = op.outputs.get(idx).ok_or_else(|| {
        Error::msg(format!(
            "{} op expects an output at index {}, but only {} were given",
            op.kind.name(),
            idx,
            op.outputs.len()
        ))
    })?;
    scope.set_tensor(name.clone(), tensor)
}

impl OpKind {
    /// Short operator name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Identity => "identity",
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Div => "div",
            OpKind::Neg => "neg",
            OpKind::Scale { .. } => "scale",
            OpKind::Tanh => "tanh",
            OpKind::Sigmoid => "sigmoid",
            OpKind::Relu => "relu",
            OpKind::TanhGrad => "tanh_grad",
            OpKind::SigmoidGrad => "sigmoid_grad",
            OpKind::ReluGrad => "relu_grad",
            OpKind::Matmul => "matmul",
            OpKind::MatmulGrad => "matmul_grad",
            OpKind::Sum => "sum",
            OpKind::FillConstant { .. } => "fill_constant",
            OpKind::Recurrent(_) => "recurrent",
            OpKind::RecurrentGrad(_) => "recurrent_grad",
        }
    }
}
