// Block differentiation — emit the backward block for a forward block
//
// Gradient variables are named by suffix: the gradient of `h` is `h@GRAD`.
// `grad_block` walks a forward block in reverse, pairing each op with its
// grad op(s). When a forward variable feeds several consumers, its gradient
// receives several contributions; those are combined with the n-ary Sum op
// rather than overwriting each other.
//
// Variables listed as *seeded* already have their gradients bound in the
// scope when the backward block runs — the block's declared outputs and its
// recurrent states, whose gradients the backward driver links in before
// execution. The first internal contribution to a seeded variable is
// therefore summed with the existing gradient, not written over it.

use std::collections::HashMap;

use stoat_core::{Error, Result};

use crate::program::{Block, OpDesc, OpKind};

/// Suffix distinguishing a gradient variable from its value variable.
pub const GRAD_SUFFIX: &str = "@GRAD";

/// The gradient variable name for a value variable.
pub fn grad_name(name: &str) -> String {
    format!("{}{}", name, GRAD_SUFFIX)
}

struct GradEmitter {
    ops: Vec<OpDesc>,
    /// Number of contributions each variable's gradient has received so
    /// far. Seeded variables start at 1.
    counts: HashMap<String, usize>,
}

impl GradEmitter {
    fn new(seeded: &[&str]) -> Self {
        GradEmitter {
            ops: Vec::new(),
            counts: seeded.iter().map(|v| (v.to_string(), 1)).collect(),
        }
    }

    /// The name the next gradient contribution for `var` should be written
    /// to, plus the Sum fixup to run afterwards when this is not the first
    /// contribution.
    fn target(&mut self, var: &str) -> (String, Option<OpDesc>) {
        let count = self.counts.entry(var.to_string()).or_insert(0);
        let grad = grad_name(var);
        if *count == 0 {
            *count = 1;
            (grad, None)
        } else {
            let tmp = format!("{}@{}", grad, *count);
            *count += 1;
            let sum = OpDesc::new(
                OpKind::Sum,
                &[grad.as_str(), tmp.as_str()],
                &[grad.as_str()],
            );
            (tmp, Some(sum))
        }
    }

    fn contribute(&mut self, var: &str, make: impl FnOnce(&str) -> OpDesc) {
        let (target, fixup) = self.target(var);
        self.ops.push(make(&target));
        if let Some(sum) = fixup {
            self.ops.push(sum);
        }
    }
}

fn arg<'a>(op: &'a OpDesc, idx: usize) -> Result<&'a str> {
    op.inputs
        .get(idx)
        .map(|s| s.as_str())
        .ok_or_else(|| Error::msg(format!("{} op is missing input {}", op.kind.name(), idx)))
}

fn out<'a>(op: &'a OpDesc, idx: usize) -> Result<&'a str> {
    op.outputs
        .get(idx)
        .map(|s| s.as_str())
        .ok_or_else(|| Error::msg(format!("{} op is missing output {}", op.kind.name(), idx)))
}

/// Build the backward block for `block`.
///
/// `seeded` names the variables whose gradients are already present in the
/// scope when the backward block runs (the block's outputs and recurrent
/// states, linked in by the backward driver). Every forward op must have a
/// differentiable kind; ops like `FillConstant` contribute nothing and are
/// skipped.
pub fn grad_block(block: &Block, seeded: &[&str]) -> Result<Block> {
    let mut emitter = GradEmitter::new(seeded);

    for op in block.ops.iter().rev() {
        match &op.kind {
            OpKind::Identity => {
                let dy = grad_name(out(op, 0)?);
                let x = arg(op, 0)?;
                emitter.contribute(x, |t| OpDesc::new(OpKind::Identity, &[dy.as_str()], &[t]));
            }
            OpKind::Add => {
                let dc = grad_name(out(op, 0)?);
                let (a, b) = (arg(op, 0)?, arg(op, 1)?);
                emitter.contribute(a, |t| OpDesc::new(OpKind::Identity, &[dc.as_str()], &[t]));
                emitter.contribute(b, |t| OpDesc::new(OpKind::Identity, &[dc.as_str()], &[t]));
            }
            OpKind::Sub => {
                let dc = grad_name(out(op, 0)?);
                let (a, b) = (arg(op, 0)?, arg(op, 1)?);
                emitter.contribute(a, |t| OpDesc::new(OpKind::Identity, &[dc.as_str()], &[t]));
                emitter.contribute(b, |t| OpDesc::new(OpKind::Neg, &[dc.as_str()], &[t]));
            }
            OpKind::Mul => {
                let dc = grad_name(out(op, 0)?);
                let (a, b) = (arg(op, 0)?, arg(op, 1)?);
                emitter.contribute(a, |t| {
                    OpDesc::new(OpKind::Mul, &[dc.as_str(), b], &[t])
                });
                emitter.contribute(b, |t| {
                    OpDesc::new(OpKind::Mul, &[dc.as_str(), a], &[t])
                });
            }
            OpKind::Neg => {
                let dy = grad_name(out(op, 0)?);
                let x = arg(op, 0)?;
                emitter.contribute(x, |t| OpDesc::new(OpKind::Neg, &[dy.as_str()], &[t]));
            }
            OpKind::Scale { factor } => {
                let dy = grad_name(out(op, 0)?);
                let x = arg(op, 0)?;
                let factor = *factor;
                emitter.contribute(x, |t| {
                    OpDesc::new(OpKind::Scale { factor }, &[dy.as_str()], &[t])
                });
            }
            OpKind::Tanh => {
                let y = out(op, 0)?;
                let dy = grad_name(y);
                let x = arg(op, 0)?;
                emitter.contribute(x, |t| {
                    OpDesc::new(OpKind::TanhGrad, &[y, dy.as_str()], &[t])
                });
            }
            OpKind::Sigmoid => {
                let y = out(op, 0)?;
                let dy = grad_name(y);
                let x = arg(op, 0)?;
                emitter.contribute(x, |t| {
                    OpDesc::new(OpKind::SigmoidGrad, &[y, dy.as_str()], &[t])
                });
            }
            OpKind::Relu => {
                let y = out(op, 0)?;
                let dy = grad_name(y);
                let x = arg(op, 0)?;
                emitter.contribute(x, |t| {
                    OpDesc::new(OpKind::ReluGrad, &[x, dy.as_str()], &[t])
                });
            }
            OpKind::Matmul => {
                let dc = grad_name(out(op, 0)?);
                let (a, b) = (arg(op, 0)?, arg(op, 1)?);
                let (ta, fixup_a) = emitter.target(a);
                let (tb, fixup_b) = emitter.target(b);
                emitter.ops.push(OpDesc::new(
                    OpKind::MatmulGrad,
                    &[a, b, dc.as_str()],
                    &[ta.as_str(), tb.as_str()],
                ));
                if let Some(sum) = fixup_a {
                    emitter.ops.push(sum);
                }
                if let Some(sum) = fixup_b {
                    emitter.ops.push(sum);
                }
            }
            OpKind::Sum => {
                let dy = grad_name(out(op, 0)?);
                for idx in 0..op.inputs.len() {
                    let x = arg(op, idx)?;
                    emitter.contribute(x, |t| {
                        OpDesc::new(OpKind::Identity, &[dy.as_str()], &[t])
                    });
                }
            }
            OpKind::FillConstant { .. } => {
                // constants take no gradient
            }
            kind => {
                return Err(Error::msg(format!(
                    "cannot differentiate a block containing a {} op",
                    kind.name()
                )))
            }
        }
    }

    Ok(Block { ops: emitter.ops })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grad_name() {
        assert_eq!(grad_name("h"), "h@GRAD");
    }

    #[test]
    fn test_single_op_block() {
        let mut block = Block::new();
        block.add(OpDesc::new(OpKind::Add, &["x", "h_pre"], &["h"]));
        let grad = grad_block(&block, &["h"]).unwrap();
        // two Identity contributions, no sums
        assert_eq!(grad.ops.len(), 2);
        assert_eq!(grad.ops[0].inputs, vec!["h@GRAD"]);
        assert_eq!(grad.ops[0].outputs, vec!["x@GRAD"]);
        assert_eq!(grad.ops[1].outputs, vec!["h_pre@GRAD"]);
    }

    #[test]
    fn test_fan_out_accumulates() {
        // h feeds two scales: its gradient must be the sum of both.
        let mut block = Block::new();
        block.add(OpDesc::new(OpKind::Scale { factor: 2.0 }, &["h"], &["y1"]));
        block.add(OpDesc::new(OpKind::Scale { factor: 3.0 }, &["h"], &["y2"]));
        let grad = grad_block(&block, &["y1", "y2"]).unwrap();
        // scale-grad, scale-grad into a temp, then the fixup sum
        assert_eq!(grad.ops.len(), 3);
        assert!(matches!(grad.ops[2].kind, OpKind::Sum));
        assert_eq!(grad.ops[2].outputs, vec!["h@GRAD"]);
    }

    #[test]
    fn test_seeded_var_sums_first_contribution() {
        // h is a recurrent state: its gradient is already linked in by the
        // driver, so the internal contribution must sum with it.
        let mut block = Block::new();
        block.add(OpDesc::new(OpKind::Scale { factor: 2.0 }, &["h"], &["y"]));
        let grad = grad_block(&block, &["y", "h"]).unwrap();
        assert_eq!(grad.ops.len(), 2);
        assert!(matches!(grad.ops[1].kind, OpKind::Sum));
        assert_eq!(grad.ops[1].inputs, vec!["h@GRAD", "h@GRAD@1"]);
    }

    #[test]
    fn test_undifferentiable_op_rejected() {
        let mut block = Block::new();
        block.add(OpDesc::new(OpKind::Div, &["a", "b"], &["c"]));
        assert!(grad_block(&block, &["c"]).is_err());
    }
}
