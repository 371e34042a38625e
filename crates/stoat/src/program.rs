use stoat_core::{DType, Error, Result};

// Program — The model description the executor runs
//
// A program is a list of blocks; a block is an ordered list of op
// descriptions. Ops are scope-driven: each one names the variables it reads
// and the variables it writes, and the executor resolves those names
// against the scope it is handed (falling through to parent scopes for
// parameters). There is no dataflow graph to schedule — a block's order is
// its execution order — which is what makes a block re-runnable against a
// fresh scope per sequence position.

/// One operator: a kind plus the named inputs it reads from the scope and
/// the named outputs it binds into the scope.
#[derive(Debug, Clone)]
pub struct OpDesc {
    pub kind: OpKind,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl OpDesc {
    pub fn new(kind: OpKind, inputs: &[&str], outputs: &[&str]) -> Self {
        OpDesc {
            kind,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// The operator set.
///
/// The `*Grad` kinds are the fused backward kernels their forward
/// counterparts pair with; [`crate::grad::grad_block`] emits them.
/// `Recurrent` / `RecurrentGrad` embed a whole recurrence as one operator
/// of the host graph — the two implementations of "run a recurrence in a
/// given direction over a given Argument".
#[derive(Debug, Clone)]
pub enum OpKind {
    /// Bind the input under the output name (zero-copy alias).
    Identity,
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    /// `out = in * factor`.
    Scale { factor: f64 },
    Tanh,
    Sigmoid,
    Relu,
    /// Inputs `[y, dy]` → `dx = dy * (1 - y^2)`.
    TanhGrad,
    /// Inputs `[y, dy]` → `dx = dy * y * (1 - y)`.
    SigmoidGrad,
    /// Inputs `[x, dy]` → `dx = dy` where `x > 0`, else 0.
    ReluGrad,
    /// 2-D matrix multiply: `[a, b]` → `c = a @ b`.
    Matmul,
    /// Inputs `[a, b, dc]` → outputs `[da, db]` with `da = dc @ bᵀ`,
    /// `db = aᵀ @ dc`.
    MatmulGrad,
    /// N-ary elementwise sum of all inputs.
    Sum,
    /// Bind a freshly allocated constant tensor under the output name.
    FillConstant {
        shape: Vec<usize>,
        dtype: DType,
        value: f64,
    },
    /// Run the forward recurrence described by the argument.
    Recurrent(Argument),
    /// Run the backward recurrence described by the argument.
    RecurrentGrad(Argument),
}

/// An ordered list of ops executed against one scope.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub ops: Vec<OpDesc>,
}

impl Block {
    pub fn new() -> Self {
        Block { ops: Vec::new() }
    }

    pub fn add(&mut self, op: OpDesc) -> &mut Self {
        self.ops.push(op);
        self
    }
}

/// A program: blocks addressed by index. Block 0 is conventionally the
/// entry block; a recurrence's step block is any other block of the same
/// program.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub blocks: Vec<Block>,
}

impl Program {
    pub fn new() -> Self {
        Program { blocks: Vec::new() }
    }

    /// Append a block, returning its id.
    pub fn add_block(&mut self, block: Block) -> usize {
        self.blocks.push(block);
        self.blocks.len() - 1
    }

    pub fn block(&self, id: usize) -> Result<&Block> {
        self.blocks
            .get(id)
            .ok_or_else(|| Error::msg(format!("program has no block {}", id)))
    }
}

// Recurrence wiring attributes

/// A name pair: what the step program calls a tensor locally, and what the
/// enclosing scope calls the corresponding sequence tensor. Lets a step
/// block use fixed local names regardless of the caller's naming.
#[derive(Debug, Clone)]
pub struct Link {
    pub internal: String,
    pub external: String,
}

impl Link {
    pub fn new(internal: impl Into<String>, external: impl Into<String>) -> Self {
        Link {
            internal: internal.into(),
            external: external.into(),
        }
    }

    /// A link whose internal and external names coincide.
    pub fn same(name: impl Into<String>) -> Self {
        let name = name.into();
        Link {
            internal: name.clone(),
            external: name,
        }
    }
}

/// Recurrent-state descriptor: the current-step state variable, the
/// previous-step slot it is read from inside the step scope, and the
/// enclosing-scope variable that seeds the very first step.
///
/// The three must denote tensors of identical per-step shape.
#[derive(Debug, Clone)]
pub struct MemoryAttr {
    /// Name of the state the step program writes.
    pub var: String,
    /// Name the step program reads the previous step's state under.
    pub pre_var: String,
    /// Enclosing-scope variable seeding step 0's `pre_var`.
    pub boot_var: String,
}

impl MemoryAttr {
    pub fn new(
        var: impl Into<String>,
        pre_var: impl Into<String>,
        boot_var: impl Into<String>,
    ) -> Self {
        MemoryAttr {
            var: var.into(),
            pre_var: pre_var.into(),
            boot_var: boot_var.into(),
        }
    }
}

/// The fully resolved bundle a recurrence runs from: the step block, the
/// sequence input/output links, the state descriptors, the parameter names,
/// the step-scope slot, and the traversal flags. Built once per invocation;
/// immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct Argument {
    /// Block id of the step program inside the enclosing program.
    pub step_block: usize,
    /// Full-sequence inputs, sliced per step into the step scope.
    pub inputs: Vec<Link>,
    /// Per-step outputs, concatenated into full-sequence aggregates.
    pub outputs: Vec<Link>,
    /// Recurrent-state descriptors.
    pub memories: Vec<MemoryAttr>,
    /// Enclosing-scope names of parameters the step block reads; the
    /// backward pass accumulates their gradients across steps.
    pub parameters: Vec<String>,
    /// Enclosing-scope variable holding the per-step scope list.
    pub step_scopes: String,
    /// Walk time indices from the end backwards instead of from the start.
    pub reverse: bool,
    /// Retain one scope per step (required for a later backward run).
    pub is_train: bool,
}
