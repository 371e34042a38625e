// Recurrent drivers — run a step block once per sequence position
//
// The forward driver slices per-step inputs out of the full-sequence
// tensors, threads recurrent state between per-step scopes by aliasing, and
// concatenates per-step outputs into sequence aggregates. The backward
// driver walks the retained step scopes in the opposite order, merging
// state-gradient contributions and accumulating parameter gradients across
// positions.
//
// Everything here is wiring: the numeric work happens inside the step block
// (run by the Executor) and in the Sum / FillConstant ops the drivers
// invoke through the same executor.

use std::collections::HashSet;

use tracing::{debug, trace};

use stoat_core::scope::Variable;
use stoat_core::{bail, Backend, Error, Result, Scope, Tensor};

use crate::exec::engine::Executor;
use crate::grad::grad_name;
use crate::program::{Argument, Link, OpDesc, OpKind, Program};

// StepScopes — the per-position scope sequencer
//
//   cur_scope()  the scope at the cursor
//   ex_scope()   the scope one step behind the walk direction
//   next()       move the cursor (forward: +1, backward: -1)
//
// In training mode the list holds one scope per position, retained after
// the forward run so the backward run can revisit them. Outside training
// only two scopes exist and the cursor wraps: position i and position i+2
// are the physically same scope. That is a correctness constraint, not an
// optimization — a forward-only run never needs more than the two most
// recent states, and nothing may rely on older scopes surviving.

/// Sequencer over the per-step scope list stored in the enclosing scope.
pub struct StepScopes<B: Backend> {
    counter: isize,
    scopes: Vec<Scope<B>>,
    is_train: bool,
    is_backward: bool,
}

impl<B: Backend> StepScopes<B> {
    /// Attach to (backward) or populate (forward) the scope list stored
    /// under `slot` in `parent`.
    ///
    /// Forward requires the slot to be empty; it fills the slot with
    /// `seq_len` fresh child scopes when training, else two. Backward
    /// requires training mode and a list already populated by a prior
    /// forward run.
    pub fn new(
        parent: &Scope<B>,
        slot: &str,
        is_train: bool,
        seq_len: usize,
        is_backward: bool,
    ) -> Result<Self> {
        if is_backward && !is_train {
            bail!(
                "cannot run the recurrence backward when is_train is false: \
                 non-training runs retain only two step scopes"
            );
        }
        let scopes = if is_backward {
            let list = parent.find_scope_list(slot)?;
            if list.is_empty() {
                bail!(
                    "step scope list '{}' is empty: the forward pass must run first",
                    slot
                );
            }
            if list.len() != seq_len {
                bail!(
                    "step scope list '{}' holds {} scopes but the sequence length is {}",
                    slot,
                    list.len(),
                    seq_len
                );
            }
            list
        } else {
            match parent.find(slot) {
                None => {}
                Some(Variable::ScopeList(list)) if list.is_empty() => {}
                Some(Variable::ScopeList(_)) => bail!(
                    "step scope slot '{}' must be empty before a forward run",
                    slot
                ),
                Some(Variable::Tensor(_)) => {
                    return Err(Error::VarWrongKind {
                        name: slot.to_string(),
                        expected: "scope list",
                    })
                }
            }
            let count = if is_train { seq_len } else { 2 };
            let list: Vec<Scope<B>> = (0..count).map(|_| parent.new_child()).collect();
            parent.set_scope_list(slot, list.clone())?;
            list
        };
        Ok(StepScopes {
            counter: if is_backward { seq_len as isize - 1 } else { 0 },
            scopes,
            is_train,
            is_backward,
        })
    }

    /// The scope at the current cursor.
    pub fn cur_scope(&self) -> Result<&Scope<B>> {
        self.get(self.counter)
    }

    /// The scope one step behind the walk direction: cursor + 1 when
    /// walking backward, cursor - 1 when walking forward.
    pub fn ex_scope(&self) -> Result<&Scope<B>> {
        let id = if self.is_backward {
            self.counter + 1
        } else {
            self.counter - 1
        };
        self.get(id)
    }

    /// Move the cursor one position along the walk direction. After the
    /// final position the cursor sits at -1 (backward) or seq_len
    /// (forward); the caller must stop advancing there.
    pub fn next(&mut self) {
        self.counter += if self.is_backward { -1 } else { 1 };
    }

    fn get(&self, id: isize) -> Result<&Scope<B>> {
        if id < 0 {
            return Err(Error::msg(format!("step scope cursor out of range: {}", id)));
        }
        let mut idx = id as usize;
        if !self.is_train {
            idx %= 2;
        }
        self.scopes
            .get(idx)
            .ok_or_else(|| Error::msg(format!("step scope cursor out of range: {}", id)))
    }
}

/// Derive the sequence length from the common leading dimension of all
/// sequence inputs. Fails before any step runs if there are no inputs or
/// the inputs disagree.
fn sequence_length<B: Backend>(scope: &Scope<B>, inputs: &[Link]) -> Result<usize> {
    if inputs.is_empty() {
        return Err(Error::NoSequenceInputs);
    }
    let mut seq_len: Option<usize> = None;
    for link in inputs {
        let tensor = scope.find_tensor(&link.external)?;
        let dim = tensor.shape().dim(0)?;
        match seq_len {
            None => seq_len = Some(dim),
            Some(expected) if expected != dim => {
                return Err(Error::SeqLenMismatch {
                    expected,
                    got: dim,
                    input: link.external.clone(),
                })
            }
            Some(_) => {}
        }
    }
    // inputs is non-empty, so the option is set
    seq_len.ok_or(Error::NoSequenceInputs)
}

/// For each (src_name, dst_name) pair: look up src in `src_scope`, feed it
/// through the callback, bind the result under dst_name in `dst_scope`.
fn link_tensors<B, I, F>(src_scope: &Scope<B>, dst_scope: &Scope<B>, names: I, mut f: F) -> Result<()>
where
    B: Backend,
    I: Iterator<Item = (String, String)>,
    F: FnMut(&Tensor<B>) -> Result<Tensor<B>>,
{
    for (src_name, dst_name) in names {
        let tensor = src_scope.find_tensor(&src_name)?;
        dst_scope.set_tensor(dst_name, f(&tensor)?)?;
    }
    Ok(())
}

// Forward driver

/// Runs the forward recurrence described by an [`Argument`].
///
/// Per position: alias the t-th input slices into the step scope, wire the
/// previous step's state (or the boot state at position 0), execute the
/// step block, and copy the step outputs into the sequence aggregates.
/// Leaves the populated step-scope list behind in the enclosing scope.
pub struct RecurrentOp<'a> {
    arg: &'a Argument,
}

impl<'a> RecurrentOp<'a> {
    pub fn new(arg: &'a Argument) -> Self {
        RecurrentOp { arg }
    }

    pub fn run<B: Backend>(
        &self,
        exec: &Executor<B>,
        program: &Program,
        scope: &Scope<B>,
    ) -> Result<()> {
        let arg = self.arg;
        let seq_len = sequence_length(scope, &arg.inputs)?;
        debug!(seq_len, reverse = arg.reverse, "recurrent forward");

        // Resolve boot states up front: a dangling name must abort before
        // any step executes.
        for mem in &arg.memories {
            scope.find_tensor(&mem.boot_var)?;
        }

        let mut scopes = StepScopes::new(scope, &arg.step_scopes, arg.is_train, seq_len, false)?;

        for i in 0..seq_len {
            let t = if arg.reverse { seq_len - i - 1 } else { i };
            trace!(step = t, "recurrent step");
            let cur = scopes.cur_scope()?.clone();

            // outside::input[t] → inside::input, time axis dropped, aliased
            link_tensors(
                scope,
                &cur,
                arg.inputs
                    .iter()
                    .map(|l| (l.external.clone(), l.internal.clone())),
                |outside| outside.slice(t, t + 1)?.squeeze(0),
            )?;

            if i == 0 {
                // boot state → previous-state slot
                link_tensors(
                    scope,
                    &cur,
                    arg.memories
                        .iter()
                        .map(|m| (m.boot_var.clone(), m.pre_var.clone())),
                    |boot| Ok(boot.clone()),
                )?;
            } else {
                // previous step's state → this step's previous-state slot,
                // aliased so state threads through without a copy
                let ex = scopes.ex_scope()?.clone();
                link_tensors(
                    &ex,
                    &cur,
                    arg.memories
                        .iter()
                        .map(|m| (m.var.clone(), m.pre_var.clone())),
                    |state| Ok(state.clone()),
                )?;
            }

            exec.run(program, &cur, arg.step_block, false)?;

            // inside::output → outside::output[t], copied — the step scope
            // may be reused (non-training) or mutated before the caller
            // reads the aggregate
            for link in &arg.outputs {
                let inside = cur.find_tensor(&link.internal)?;
                let outside = if i == 0 {
                    let agg = Tensor::zeros(
                        inside.shape().prepend(seq_len),
                        inside.dtype(),
                        exec.device(),
                    )?;
                    scope.set_tensor(link.external.clone(), agg.clone())?;
                    agg
                } else {
                    scope.find_tensor(&link.external)?
                };
                outside.slice(t, t + 1)?.copy_from(&inside)?;
            }

            scopes.next();
        }
        Ok(())
    }
}

// Backward driver

/// Runs the backward recurrence: walks the retained step scopes in the
/// opposite order from the forward pass that built them, running the
/// differentiated step block at each position.
///
/// The state-gradient merge is the delicate part. A state's current-step
/// gradient receives the contribution flowing back from the next step's
/// previous-state slot; when the same state is also consumed directly as a
/// sequence output, the externally supplied output gradient for this
/// position must be summed in, not replaced. The sum runs through the
/// executor's Sum kernel and binds a fresh tensor — the caller's output
/// gradient sequence is never written through the alias.
///
/// Parameter accumulators are deliberately not zeroed unless the step block
/// actually produces a gradient for the parameter: a parameter untouched
/// inside the loop body leaves its external accumulator exactly as the
/// caller left it.
pub struct RecurrentGradOp<'a> {
    arg: &'a Argument,
}

impl<'a> RecurrentGradOp<'a> {
    pub fn new(arg: &'a Argument) -> Self {
        RecurrentGradOp { arg }
    }

    pub fn run<B: Backend>(
        &self,
        exec: &Executor<B>,
        program: &Program,
        scope: &Scope<B>,
    ) -> Result<()> {
        let arg = self.arg;
        let seq_len = sequence_length(scope, &arg.inputs)?;
        debug!(seq_len, reverse = arg.reverse, "recurrent backward");

        // Output-gradient sequences must resolve before any step executes.
        for link in &arg.outputs {
            scope.find_tensor(&grad_name(&link.external))?;
        }

        let mut scopes = StepScopes::new(scope, &arg.step_scopes, arg.is_train, seq_len, true)?;

        // Internal gradient names supplied directly by the caller; a state
        // whose gradient appears here is consumed by an external output too.
        let og_names: HashSet<String> = arg
            .outputs
            .iter()
            .map(|l| grad_name(&l.internal))
            .collect();

        for step_id in 0..seq_len {
            let t = if arg.reverse {
                step_id
            } else {
                seq_len - step_id - 1
            };
            trace!(step = t, "recurrent gradient step");
            let cur = scopes.cur_scope()?.clone();

            // outside::output_grad[t] → inside::output_grad, aliased
            link_tensors(
                scope,
                &cur,
                arg.outputs
                    .iter()
                    .map(|l| (grad_name(&l.external), grad_name(&l.internal))),
                |outside| outside.slice(t, t + 1)?.squeeze(0),
            )?;

            if step_id != 0 {
                // Merge state gradients from the already-processed adjacent
                // step:
                //   if the state is also an external output:
                //       cur_grad = cur_grad + ex_grad   (Sum kernel)
                //   else:
                //       cur_grad = ex_grad              (alias)
                let ex = scopes.ex_scope()?.clone();
                for mem in &arg.memories {
                    let cur_grad = grad_name(&mem.var);
                    let ex_grad = grad_name(&mem.pre_var);
                    let ex_tensor = ex.find_tensor(&ex_grad)?;
                    if og_names.contains(&cur_grad) {
                        trace!(state = %mem.var, "merging state gradient with output gradient");
                        let tmp = cur.temp_name();
                        cur.set_tensor(tmp.clone(), ex_tensor)?;
                        let sum = OpDesc::new(
                            OpKind::Sum,
                            &[cur_grad.as_str(), tmp.as_str()],
                            &[cur_grad.as_str()],
                        );
                        exec.run_op(program, &sum, &cur)?;
                    } else {
                        cur.set_tensor(cur_grad, ex_tensor)?;
                    }
                }
            } else {
                // First position visited: there is no next step, so any
                // state gradient not supplied directly starts at zero.
                for mem in &arg.memories {
                    let cur_grad = grad_name(&mem.var);
                    if !og_names.contains(&cur_grad) {
                        let state = cur.find_tensor(&mem.var)?;
                        let fill = OpDesc::new(
                            OpKind::FillConstant {
                                shape: state.dims().to_vec(),
                                dtype: state.dtype(),
                                value: 0.0,
                            },
                            &[],
                            &[cur_grad.as_str()],
                        );
                        exec.run_op(program, &fill, &cur)?;
                    }
                }
            }

            exec.run(program, &cur, arg.step_block, false)?;

            // Accumulate parameter gradients:
            //   step 0 zero-fills the external accumulator (shape taken
            //   from the first local gradient observed), then every step
            //   sums its local gradient in through the Sum kernel.
            let local_names = cur.local_names();
            for param in &arg.parameters {
                let inside_grad = grad_name(param);
                if !local_names.contains(&inside_grad) {
                    // this step's block did not touch the parameter
                    continue;
                }
                let inside = cur.find_tensor(&inside_grad)?;
                let acc_name = grad_name(param);
                if step_id == 0 {
                    let fill = OpDesc::new(
                        OpKind::FillConstant {
                            shape: inside.dims().to_vec(),
                            dtype: inside.dtype(),
                            value: 0.0,
                        },
                        &[],
                        &[acc_name.as_str()],
                    );
                    exec.run_op(program, &fill, scope)?;
                }
                let acc = scope.find_tensor(&acc_name)?;
                let tmp_acc = cur.temp_name();
                cur.set_tensor(tmp_acc.clone(), acc.clone())?;
                let tmp_out = cur.temp_name();
                let sum = OpDesc::new(
                    OpKind::Sum,
                    &[tmp_acc.as_str(), inside_grad.as_str()],
                    &[tmp_out.as_str()],
                );
                exec.run_op(program, &sum, &cur)?;
                acc.copy_from(&cur.find_tensor(&tmp_out)?)?;
            }

            // inside::input_grad → outside::input_grad[t], copied
            for link in &arg.inputs {
                let inside = cur.find_tensor(&grad_name(&link.internal))?;
                let outside_name = grad_name(&link.external);
                let outside = if step_id == 0 {
                    let agg = Tensor::zeros(
                        inside.shape().prepend(seq_len),
                        inside.dtype(),
                        exec.device(),
                    )?;
                    scope.set_tensor(outside_name.clone(), agg.clone())?;
                    agg
                } else {
                    scope.find_tensor(&outside_name)?
                };
                outside.slice(t, t + 1)?.copy_from(&inside)?;
            }

            // Last position visited: the previous-state gradients are the
            // gradients of the boot states, flowing out of the recurrence.
            if step_id + 1 == seq_len {
                for mem in &arg.memories {
                    let inside = cur.find_tensor(&grad_name(&mem.pre_var))?;
                    let outside = Tensor::zeros_like(&inside)?;
                    outside.copy_from(&inside)?;
                    scope.set_tensor(grad_name(&mem.boot_var), outside)?;
                }
            }

            scopes.next();
        }
        Ok(())
    }
}
