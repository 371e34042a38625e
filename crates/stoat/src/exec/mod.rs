// Executor — runs program blocks and recurrences against scopes
//
// `engine` executes one block of a program against a scope, op by op.
// `recurrent` holds the step-scope sequencer and the two recurrence
// drivers, which the engine dispatches as ordinary operators
// (`OpKind::Recurrent` / `OpKind::RecurrentGrad`).

mod engine;
pub mod recurrent;

pub use engine::Executor;
pub use recurrent::{RecurrentGradOp, RecurrentOp, StepScopes};
