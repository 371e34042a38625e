use crate::shape::Shape;

/// All errors that can occur within Stoat.
///
/// One error type across the workspace keeps propagation simple: tensor
/// primitives, scope lookups, and the recurrence drivers all return
/// `Result<T, Error>` and compose with `?`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors in an elementwise operation.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// DType mismatch between tensors in a binary operation or copy.
    #[error("dtype mismatch: expected {expected:?}, got {got:?}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Narrow/slice operation out of bounds.
    #[error("narrow out of bounds: dim {dim}, start {start}, len {len}, dim_size {dim_size}")]
    NarrowOutOfBounds {
        dim: usize,
        start: usize,
        len: usize,
        dim_size: usize,
    },

    /// Element count mismatch when creating a tensor or copying between views.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Matrix multiplication dimension mismatch.
    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}] — inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// A named variable was not found in the scope chain.
    #[error("variable '{name}' not found in scope")]
    VarNotFound { name: String },

    /// A variable exists but holds the wrong kind of value
    /// (e.g. a step-scope list where a tensor was expected).
    #[error("variable '{name}' is not a {expected}")]
    VarWrongKind {
        name: String,
        expected: &'static str,
    },

    /// Two sequence inputs disagree on their leading-axis extent.
    #[error(
        "sequence length mismatch: input '{input}' has leading dim {got}, expected {expected}"
    )]
    SeqLenMismatch {
        expected: usize,
        got: usize,
        input: String,
    },

    /// A recurrence was asked to run with no sequence inputs, so the
    /// sequence length cannot be determined.
    #[error("recurrence has no sequence inputs to derive a sequence length from")]
    NoSequenceInputs,

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout Stoat.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
