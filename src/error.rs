use std::{error, fmt};

/// Category of a compile failure, mirroring the public status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    /// Unterminated string, malformed number, stray character
    Lex,
    /// Grammar or indentation error
    Syntax,
    /// Identifier is neither a variable nor a builtin
    UnresolvedName,
    /// Wrong number of call arguments
    Arity,
    /// Operands cannot be promoted to a common dtype
    TypeMismatch,
    /// Requested output dtype is unreachable from the expression dtype
    TypeUnrepresentable,
}

/// A compile error with the zero-based source offset where it was detected.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub offset: usize,
    detail: String,
}

impl CompileError {
    pub(crate) fn new(kind: CompileErrorKind, offset: usize, detail: impl Into<String>) -> Self {
        Self {
            kind,
            offset,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.detail, self.offset)
    }
}

impl error::Error for CompileError {}

impl From<(crate::lex::Error, usize)> for CompileError {
    fn from((err, offset): (crate::lex::Error, usize)) -> Self {
        Self::new(CompileErrorKind::Lex, offset, err.to_string())
    }
}

/// Evaluation failures. Coarse on purpose: a dtype mismatch discovered at
/// evaluation time is a compile-step bug and reports as `Internal`.
#[derive(Debug, Clone)]
pub enum EvalError {
    /// Buffer length or dtype does not match the compiled expression
    ShapeMismatch(String),
    /// A bound variable was given no data
    MissingInput(String),
    /// Invariant violation inside the engine
    Internal(&'static str),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch(detail) => write!(f, "shape mismatch: {detail}"),
            Self::MissingInput(name) => write!(f, "no data bound for `{name}`"),
            Self::Internal(detail) => write!(f, "internal evaluator error: {detail}"),
        }
    }
}

impl error::Error for EvalError {}
