//! Error types for map construction, pullback and evaluation.

use thiserror::Error;

/// Errors raised by the pullback engine.
///
/// Construction-time failures (`DimensionMismatch`, `NotASymbol`, ...) are
/// reported before any numeric work happens; `SingularMetric` is the only
/// condition that depends on the numeric state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Source/target sizes disagree, or an argument has the wrong length.
    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Where the mismatch was detected.
        context: String,
        /// Expected size.
        expected: usize,
        /// Actual size.
        actual: usize,
    },

    /// `evaluate()` was called before `concretize()`.
    #[error("evaluate() called before concretize()")]
    UnconcretizedEvaluation,

    /// The linear solve `M xddot = -f` failed numerically.
    #[error("metric is singular: pivot ratio {ratio:e} is below tolerance {tolerance:e}")]
    SingularMetric {
        /// Smallest over largest LU pivot magnitude.
        ratio: f64,
        /// Configured threshold.
        tolerance: f64,
    },

    /// The forcing `f` evaluated to NaN or infinity; the metric is not at
    /// fault.
    #[error("forcing term is not finite at entry {index}: {value}")]
    NonFiniteForcing {
        /// First offending entry of `f`.
        index: usize,
        /// Its value.
        value: f64,
    },

    /// A variable vector contains something other than plain symbols.
    #[error("expected a symbolic variable, found `{0}`")]
    NotASymbol(String),

    /// An output references a symbol that is not a declared input.
    #[error("expression references `{0}`, which is not a declared variable")]
    UnboundSymbol(String),

    /// Two objects live on different spaces and cannot be combined.
    #[error("incompatible spaces: {0}")]
    IncompatibleSpaces(String),

    /// Wrong number of positional argument groups.
    #[error("expected {expected} argument groups, got {actual}")]
    ArgumentCount {
        /// Number of declared variable groups.
        expected: usize,
        /// Number of groups passed.
        actual: usize,
    },

    /// Textual expression could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// Settings failed validation.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// A compiled program underflowed its stack or referenced a missing slot.
    #[error("malformed bytecode: {0}")]
    InvalidBytecode(&'static str),
}

impl EngineError {
    /// Creates a dimension mismatch error.
    #[must_use]
    pub fn dimension(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;
