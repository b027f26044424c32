use thiserror::Error;

/// Errors surfaced by statement validation, classification, code generation,
/// caching, and execution.
///
/// All failure modes are expected, caller-handleable outcomes; nothing in this
/// crate retries internally.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeneratorError {
    /// The statement contains a construct no template or fused primitive
    /// covers. The message names the offending construct.
    #[error("unsupported statement shape: {construct}")]
    UnsupportedShape { construct: String },

    /// A profile violates its divisibility or width preconditions, either on
    /// its own fields or against the operands it is asked to generate for.
    #[error("invalid profile `{repr}`: {reason}")]
    InvalidProfile { repr: String, reason: String },

    /// The argument list recorded at generation time disagrees with what the
    /// enqueuer resolved. Indicates a defect in this crate, not caller error.
    #[error("generation/enqueue mismatch: {detail}")]
    InternalMismatch { detail: String },
}

impl GeneratorError {
    pub fn unsupported(construct: impl Into<String>) -> Self {
        GeneratorError::UnsupportedShape {
            construct: construct.into(),
        }
    }

    pub fn invalid_profile(repr: impl Into<String>, reason: impl Into<String>) -> Self {
        GeneratorError::InvalidProfile {
            repr: repr.into(),
            reason: reason.into(),
        }
    }

    pub fn mismatch(detail: impl Into<String>) -> Self {
        GeneratorError::InternalMismatch {
            detail: detail.into(),
        }
    }
}

pub type GeneratorResult<T> = Result<T, GeneratorError>;
