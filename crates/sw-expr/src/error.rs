//! Error types for expression evaluation

use minijinja::ErrorKind as JinjaErrorKind;
use sw_core::ErrorKind;
use thiserror::Error;

/// Result type for expression operations
pub type ExprResult<T> = Result<T, ExprError>;

/// Errors that can occur while compiling or evaluating expressions
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    /// Malformed expression or template
    #[error("syntax error at offset {position}: {message}")]
    Syntax { message: String, position: usize },

    /// Undefined variable, attribute or index
    #[error("undefined variable: {name}")]
    UndefinedVariable { name: String },

    /// Operation applied to incompatible values, or a bad function argument
    #[error("type mismatch: {message}")]
    TypeMismatch { message: String },

    /// Call to a function or filter that does not exist
    #[error("unknown function: {name}")]
    UnknownFunction { name: String },

    /// Arithmetic produced infinity or NaN
    #[error("arithmetic result is not a finite number")]
    NotFinite,
}

impl ExprError {
    pub(crate) fn syntax(message: impl Into<String>, position: usize) -> Self {
        ExprError::Syntax {
            message: message.into(),
            position,
        }
    }

    pub(crate) fn type_mismatch(message: impl Into<String>) -> Self {
        ExprError::TypeMismatch {
            message: message.into(),
        }
    }

    /// Map a minijinja error for the expression `src`
    ///
    /// `missing` holds the top-level names the evaluation looked up without
    /// finding them. A failure that touched one of them is reported as that
    /// undefined variable, whatever operation tripped over it.
    pub(crate) fn from_jinja(err: minijinja::Error, src: &str, missing: &[String]) -> Self {
        let message = err
            .detail()
            .map(str::to_string)
            .unwrap_or_else(|| err.kind().to_string());

        match err.kind() {
            JinjaErrorKind::SyntaxError => ExprError::Syntax {
                message,
                position: err.range().map(|r| r.start).unwrap_or(0),
            },
            JinjaErrorKind::UnknownFunction => ExprError::UnknownFunction {
                name: missing.first().cloned().unwrap_or(message),
            },
            JinjaErrorKind::UnknownFilter | JinjaErrorKind::UnknownTest => {
                ExprError::UnknownFunction { name: message }
            }
            _ if !missing.is_empty() => ExprError::UndefinedVariable {
                name: missing[0].clone(),
            },
            JinjaErrorKind::UndefinedError => ExprError::UndefinedVariable {
                name: src.trim().to_string(),
            },
            _ => ExprError::TypeMismatch { message },
        }
    }

    /// Classification in the engine-wide taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExprError::Syntax { .. } => ErrorKind::Parse,
            ExprError::UndefinedVariable { .. } | ExprError::UnknownFunction { .. } => {
                ErrorKind::UndefinedVariable
            }
            ExprError::TypeMismatch { .. } | ExprError::NotFinite => ErrorKind::TypeMismatch,
        }
    }
}
