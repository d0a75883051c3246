//! Error types for script execution

use serde_json::{json, Value};
use sw_core::{CheckpointError, ErrorKind};
use sw_expr::ExprError;
use sw_loader::LoaderError;
use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Failure reported by an action provider
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActionError {
    /// Target element or resource could not be resolved
    #[error("target not found: {target}")]
    NotFound { target: String },

    /// The action did not complete in time
    #[error("timed out: {message}")]
    Timeout { message: String },

    /// An assertion about the environment did not hold
    #[error("assertion failed: {message}")]
    Assertion { message: String },

    /// Any other provider failure
    #[error("{message}")]
    Failed { message: String },
}

impl ActionError {
    /// Short machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            ActionError::NotFound { .. } => "not_found",
            ActionError::Timeout { .. } => "timeout",
            ActionError::Assertion { .. } => "assertion",
            ActionError::Failed { .. } => "failed",
        }
    }
}

/// Script execution errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Load(#[from] LoaderError),

    #[error(transparent)]
    Expression(#[from] ExprError),

    /// Action identifier is neither a built-in nor a script
    #[error("unknown action '{action}'{}", suggestion.as_ref().map(|s| format!(" (did you mean '{}'?)", s)).unwrap_or_default())]
    UnknownAction {
        action: String,
        suggestion: Option<String>,
    },

    /// The provider or a built-in reported a failure
    #[error("action '{action}' failed: {source}")]
    Action {
        action: String,
        #[source]
        source: ActionError,
    },

    /// A non-optional step's condition was not met
    #[error("condition not met: {condition}")]
    ConditionFailed { condition: String },

    /// Raised by the `fail` action
    #[error("{message}")]
    Raised { message: String },

    /// Composed scripts nested too deeply
    #[error("call depth exceeded ({depth}) invoking '{script}'")]
    CallDepth { script: String, depth: usize },

    /// Retry bound reached for a step
    #[error("step {step_index} ({action}) failed after {attempts} attempts: {last}")]
    RetryExhausted {
        step_index: usize,
        action: String,
        attempts: u32,
        #[source]
        last: Box<EngineError>,
    },

    /// Run cancelled at a step boundary
    #[error("run cancelled before step {step_index}")]
    Cancelled { step_index: usize },

    /// Operator aborted while a correction was awaited
    #[error("run aborted by operator at step {step_index}")]
    Aborted { step_index: usize },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Invalid engine configuration
    #[error("invalid configuration: {message}")]
    Config { message: String },
}

impl EngineError {
    /// Classification in the engine-wide taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Load(e) => e.kind(),
            EngineError::Expression(e) => e.kind(),
            EngineError::UnknownAction { .. } => ErrorKind::UnknownAction,
            EngineError::Action { .. }
            | EngineError::ConditionFailed { .. }
            | EngineError::Raised { .. }
            | EngineError::CallDepth { .. } => ErrorKind::ActionExecution,
            EngineError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            EngineError::Cancelled { .. } | EngineError::Aborted { .. } => ErrorKind::Cancelled,
            EngineError::Checkpoint(_) | EngineError::Config { .. } => ErrorKind::Parse,
        }
    }

    /// Whether the recovery loop may retry the failing step
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Whether an enclosing `try` may catch this error
    ///
    /// Cancellation, operator aborts and exhausted retries end the run.
    pub fn is_catchable(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::Cancelled | ErrorKind::RetryExhausted
        )
    }

    /// Provider failure, if this error wraps one
    pub fn action_error(&self) -> Option<&ActionError> {
        match self {
            EngineError::Action { source, .. } => Some(source),
            EngineError::RetryExhausted { last, .. } => last.action_error(),
            _ => None,
        }
    }

    /// Action identifier involved in the failure, if known
    pub fn action(&self) -> Option<&str> {
        match self {
            EngineError::UnknownAction { action, .. }
            | EngineError::Action { action, .. }
            | EngineError::RetryExhausted { action, .. } => Some(action),
            _ => None,
        }
    }

    /// Error information bound to a `catch` variable
    pub fn to_value(&self, step_index: usize) -> Value {
        let mut info = json!({
            "kind": self.kind().as_str(),
            "message": self.to_string(),
            "step": step_index,
            "action": self.action(),
        });
        if let Some(reason) = self.action_error().map(ActionError::reason) {
            info["reason"] = Value::from(reason);
        }
        info
    }
}
