//! Core types for Stepwright
//!
//! This crate provides the fundamental types shared by the loader, the
//! expression evaluator and the interpreter: environment snapshots
//! ([`WorldState`]), resumable progress ([`Checkpoint`]), retry bookkeeping
//! ([`RetryAttempt`]) and the error taxonomy ([`ErrorKind`]).

mod checkpoint;
mod retry;
mod world_state;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use checkpoint::{Checkpoint, CheckpointError};
pub use retry::RetryAttempt;
pub use world_state::{FieldChange, Point, Size, StateDiff, WorldState};

/// Default bound on attempts per step
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Classification of every failure the engine can surface
///
/// Each crate's error type maps onto one of these kinds so that the recovery
/// engine and the run report can reason about failures uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Structurally invalid script document
    Parse,
    /// Referenced script document does not exist
    ScriptNotFound,
    /// Expression referenced an undefined name
    UndefinedVariable,
    /// Expression applied an operation to incompatible values
    TypeMismatch,
    /// Action identifier resolved to neither a built-in nor a script
    UnknownAction,
    /// The action provider (or a local built-in) reported a failure
    ActionExecution,
    /// Retry bound exceeded
    RetryExhausted,
    /// Run cancelled at a step boundary
    Cancelled,
}

impl ErrorKind {
    /// Whether a failure of this kind may be retried by the recovery engine
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::UndefinedVariable
                | ErrorKind::TypeMismatch
                | ErrorKind::UnknownAction
                | ErrorKind::ActionExecution
        )
    }

    /// Stable name used in reports and error variables
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Parse => "ParseError",
            ErrorKind::ScriptNotFound => "ScriptNotFoundError",
            ErrorKind::UndefinedVariable => "UndefinedVariableError",
            ErrorKind::TypeMismatch => "TypeMismatchError",
            ErrorKind::UnknownAction => "UnknownActionError",
            ErrorKind::ActionExecution => "ActionExecutionError",
            ErrorKind::RetryExhausted => "RetryExhaustedError",
            ErrorKind::Cancelled => "CancellationError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
