//! Retry bookkeeping

use crate::world_state::WorldState;
use crate::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One failed attempt at a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// Index of the failing step in the main list
    pub step_index: usize,

    /// 1-based attempt number
    pub attempt: u32,

    /// Failure classification
    pub error_kind: ErrorKind,

    /// Failure message
    pub message: String,

    /// Environment at the time of failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_state: Option<WorldState>,

    /// Whether a correction was applied before the next attempt
    #[serde(default)]
    pub correction_applied: bool,

    /// When the attempt failed
    pub failed_at: DateTime<Utc>,
}

impl RetryAttempt {
    pub fn new(
        step_index: usize,
        attempt: u32,
        error_kind: ErrorKind,
        message: impl Into<String>,
        world_state: Option<WorldState>,
    ) -> Self {
        Self {
            step_index,
            attempt,
            error_kind,
            message: message.into(),
            world_state,
            correction_applied: false,
            failed_at: Utc::now(),
        }
    }
}
