//! Environment snapshots around steps
//!
//! Snapshots are taken through the action provider. Restoring is a best
//! effort request: navigation, scroll and cursor can usually be put back, but
//! side effects such as a submitted form cannot be undone.

use crate::dispatcher::ActionProvider;
use std::sync::Arc;
use sw_core::{StateDiff, WorldState};
use tracing::{debug, warn};

/// Captures, compares and restores [`WorldState`] snapshots
///
/// Only the current and previous snapshot are retained.
pub struct StateTracker {
    provider: Arc<dyn ActionProvider>,
    current: Option<WorldState>,
    previous: Option<WorldState>,
}

impl StateTracker {
    pub fn new(provider: Arc<dyn ActionProvider>) -> Self {
        Self {
            provider,
            current: None,
            previous: None,
        }
    }

    /// Snapshot the environment before a step
    ///
    /// A provider that cannot report state yields an empty snapshot tagged
    /// with the step, so a failing capture never fails the run.
    pub async fn capture(&mut self, step_index: usize, action: &str) -> WorldState {
        let mut state = match self.provider.capture_state().await {
            Ok(state) => state,
            Err(e) => {
                warn!(step = step_index, error = %e, "Failed to capture world state");
                WorldState::new()
            }
        };
        state.step_index = step_index;
        state.action = Some(action.to_string());

        self.previous = self.current.replace(state.clone());
        state
    }

    /// Structural difference between two snapshots
    pub fn diff(a: &WorldState, b: &WorldState) -> StateDiff {
        a.diff(b)
    }

    /// Ask the provider to return to a snapshot
    ///
    /// Returns whether the provider reported success.
    pub async fn restore(&mut self, snapshot: &WorldState) -> bool {
        match self.provider.restore_state(snapshot).await {
            Ok(()) => {
                debug!(step = snapshot.step_index, "Restored world state");
                self.previous = self.current.replace(snapshot.clone());
                true
            }
            Err(e) => {
                warn!(step = snapshot.step_index, error = %e, "Failed to restore world state");
                false
            }
        }
    }

    /// Most recent snapshot
    pub fn current(&self) -> Option<&WorldState> {
        self.current.as_ref()
    }

    /// Snapshot before the most recent one
    pub fn previous(&self) -> Option<&WorldState> {
        self.previous.as_ref()
    }

    /// Changes between the previous and current snapshot
    pub fn last_change(&self) -> Option<StateDiff> {
        match (&self.previous, &self.current) {
            (Some(a), Some(b)) => Some(a.diff(b)),
            _ => None,
        }
    }
}
