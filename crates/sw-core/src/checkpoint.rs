//! Resumable progress
//!
//! A [`Checkpoint`] is produced when a run stops (successfully or not) and can
//! be fed back to start a new run at the recorded step.

use crate::world_state::WorldState;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors reading or writing checkpoint files
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to access checkpoint {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid checkpoint {}: {source}", path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// The unit of resumable progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Index of the next main-list step to execute
    pub step_index: usize,

    /// Visible variables at the boundary
    #[serde(default)]
    pub variables: IndexMap<String, Value>,

    /// Last known environment snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_state: Option<WorldState>,
}

impl Checkpoint {
    pub fn new(
        step_index: usize,
        variables: IndexMap<String, Value>,
        world_state: Option<WorldState>,
    ) -> Self {
        Self {
            step_index,
            variables,
            world_state,
        }
    }

    /// Write the checkpoint as pretty-printed JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).map_err(|e| CheckpointError::Format {
            path: path.to_path_buf(),
            source: e,
        })?;
        fs::write(path, content).map_err(|e| CheckpointError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Read a checkpoint written by [`Checkpoint::save`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| CheckpointError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| CheckpointError::Format {
            path: path.to_path_buf(),
            source: e,
        })
    }
}
