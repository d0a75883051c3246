//! Error types for script loading

use std::path::PathBuf;
use sw_core::ErrorKind;
use sw_expr::ExprError;
use thiserror::Error;

/// Result type for loader operations
pub type LoaderResult<T> = Result<T, LoaderError>;

/// Errors that can occur while loading and resolving scripts
#[derive(Debug, Error)]
pub enum LoaderError {
    /// Referenced script does not exist
    #[error("script not found: {reference}")]
    NotFound { reference: String },

    /// Failed to read a script file
    #[error("failed to read script {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to persist a script
    #[error("failed to write script {reference}: {message}")]
    Store { reference: String, message: String },

    /// Failed to parse YAML
    #[error("failed to parse YAML in {reference}: {source}")]
    Yaml {
        reference: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// Document structure is invalid
    #[error("invalid script {reference}: {message}")]
    InvalidDocument { reference: String, message: String },

    /// A step is structurally invalid
    #[error("invalid step {path} in {reference}: {message}")]
    InvalidStep {
        reference: String,
        path: String,
        message: String,
    },

    /// An embedded expression does not parse
    #[error("invalid expression at {path} in {reference}: {source}")]
    Expression {
        reference: String,
        path: String,
        #[source]
        source: ExprError,
    },

    /// Cycle through `extends` or `include`
    #[error("circular reference: {chain}")]
    CircularReference { chain: String },

    /// Composed script requires a parameter the caller did not supply
    #[error("script {reference} requires parameter '{param}'")]
    MissingParameter { reference: String, param: String },
}

impl LoaderError {
    pub(crate) fn step(
        reference: &str,
        path: &str,
        message: impl Into<String>,
    ) -> Self {
        LoaderError::InvalidStep {
            reference: reference.to_string(),
            path: path.to_string(),
            message: message.into(),
        }
    }

    /// Classification in the engine-wide taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoaderError::NotFound { .. } => ErrorKind::ScriptNotFound,
            _ => ErrorKind::Parse,
        }
    }

    /// Whether re-reading the source may succeed
    ///
    /// A script being written concurrently can be observed half-written, so
    /// every read or structural failure is worth another attempt. A persisted
    /// write failure is not. A missing script is not transient on its own;
    /// the loader retries it only for references it has read before.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            LoaderError::NotFound { .. } | LoaderError::Store { .. }
        )
    }
}
