//! Script loading for Stepwright
//!
//! This crate turns YAML script documents into resolved step trees:
//!
//! - [`ScriptSource`] abstracts where scripts live ([`FileSource`],
//!   [`MemorySource`])
//! - [`ScriptLoader`] parses documents, classifies every step into a
//!   [`StepKind`] and resolves `extends` and `include`/`compose`
//! - [`ScriptLoader::load_tolerant`] re-reads scripts that are observed
//!   mid-edit
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use sw_loader::{MemorySource, ScriptLoader};
//!
//! let source = MemorySource::new();
//! source.insert("smoke", "steps:\n  - action: navigate\n    url: /home\n");
//!
//! let loader = ScriptLoader::new(Arc::new(source));
//! let script = loader.load("smoke").unwrap();
//! assert_eq!(script.steps.len(), 1);
//! ```

mod document;
mod error;
mod loader;
mod parse;
mod source;
mod step;

pub use document::{IncludeRef, ScriptDocument};
pub use error::{LoaderError, LoaderResult};
pub use loader::{ScriptLoader, DEFAULT_READ_ATTEMPTS, DEFAULT_READ_RETRY_DELAY};
pub use source::{fingerprint_of, FileSource, MemorySource, ScriptSource};
pub use step::{
    AssignValue, Assignment, Branch, Composition, LoopBinding, Section, Step, StepKind, StepOrigin,
};
