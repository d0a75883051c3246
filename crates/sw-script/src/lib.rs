//! Stepwright script interpreter
//!
//! Runs scripts loaded by `sw-loader` against a host [`ActionProvider`]:
//!
//! - [`Interpreter`] walks the step tree, keeping variables in an
//!   [`ExecutionContext`]
//! - [`ActionDispatcher`] resolves action names to built-ins or composed
//!   scripts
//! - [`StateTracker`] snapshots the environment around each step so a failed
//!   step can be rolled back and retried
//! - [`CorrectionSource`] implementations edit the script between retries
//! - [`HotReloadWatcher`] splices script edits in at step boundaries
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use serde_json::{Map, Value};
//! use sw_loader::{FileSource, ScriptLoader};
//! use sw_script::{ActionContext, ActionError, ActionProvider, Interpreter};
//!
//! struct Browser;
//!
//! #[async_trait]
//! impl ActionProvider for Browser {
//!     async fn execute(
//!         &self,
//!         action: &str,
//!         _params: &Map<String, Value>,
//!         _ctx: &ActionContext,
//!     ) -> Result<Value, ActionError> {
//!         println!("{}", action);
//!         Ok(Value::Null)
//!     }
//! }
//!
//! # async fn run() -> sw_script::EngineResult<()> {
//! let loader = ScriptLoader::new(Arc::new(FileSource::new("scripts")));
//! let interpreter = Interpreter::new(loader, Arc::new(Browser));
//! let report = interpreter.run("checkout").await?;
//! println!("{:?}", report.status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod recovery;
pub mod reload;
pub mod tracker;

pub use config::{CorrectionMode, EngineConfig};
pub use context::{ExecutionContext, ScopeKind, MAX_CALL_DEPTH};
pub use dispatcher::{
    parse_duration, ActionContext, ActionDispatcher, ActionFuture, ActionHandler, ActionProvider,
    ActionRegistry, Builtin, Invokable, PROVIDER_ACTIONS,
};
pub use error::{ActionError, EngineError, EngineResult};
pub use executor::{
    CancelHandle, Interpreter, RunFailure, RunReport, RunState, RunStatus, StepRecord, StepStatus,
};
pub use recovery::{
    Correction, CorrectionSender, CorrectionSignal, CorrectionSource, DiagnosticBundle,
    HeuristicCorrector, NoCorrection, OperatorCorrector, DEFAULT_STEP_TIMEOUT_MS,
};
pub use reload::{splice_from, HotReloadWatcher, ReloadHandle};
pub use tracker::StateTracker;
