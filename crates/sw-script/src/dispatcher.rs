//! Action dispatch
//!
//! Action identifiers resolve through two tiers: the [`ActionRegistry`] of
//! built-in capabilities, then the script loader, which treats the identifier
//! as the name of a composed script. Interactive built-ins are delegated to
//! the host's [`ActionProvider`].

use crate::error::{ActionError, EngineError, EngineResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use sw_core::WorldState;
use sw_loader::{Composition, ScriptLoader};
use tracing::{debug, info, instrument};

/// Actions delegated to the provider by default
pub const PROVIDER_ACTIONS: [&str; 13] = [
    "navigate",
    "click",
    "double_click",
    "type",
    "press",
    "hover",
    "select",
    "scroll",
    "wait_for",
    "assert_text",
    "assert_visible",
    "screenshot",
    "wait",
];

/// Common alternative spellings and their canonical action
const DEFAULT_SYNONYMS: [(&str, &str); 14] = [
    ("tap", "click"),
    ("press_button", "click"),
    ("dblclick", "double_click"),
    ("goto", "navigate"),
    ("open", "navigate"),
    ("visit", "navigate"),
    ("fill", "type"),
    ("input", "type"),
    ("enter_text", "type"),
    ("key", "press"),
    ("mouse_over", "hover"),
    ("choose", "select"),
    ("pause", "sleep"),
    ("capture", "screenshot"),
];

/// Where a dispatched action runs
#[derive(Debug, Clone, Serialize)]
pub struct ActionContext {
    /// Script the step belongs to
    pub script: String,
    /// Top-level step index
    pub step_index: usize,
    /// Attempt number, starting at 1
    pub attempt: u32,
}

/// Host capability that performs interactive actions
///
/// Providers must tolerate being asked to perform the same step more than
/// once: a failed step is retried after the environment is rolled back.
#[async_trait]
pub trait ActionProvider: Send + Sync {
    /// Perform an action
    async fn execute(
        &self,
        action: &str,
        params: &Map<String, Value>,
        ctx: &ActionContext,
    ) -> Result<Value, ActionError>;

    /// Snapshot the environment
    async fn capture_state(&self) -> Result<WorldState, ActionError> {
        Ok(WorldState::new())
    }

    /// Return the environment to a snapshot, best effort
    async fn restore_state(&self, _state: &WorldState) -> Result<(), ActionError> {
        Ok(())
    }

    /// Free-form dump of the environment for diagnostics
    async fn environment_dump(&self) -> Option<String> {
        None
    }
}

/// Future returned by a local action handler
pub type ActionFuture = Pin<Box<dyn Future<Output = Result<Value, ActionError>> + Send>>;

/// Local action handler
pub type ActionHandler = Arc<dyn Fn(Map<String, Value>) -> ActionFuture + Send + Sync>;

/// How a registered action is performed
#[derive(Clone)]
pub enum Builtin {
    /// Delegated to the action provider
    Provider,
    /// Write `message` to the log
    Log,
    /// Pause for `ms`, `seconds` or `duration`
    Sleep,
    /// Fail unless `that` is truthy
    Assert,
    /// Fail with `message`
    Fail,
    /// Host-registered handler
    Handler(ActionHandler),
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Builtin::Provider => f.write_str("Provider"),
            Builtin::Log => f.write_str("Log"),
            Builtin::Sleep => f.write_str("Sleep"),
            Builtin::Assert => f.write_str("Assert"),
            Builtin::Fail => f.write_str("Fail"),
            Builtin::Handler(_) => f.write_str("Handler"),
        }
    }
}

/// Registry of built-in action names
pub struct ActionRegistry {
    actions: DashMap<String, Builtin>,
    synonyms: DashMap<String, String>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ActionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            actions: DashMap::new(),
            synonyms: DashMap::new(),
        }
    }

    /// Registry with the standard vocabulary
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for name in PROVIDER_ACTIONS {
            registry.register(name, Builtin::Provider);
        }
        registry.register("log", Builtin::Log);
        registry.register("sleep", Builtin::Sleep);
        registry.register("assert", Builtin::Assert);
        registry.register("fail", Builtin::Fail);
        for (alias, target) in DEFAULT_SYNONYMS {
            registry.add_synonym(alias, target);
        }
        registry
    }

    /// Register an action
    #[instrument(skip(self, name, builtin))]
    pub fn register(&self, name: impl Into<String>, builtin: Builtin) {
        let name = name.into();
        debug!(action = %name, kind = ?builtin, "Registering action");
        self.actions.insert(name, builtin);
    }

    /// Register a local handler
    pub fn register_handler<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActionError>> + Send + 'static,
    {
        let handler: ActionHandler = Arc::new(move |params| Box::pin(handler(params)) as ActionFuture);
        self.register(name, Builtin::Handler(handler));
    }

    /// Record an alternative spelling for an action
    pub fn add_synonym(&self, alias: impl Into<String>, target: impl Into<String>) {
        self.synonyms.insert(alias.into(), target.into());
    }

    /// Remove an action
    pub fn unregister(&self, name: &str) -> bool {
        self.actions.remove(name).is_some()
    }

    /// Check if an action is registered
    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Look up a registered action
    pub fn lookup(&self, name: &str) -> Option<Builtin> {
        self.actions.get(name).map(|entry| entry.value().clone())
    }

    /// Registered action names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Suggest a registered action for an unknown name
    ///
    /// Tries the name with normalised case and separators, then the synonym
    /// table under the same normalisation.
    pub fn suggest(&self, name: &str) -> Option<String> {
        let normalized = normalize(name);
        if self.contains(&normalized) {
            return Some(normalized);
        }
        let target = self
            .synonyms
            .get(name)
            .or_else(|| self.synonyms.get(&normalized))
            .map(|t| t.value().clone())?;
        self.contains(&target).then_some(target)
    }
}

fn normalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, c) in name.trim().chars().enumerate() {
        match c {
            '-' | ' ' | '.' => out.push('_'),
            c if c.is_uppercase() => {
                if i > 0 && !out.ends_with('_') {
                    out.push('_');
                }
                out.extend(c.to_lowercase());
            }
            c => out.push(c),
        }
    }
    out
}

/// Result of resolving an action identifier
#[derive(Debug, Clone)]
pub enum Invokable {
    /// A registered action
    Builtin { name: String, builtin: Builtin },
    /// A composed script
    Script(Composition),
}

/// Resolves and performs actions
pub struct ActionDispatcher {
    registry: Arc<ActionRegistry>,
    provider: Arc<dyn ActionProvider>,
    loader: ScriptLoader,
}

impl ActionDispatcher {
    pub fn new(
        registry: Arc<ActionRegistry>,
        provider: Arc<dyn ActionProvider>,
        loader: ScriptLoader,
    ) -> Self {
        Self {
            registry,
            provider,
            loader,
        }
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    pub fn provider(&self) -> &Arc<dyn ActionProvider> {
        &self.provider
    }

    pub fn loader(&self) -> &ScriptLoader {
        &self.loader
    }

    /// Resolve an action identifier
    #[instrument(skip(self, params))]
    pub fn resolve(&self, name: &str, params: &Map<String, Value>) -> EngineResult<Invokable> {
        if let Some(builtin) = self.registry.lookup(name) {
            return Ok(Invokable::Builtin {
                name: name.to_string(),
                builtin,
            });
        }

        if self.loader.exists(name) {
            debug!(action = %name, "Resolving action as composed script");
            let composition = self.loader.resolve_composition(name, params.clone())?;
            return Ok(Invokable::Script(composition));
        }

        Err(EngineError::UnknownAction {
            action: name.to_string(),
            suggestion: self.registry.suggest(name),
        })
    }

    /// Perform a registered action
    pub async fn invoke(
        &self,
        name: &str,
        builtin: &Builtin,
        params: Map<String, Value>,
        ctx: &ActionContext,
    ) -> EngineResult<Value> {
        let failed = |source| EngineError::Action {
            action: name.to_string(),
            source,
        };

        match builtin {
            Builtin::Provider => {
                debug!(action = %name, step = ctx.step_index, attempt = ctx.attempt, "Dispatching to provider");
                self.provider
                    .execute(name, &params, ctx)
                    .await
                    .map_err(failed)
            }
            Builtin::Log => {
                let message = params
                    .get("message")
                    .map(sw_expr::to_display)
                    .unwrap_or_default();
                info!(script = %ctx.script, step = ctx.step_index, "{}", message);
                Ok(Value::Null)
            }
            Builtin::Sleep => {
                let duration = sleep_duration(&params).ok_or_else(|| {
                    failed(ActionError::Failed {
                        message: "sleep needs 'ms', 'seconds' or 'duration'".to_string(),
                    })
                })?;
                tokio::time::sleep(duration).await;
                Ok(Value::Null)
            }
            Builtin::Assert => {
                let holds = params
                    .get("that")
                    .or_else(|| params.get("condition"))
                    .map(sw_expr::is_truthy)
                    .unwrap_or(false);
                if holds {
                    Ok(Value::Bool(true))
                } else {
                    let message = params
                        .get("message")
                        .map(sw_expr::to_display)
                        .unwrap_or_else(|| "assertion does not hold".to_string());
                    Err(failed(ActionError::Assertion { message }))
                }
            }
            Builtin::Fail => Err(EngineError::Raised {
                message: params
                    .get("message")
                    .map(sw_expr::to_display)
                    .unwrap_or_else(|| "failed".to_string()),
            }),
            Builtin::Handler(handler) => handler(params).await.map_err(failed),
        }
    }
}

fn sleep_duration(params: &Map<String, Value>) -> Option<Duration> {
    if let Some(ms) = params.get("ms").and_then(number) {
        return Some(Duration::from_secs_f64(ms.max(0.0) / 1000.0));
    }
    if let Some(secs) = params.get("seconds").and_then(number) {
        return Some(Duration::from_secs_f64(secs.max(0.0)));
    }
    params
        .get("duration")
        .and_then(Value::as_str)
        .and_then(parse_duration)
}

fn number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    n.filter(|f| f.is_finite())
}

/// Parse `250ms`, `1.5s`, `2m`, `MM:SS`, `HH:MM:SS` or plain seconds
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();

    let scaled = |n: &str, factor: f64| {
        n.trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| Duration::from_secs_f64(v * factor))
    };
    if let Some(ms) = s.strip_suffix("ms") {
        return scaled(ms, 0.001);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return scaled(secs, 1.0);
    }
    if let Some(mins) = s.strip_suffix('m') {
        return scaled(mins, 60.0);
    }

    // Try as seconds
    if s.parse::<f64>().is_ok() {
        return scaled(s, 1.0);
    }

    // Try as HH:MM:SS
    let parts: Vec<&str> = s.split(':').collect();
    match parts.len() {
        2 => {
            let mins: u64 = parts[0].parse().ok()?;
            let secs: u64 = parts[1].parse().ok()?;
            Some(Duration::from_secs(mins * 60 + secs))
        }
        3 => {
            let hours: u64 = parts[0].parse().ok()?;
            let mins: u64 = parts[1].parse().ok()?;
            let secs: u64 = parts[2].parse().ok()?;
            Some(Duration::from_secs(hours * 3600 + mins * 60 + secs))
        }
        _ => None,
    }
}
