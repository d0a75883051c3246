//! Common test utilities for the interpreter
//!
//! A scripted action provider that records every call, can be told to fail,
//! and keeps a tiny "environment" (a location and the last action) so that
//! snapshots and rollbacks can be observed.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Once};
use sw_core::WorldState;
use sw_loader::{MemorySource, ScriptLoader};
use sw_script::{ActionContext, ActionError, ActionProvider, CorrectionMode, EngineConfig, Interpreter};

static TRACING: Once = Once::new();

/// Route engine logs to the test output, filtered by `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A dispatched action
#[derive(Debug, Clone)]
pub struct Call {
    pub action: String,
    pub params: Map<String, Value>,
    pub step_index: usize,
    pub attempt: u32,
}

type Hook = Arc<dyn Fn(&Map<String, Value>) + Send + Sync>;

/// Scripted action provider
#[derive(Default)]
pub struct MockProvider {
    calls: Mutex<Vec<Call>>,
    location: Mutex<String>,
    last_action: Mutex<Option<String>>,
    failures: Mutex<HashMap<String, VecDeque<ActionError>>>,
    always_failing: Mutex<HashSet<String>>,
    hooks: Mutex<HashMap<String, Hook>>,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `times` calls of an action
    pub fn fail_next(&self, action: &str, times: usize, error: ActionError) {
        let mut failures = self.failures.lock().unwrap();
        let queue = failures.entry(action.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Fail every call of an action
    pub fn always_fail(&self, action: &str) {
        self.always_failing.lock().unwrap().insert(action.to_string());
    }

    /// Run `hook` each time `action` is dispatched, before it completes
    pub fn on_execute<F>(&self, action: &str, hook: F)
    where
        F: Fn(&Map<String, Value>) + Send + Sync + 'static,
    {
        self.hooks
            .lock()
            .unwrap()
            .insert(action.to_string(), Arc::new(hook));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Dispatched action names, in order
    pub fn actions(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.action).collect()
    }

    /// Number of dispatches of one action
    pub fn count(&self, action: &str) -> usize {
        self.calls().iter().filter(|c| c.action == action).count()
    }

    /// Values of one parameter across dispatches of an action
    pub fn param_values(&self, action: &str, param: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|c| c.action == action)
            .filter_map(|c| c.params.get(param).cloned())
            .collect()
    }

    pub fn location(&self) -> String {
        self.location.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionProvider for MockProvider {
    async fn execute(
        &self,
        action: &str,
        params: &Map<String, Value>,
        ctx: &ActionContext,
    ) -> Result<Value, ActionError> {
        self.calls.lock().unwrap().push(Call {
            action: action.to_string(),
            params: params.clone(),
            step_index: ctx.step_index,
            attempt: ctx.attempt,
        });

        let hook = self.hooks.lock().unwrap().get(action).cloned();
        if let Some(hook) = hook {
            hook(params);
        }

        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(action)
            .and_then(VecDeque::pop_front);
        let failure = scripted.or_else(|| {
            self.always_failing
                .lock()
                .unwrap()
                .contains(action)
                .then(|| ActionError::Failed {
                    message: format!("{} always fails", action),
                })
        });
        if let Some(error) = failure {
            // a failed attempt leaves the environment disturbed
            *self.location.lock().unwrap() = "/error".to_string();
            return Err(error);
        }

        if action == "navigate" {
            if let Some(url) = params.get("url").and_then(Value::as_str) {
                *self.location.lock().unwrap() = url.to_string();
            }
        }
        *self.last_action.lock().unwrap() = Some(action.to_string());
        Ok(json!({ "action": action }))
    }

    async fn capture_state(&self) -> Result<WorldState, ActionError> {
        Ok(WorldState::new()
            .with_location(self.location())
            .with_metadata("last_action", json!(*self.last_action.lock().unwrap())))
    }

    async fn restore_state(&self, state: &WorldState) -> Result<(), ActionError> {
        *self.location.lock().unwrap() = state.location.clone().unwrap_or_default();
        *self.last_action.lock().unwrap() = state
            .metadata
            .get("last_action")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(())
    }

    async fn environment_dump(&self) -> Option<String> {
        Some(format!("location={}", self.location()))
    }
}

/// Engine settings for fast tests
pub fn fast_config(correction: CorrectionMode) -> EngineConfig {
    EngineConfig {
        correction,
        poll_interval_ms: 5,
        read_retry_delay_ms: 1,
        ..EngineConfig::default()
    }
}

/// Scripts held in memory
pub fn memory_source(scripts: &[(&str, &str)]) -> Arc<MemorySource> {
    let source = Arc::new(MemorySource::new());
    for (name, content) in scripts {
        source.insert(*name, *content);
    }
    source
}

/// Interpreter over in-memory scripts and a fresh mock provider
pub fn interpreter(
    scripts: &[(&str, &str)],
    correction: CorrectionMode,
) -> (Interpreter, Arc<MockProvider>, Arc<MemorySource>) {
    init_tracing();
    let source = memory_source(scripts);
    let provider = MockProvider::new();
    let interpreter = Interpreter::with_config(
        ScriptLoader::new(source.clone()),
        provider.clone(),
        fast_config(correction),
    );
    (interpreter, provider, source)
}
