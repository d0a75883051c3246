//! Script interpreter
//!
//! A run walks the top-level step list of a loaded script. Each top-level
//! step is the unit of recovery: when it fails and no enclosing `try` handles
//! the error, the environment and the variables are rolled back to how they
//! were before the step, a correction is requested, and the step is tried
//! again, up to the configured bound.

use crate::config::{CorrectionMode, EngineConfig};
use crate::context::{ExecutionContext, ScopeKind};
use crate::dispatcher::{ActionContext, ActionDispatcher, ActionProvider, ActionRegistry, Invokable};
use crate::error::{EngineError, EngineResult};
use crate::recovery::{
    Correction, CorrectionSource, DiagnosticBundle, HeuristicCorrector, NoCorrection,
    OperatorCorrector,
};
use crate::reload::{splice_from, HotReloadWatcher, ReloadHandle};
use crate::tracker::StateTracker;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use sw_core::{Checkpoint, ErrorKind, RetryAttempt, WorldState};
use sw_expr::{evaluate_condition, evaluate_rhs, render_value, ExprError, MAX_RANGE_LEN};
use sw_loader::{
    AssignValue, Composition, LoaderError, LoopBinding, ScriptDocument, ScriptLoader, Section,
    Step, StepKind,
};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use ulid::Ulid;

type StepFuture<'a, T> = Pin<Box<dyn Future<Output = EngineResult<T>> + Send + 'a>>;

/// Interpreter lifecycle, observable through [`Interpreter::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "step", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    RunningStep(usize),
    /// Waiting for a correction source after step N failed
    AwaitingCorrection(usize),
    Retrying(usize),
    Completed,
    Failed,
}

/// Final status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Outcome of a top-level step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    /// Optional step whose condition was not met
    Skipped,
    Failed,
}

/// Per-step entry of a [`RunReport`]
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub section: Section,
    pub index: usize,
    pub label: String,
    pub status: StepStatus,
    /// Attempts made, including the final one
    pub attempts: u32,
    /// Environment after the final attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub world_state: Option<WorldState>,
    pub duration_ms: u64,
}

/// The failure that ended a run
#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub section: Section,
    pub step_index: usize,
    pub action: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} step {} ({}) failed with {}: {}",
            self.section.key(),
            self.step_index,
            self.action,
            self.kind,
            self.message
        )
    }
}

/// Result of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub script: String,
    pub status: RunStatus,
    /// Setup, main and teardown steps in execution order
    pub steps: Vec<StepRecord>,
    /// Every failed attempt that was retried or exhausted the bound
    pub attempts: Vec<RetryAttempt>,
    /// Global variables at the end of the run
    pub variables: IndexMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub world_state: Option<WorldState>,
    /// Boundary to resume from
    pub checkpoint: Checkpoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    /// Times the script was re-read during the run
    pub reloads: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Records of one section
    pub fn records(&self, section: Section) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(move |r| r.section == section)
    }
}

/// Requests cancellation of a run at the next step boundary
///
/// A pending correction wait is interrupted as well.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Clear a previous cancellation so the interpreter can run again
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

enum StepOutcome {
    Executed,
    Skipped,
}

/// Executes scripts against an action provider
pub struct Interpreter {
    loader: ScriptLoader,
    dispatcher: ActionDispatcher,
    config: EngineConfig,
    corrector: Arc<dyn CorrectionSource>,
    state: watch::Sender<RunState>,
    cancel: CancelHandle,
    reload: ReloadHandle,
}

impl Interpreter {
    /// Create an interpreter with the default configuration
    pub fn new(loader: ScriptLoader, provider: Arc<dyn ActionProvider>) -> Self {
        Self::with_config(loader, provider, EngineConfig::default())
    }

    /// Create an interpreter
    ///
    /// The correction source follows `config.correction`; in operator mode
    /// only script edits are detected until [`with_corrector`](Self::with_corrector)
    /// installs an [`OperatorCorrector`] with a signal channel.
    pub fn with_config(
        loader: ScriptLoader,
        provider: Arc<dyn ActionProvider>,
        config: EngineConfig,
    ) -> Self {
        let loader = loader.with_read_retries(config.read_attempts, config.read_retry_delay());
        let corrector: Arc<dyn CorrectionSource> = match config.correction {
            CorrectionMode::Heuristic => Arc::new(HeuristicCorrector::new(config.max_timeout_ms)),
            CorrectionMode::Operator => {
                Arc::new(OperatorCorrector::watching(config.poll_interval()))
            }
            CorrectionMode::None => Arc::new(NoCorrection),
        };
        let dispatcher = ActionDispatcher::new(
            Arc::new(ActionRegistry::with_defaults()),
            provider,
            loader.clone(),
        );
        let (state, _) = watch::channel(RunState::Idle);

        Self {
            loader,
            dispatcher,
            config,
            corrector,
            state,
            cancel: CancelHandle::new(),
            reload: ReloadHandle::new(),
        }
    }

    /// Replace the action registry
    pub fn with_registry(mut self, registry: Arc<ActionRegistry>) -> Self {
        self.dispatcher = ActionDispatcher::new(
            registry,
            self.dispatcher.provider().clone(),
            self.loader.clone(),
        );
        self
    }

    /// Replace the correction source
    pub fn with_corrector(mut self, corrector: Arc<dyn CorrectionSource>) -> Self {
        self.corrector = corrector;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn loader(&self) -> &ScriptLoader {
        &self.loader
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        self.dispatcher.registry()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn reload_handle(&self) -> ReloadHandle {
        self.reload.clone()
    }

    /// Run a script from its first step
    ///
    /// Step failures do not make this return an error; they are reported in
    /// the [`RunReport`]. Errors are returned only when the script cannot be
    /// loaded or a required parameter is missing.
    pub async fn run(&self, reference: &str) -> EngineResult<RunReport> {
        self.run_with_params(reference, IndexMap::new()).await
    }

    /// Run a script with parameter values
    #[instrument(skip(self, params))]
    pub async fn run_with_params(
        &self,
        reference: &str,
        params: IndexMap<String, Value>,
    ) -> EngineResult<RunReport> {
        let document = self.loader.load_tolerant(reference).await?;
        let mut variables = initial_variables(&document);
        variables.extend(params);
        if let Some(param) = document
            .required_params()
            .find(|p| !variables.contains_key(*p))
        {
            return Err(LoaderError::MissingParameter {
                reference: reference.to_string(),
                param: param.to_string(),
            }
            .into());
        }

        Ok(Run::new(self, document, variables).execute(0, None).await)
    }

    /// Continue a script from a checkpoint
    ///
    /// `setup` runs again; the checkpoint's variables replace the context
    /// afterwards and its world state is restored before the first step.
    #[instrument(skip(self, checkpoint), fields(step = checkpoint.step_index))]
    pub async fn resume(&self, reference: &str, checkpoint: Checkpoint) -> EngineResult<RunReport> {
        let document = self.loader.load_tolerant(reference).await?;
        let start = checkpoint.step_index.min(document.steps.len());
        let variables = initial_variables(&document);
        Ok(Run::new(self, document, variables)
            .execute(start, Some(checkpoint))
            .await)
    }

    fn publish(&self, state: RunState) {
        self.state.send_replace(state);
    }

    /// Execute a list of steps in order
    fn execute_steps<'a>(
        &'a self,
        steps: &'a [Step],
        ctx: &'a mut ExecutionContext,
        actx: &'a ActionContext,
    ) -> StepFuture<'a, ()> {
        Box::pin(async move {
            for step in steps {
                self.execute_step(step, ctx, actx).await?;
            }
            Ok(())
        })
    }

    /// Execute a single step of any kind
    fn execute_step<'a>(
        &'a self,
        step: &'a Step,
        ctx: &'a mut ExecutionContext,
        actx: &'a ActionContext,
    ) -> StepFuture<'a, StepOutcome> {
        Box::pin(async move {
            if let Some(condition) = &step.condition {
                if !evaluate_condition(condition, &*ctx)? {
                    if step.optional {
                        debug!(step = actx.step_index, condition = %condition, "Skipping optional step");
                        return Ok(StepOutcome::Skipped);
                    }
                    return Err(EngineError::ConditionFailed {
                        condition: condition.clone(),
                    });
                }
            }

            match &step.kind {
                StepKind::Action {
                    action,
                    params,
                    save_as,
                } => {
                    let params = render_params(params, ctx)?;
                    let result = self.dispatch(action, params, ctx, actx).await?;
                    if let Some(name) = save_as {
                        ctx.set(name.clone(), result);
                    }
                }
                StepKind::If {
                    branches,
                    otherwise,
                } => {
                    let mut chosen = otherwise.as_slice();
                    for branch in branches {
                        if evaluate_condition(&branch.condition, &*ctx)? {
                            chosen = &branch.steps;
                            break;
                        }
                    }
                    self.execute_steps(chosen, ctx, actx).await?;
                }
                StepKind::For {
                    binding,
                    source,
                    steps,
                } => self.execute_for(binding, source, steps, ctx, actx).await?,
                StepKind::Try {
                    body,
                    catch,
                    finally,
                    error_var,
                } => {
                    let result = match self.execute_steps(body, ctx, actx).await {
                        Err(error) if error.is_catchable() && !catch.is_empty() => {
                            debug!(step = actx.step_index, error = %error, "Caught error");
                            let mut bindings = IndexMap::new();
                            bindings.insert(error_var.clone(), error.to_value(actx.step_index));
                            ctx.push_scope(ScopeKind::Catch, bindings);
                            let caught = self.execute_steps(catch, ctx, actx).await;
                            ctx.pop_scope();
                            caught
                        }
                        other => other,
                    };
                    let finished = self.execute_steps(finally, ctx, actx).await;
                    result.and(finished)?;
                }
                StepKind::Set { assignments } => {
                    for assignment in assignments {
                        let value = match &assignment.value {
                            AssignValue::Expression(src) => evaluate_rhs(src, &*ctx)?,
                            AssignValue::Template(value) => render_value(value, &*ctx)?,
                        };
                        ctx.set(assignment.name.clone(), value);
                    }
                }
                StepKind::Compose(composition) => {
                    let params = render_params(&composition.params, ctx)?;
                    self.execute_composition(composition, params, ctx, actx)
                        .await?;
                }
            }
            Ok(StepOutcome::Executed)
        })
    }

    async fn dispatch(
        &self,
        action: &str,
        params: Map<String, Value>,
        ctx: &mut ExecutionContext,
        actx: &ActionContext,
    ) -> EngineResult<Value> {
        match self.dispatcher.resolve(action, &params)? {
            Invokable::Builtin { name, builtin } => {
                self.dispatcher.invoke(&name, &builtin, params, actx).await
            }
            Invokable::Script(composition) => {
                self.execute_composition(&composition, params, ctx, actx)
                    .await
            }
        }
    }

    async fn execute_for(
        &self,
        binding: &LoopBinding,
        source: &str,
        steps: &[Step],
        ctx: &mut ExecutionContext,
        actx: &ActionContext,
    ) -> EngineResult<()> {
        let (pairs, keyed) = iteration_pairs(evaluate_rhs(source, &*ctx)?)?;
        let total = pairs.len();
        debug!(step = actx.step_index, binding = %binding, count = total, "Entering loop");

        for (i, (key, value)) in pairs.into_iter().enumerate() {
            let mut bindings = IndexMap::new();
            match binding {
                LoopBinding::Single(name) => {
                    bindings.insert(name.clone(), if keyed { key } else { value });
                }
                LoopBinding::Pair(first, second) => {
                    bindings.insert(first.clone(), key);
                    bindings.insert(second.clone(), value);
                }
            }
            bindings.insert(
                "loop".to_string(),
                json!({ "index": i + 1, "first": i == 0, "last": i + 1 == total }),
            );

            ctx.push_scope(ScopeKind::Loop, bindings);
            let result = self.execute_steps(steps, ctx, actx).await;
            ctx.pop_scope();
            result?;
        }
        Ok(())
    }

    /// Run a composed script in its own frame and return its `result` variable
    fn execute_composition<'a>(
        &'a self,
        composition: &'a Composition,
        params: Map<String, Value>,
        ctx: &'a mut ExecutionContext,
        actx: &'a ActionContext,
    ) -> StepFuture<'a, Value> {
        Box::pin(async move {
            let mut variables: IndexMap<String, Value> = composition
                .defaults
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            variables.extend(params);

            ctx.push_frame(composition.script.clone(), variables)?;
            debug!(script = %composition.script, depth = ctx.call_depth(), "Entering composed script");

            let result = self.execute_steps(&composition.steps, ctx, actx).await;
            if let Err(e) = self.execute_steps(&composition.teardown, ctx, actx).await {
                warn!(script = %composition.script, error = %e, "Composed teardown failed");
            }
            let frame = ctx.pop_frame().unwrap_or_default();
            result?;

            Ok(frame.get("result").cloned().unwrap_or(Value::Null))
        })
    }
}

/// Declared parameter defaults, then document variables
fn initial_variables(document: &ScriptDocument) -> IndexMap<String, Value> {
    let mut variables: IndexMap<String, Value> = document
        .params
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    variables.extend(document.variables.clone());
    variables
}

fn render_params(
    params: &Map<String, Value>,
    ctx: &ExecutionContext,
) -> EngineResult<Map<String, Value>> {
    let mut rendered = Map::new();
    for (key, value) in params {
        rendered.insert(key.clone(), render_value(value, ctx)?);
    }
    Ok(rendered)
}

/// `(index, item)` pairs for lists and counts, `(key, value)` for maps
///
/// The flag is set for maps, whose single-name binding is the key.
fn iteration_pairs(source: Value) -> EngineResult<(Vec<(Value, Value)>, bool)> {
    match source {
        Value::Array(items) => Ok((
            items
                .into_iter()
                .enumerate()
                .map(|(i, item)| (Value::from(i), item))
                .collect(),
            false,
        )),
        Value::Object(map) => Ok((
            map.into_iter().map(|(k, v)| (Value::String(k), v)).collect(),
            true,
        )),
        Value::Number(n) if n.as_u64().is_some() => {
            let count = n.as_u64().unwrap_or_default();
            if count > MAX_RANGE_LEN as u64 {
                return Err(ExprError::TypeMismatch {
                    message: format!(
                        "loop count {} exceeds the limit of {}",
                        count, MAX_RANGE_LEN
                    ),
                }
                .into());
            }
            Ok(((0..count).map(|i| (Value::from(i), Value::from(i))).collect(), false))
        }
        other => Err(ExprError::TypeMismatch {
            message: format!("cannot iterate over {}", other),
        }
        .into()),
    }
}

/// State of a single run
struct Run<'a> {
    interp: &'a Interpreter,
    run_id: String,
    document: ScriptDocument,
    ctx: ExecutionContext,
    tracker: StateTracker,
    watcher: HotReloadWatcher,
    records: Vec<StepRecord>,
    attempts: Vec<RetryAttempt>,
    /// Environment before the step that ended the run
    boundary: Option<WorldState>,
    reloads: u32,
    started_at: DateTime<Utc>,
}

impl<'a> Run<'a> {
    fn new(
        interp: &'a Interpreter,
        document: ScriptDocument,
        variables: IndexMap<String, Value>,
    ) -> Self {
        let watcher = HotReloadWatcher::new(
            interp.loader.clone(),
            document.reference.clone(),
            document.fingerprint.clone(),
            interp.reload.clone(),
        )
        .polling(interp.config.hot_reload);

        Self {
            interp,
            run_id: Ulid::new().to_string(),
            document,
            ctx: ExecutionContext::with_variables(variables),
            tracker: StateTracker::new(interp.dispatcher.provider().clone()),
            watcher,
            records: Vec::new(),
            attempts: Vec::new(),
            boundary: None,
            reloads: 0,
            started_at: Utc::now(),
        }
    }

    async fn execute(mut self, start: usize, checkpoint: Option<Checkpoint>) -> RunReport {
        info!(
            run_id = %self.run_id,
            script = %self.document.reference,
            start,
            steps = self.document.steps.len(),
            "Starting run"
        );
        let mut failure: Option<(Section, usize, EngineError)> = None;

        let mut index = 0;
        while let Some(step) = self.document.setup.get(index).cloned() {
            if let Err(e) = self.run_top_level(Section::Setup, index, step).await {
                failure = Some((Section::Setup, index, e));
                break;
            }
            index += 1;
        }

        let mut index = start;
        if failure.is_none() {
            if let Some(checkpoint) = checkpoint {
                self.ctx.restore(checkpoint.variables);
                if let Some(state) = &checkpoint.world_state {
                    self.tracker.restore(state).await;
                }
            }

            loop {
                if self.watcher.check() {
                    self.reload_at(index).await;
                }
                let Some(step) = self.document.steps.get(index).cloned() else {
                    break;
                };
                if self.interp.cancel.is_cancelled() {
                    info!(step = index, "Run cancelled");
                    failure = Some((
                        Section::Steps,
                        index,
                        EngineError::Cancelled { step_index: index },
                    ));
                    break;
                }
                match self.run_top_level(Section::Steps, index, step).await {
                    Ok(()) => index += 1,
                    Err(e) => {
                        failure = Some((Section::Steps, index, e));
                        break;
                    }
                }
            }
        }

        let world_state = self
            .boundary
            .take()
            .or_else(|| self.tracker.current().cloned());
        let checkpoint = Checkpoint::new(index, self.ctx.globals().clone(), world_state);

        let teardown = self.document.teardown.clone();
        for (i, step) in teardown.into_iter().enumerate() {
            self.run_teardown(i, step).await;
        }

        let (status, failure) = match failure {
            None => (RunStatus::Completed, None),
            Some((section, step_index, e)) => {
                let status = if matches!(e, EngineError::Cancelled { .. }) {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Failed
                };
                let action = e
                    .action()
                    .map(str::to_string)
                    .or_else(|| {
                        let steps = match section {
                            Section::Setup => &self.document.setup,
                            _ => &self.document.steps,
                        };
                        steps.get(step_index).map(|s| s.action_name().to_string())
                    })
                    .unwrap_or_default();
                let failure = RunFailure {
                    section,
                    step_index,
                    action,
                    kind: e.kind(),
                    message: e.to_string(),
                };
                error!(run_id = %self.run_id, "{}", failure);
                (status, Some(failure))
            }
        };

        self.interp.publish(match status {
            RunStatus::Completed => RunState::Completed,
            _ => RunState::Failed,
        });
        info!(run_id = %self.run_id, status = ?status, reloads = self.reloads, "Run finished");

        RunReport {
            run_id: self.run_id,
            script: self.document.reference,
            status,
            steps: self.records,
            attempts: self.attempts,
            variables: self.ctx.globals().clone(),
            world_state: self.tracker.current().cloned(),
            checkpoint,
            failure,
            reloads: self.reloads,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }

    /// Splice a changed script in at a step boundary
    async fn reload_at(&mut self, index: usize) {
        if let Some(document) = self.watcher.reload().await {
            splice_from(&mut self.document.steps, index, document.steps);
            self.document.teardown = document.teardown;
            self.document.fingerprint = document.fingerprint;
            self.reloads += 1;
            info!(step = index, steps = self.document.steps.len(), "Spliced reloaded steps");
        }
    }

    async fn run_top_level(&mut self, section: Section, index: usize, step: Step) -> EngineResult<()> {
        let started = Instant::now();
        let label = step.label();
        let (result, attempts) = self.attempt(section, index, step).await;

        self.records.push(StepRecord {
            section,
            index,
            label,
            status: match &result {
                Ok(status) => *status,
                Err(_) => StepStatus::Failed,
            },
            attempts,
            world_state: self.tracker.current().cloned(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
        result.map(|_| ())
    }

    /// The retry loop for one top-level step
    async fn attempt(
        &mut self,
        section: Section,
        index: usize,
        mut step: Step,
    ) -> (EngineResult<StepStatus>, u32) {
        let interp = self.interp;
        let max_attempts = step.max_retries.unwrap_or(interp.config.max_retries).max(1);
        let mut attempt = 1;

        loop {
            interp.publish(RunState::RunningStep(index));
            let action = step.action_name().to_string();
            let before = self.tracker.capture(index, &action).await;
            let saved = self.ctx.clone();
            let actx = ActionContext {
                script: self.document.reference.clone(),
                step_index: index,
                attempt,
            };
            debug!(section = section.key(), step = index, action = %action, attempt, "Running step");

            let error = match interp.execute_step(&step, &mut self.ctx, &actx).await {
                Ok(outcome) => {
                    self.tracker.capture(index, &action).await;
                    let status = match outcome {
                        StepOutcome::Executed => StepStatus::Passed,
                        StepOutcome::Skipped => StepStatus::Skipped,
                    };
                    return (Ok(status), attempt);
                }
                Err(e) => e,
            };

            let at_failure = self.tracker.capture(index, &action).await;
            warn!(
                section = section.key(),
                step = index,
                action = %action,
                attempt,
                kind = %error.kind(),
                error = %error,
                "Step failed"
            );

            if !error.is_retryable() {
                self.ctx = saved;
                self.boundary = Some(before);
                return (Err(error), attempt);
            }

            self.attempts.push(RetryAttempt::new(
                index,
                attempt,
                error.kind(),
                error.to_string(),
                Some(at_failure.clone()),
            ));
            if attempt >= max_attempts {
                self.ctx = saved;
                self.boundary = Some(before);
                let exhausted = EngineError::RetryExhausted {
                    step_index: index,
                    action: error.action().unwrap_or(action.as_str()).to_string(),
                    attempts: attempt,
                    last: Box::new(error),
                };
                return (Err(exhausted), attempt);
            }

            interp.publish(RunState::AwaitingCorrection(index));
            let bundle = self
                .bundle(&step, index, attempt, max_attempts, &error, at_failure)
                .await;
            debug!(report = %bundle.render(), "Diagnostics");

            let correction = tokio::select! {
                correction = interp.corrector.correct(&bundle, &interp.loader) => correction,
                _ = interp.cancel.cancelled() => Err(EngineError::Cancelled { step_index: index }),
            };
            let correction = match correction {
                Ok(correction) => correction,
                Err(e @ EngineError::Cancelled { .. }) => {
                    self.ctx = saved;
                    self.boundary = Some(before);
                    return (Err(e), attempt);
                }
                Err(e) => {
                    warn!(step = index, error = %e, "Correction failed, retrying unchanged");
                    Correction::Unchanged
                }
            };

            match correction {
                Correction::Abort => {
                    info!(step = index, "Run aborted during correction");
                    self.ctx = saved;
                    self.boundary = Some(before);
                    return (Err(EngineError::Aborted { step_index: index }), attempt);
                }
                Correction::Applied { description } => {
                    if let Some(last) = self.attempts.last_mut() {
                        last.correction_applied = true;
                    }
                    info!(step = index, correction = %description, "Correction applied");
                    match self.adopt_correction(section, index, step).await {
                        Some(corrected) => step = corrected,
                        None => {
                            info!(step = index, "Corrected script no longer has this step");
                            self.tracker.restore(&before).await;
                            self.ctx = saved;
                            return (Ok(StepStatus::Skipped), attempt);
                        }
                    }
                }
                Correction::Unchanged => {}
            }

            self.tracker.restore(&before).await;
            self.ctx = saved;
            interp.publish(RunState::Retrying(index));
            attempt += 1;
        }
    }

    /// Re-read the script after a correction
    ///
    /// Main steps are spliced from `index` on. A corrected setup step is
    /// replaced on its own. Returns the step to retry, `None` if it is gone.
    async fn adopt_correction(&mut self, section: Section, index: usize, current: Step) -> Option<Step> {
        let Some(document) = self.watcher.reload().await else {
            return Some(current);
        };
        self.reloads += 1;
        self.document.fingerprint = document.fingerprint;
        self.document.teardown = document.teardown;

        match section {
            Section::Setup => {
                self.document.steps = document.steps;
                let corrected = document.setup.get(index).cloned();
                if let Some(step) = &corrected {
                    self.document.setup[index] = step.clone();
                }
                corrected
            }
            Section::Steps => {
                splice_from(&mut self.document.steps, index, document.steps);
                self.document.steps.get(index).cloned()
            }
            Section::Teardown => Some(current),
        }
    }

    async fn bundle(
        &self,
        step: &Step,
        index: usize,
        attempt: u32,
        max_attempts: u32,
        error: &EngineError,
        world_state: WorldState,
    ) -> DiagnosticBundle {
        let environment = if self.interp.config.environment_dump {
            self.interp.dispatcher.provider().environment_dump().await
        } else {
            None
        };

        DiagnosticBundle {
            run_id: self.run_id.clone(),
            script: self.document.reference.clone(),
            step_index: index,
            step_label: step.label(),
            action: error.action().unwrap_or(step.action_name()).to_string(),
            attempt,
            max_attempts,
            error_kind: error.kind(),
            error_message: error.to_string(),
            reason: error.action_error().map(|e| e.reason().to_string()),
            suggestion: match error {
                EngineError::UnknownAction { suggestion, .. } => suggestion.clone(),
                _ => None,
            },
            origin: step.origin.clone(),
            world_state: Some(world_state),
            environment,
            variables: self.ctx.snapshot(),
            fingerprint: self.watcher.fingerprint().to_string(),
            created_at: Utc::now(),
        }
    }

    /// Teardown steps run once; failures are logged and recorded
    async fn run_teardown(&mut self, index: usize, step: Step) {
        let started = Instant::now();
        let actx = ActionContext {
            script: self.document.reference.clone(),
            step_index: index,
            attempt: 1,
        };
        let status = match self.interp.execute_step(&step, &mut self.ctx, &actx).await {
            Ok(StepOutcome::Executed) => StepStatus::Passed,
            Ok(StepOutcome::Skipped) => StepStatus::Skipped,
            Err(e) => {
                warn!(step = index, action = step.action_name(), error = %e, "Teardown step failed");
                StepStatus::Failed
            }
        };
        self.records.push(StepRecord {
            section: Section::Teardown,
            index,
            label: step.label(),
            status,
            attempts: 1,
            world_state: None,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }
}
