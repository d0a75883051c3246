//! Failure diagnostics and corrections
//!
//! When a step fails, the interpreter assembles a [`DiagnosticBundle`] and
//! hands it to a [`CorrectionSource`]. A correction edits the persisted
//! script; the interpreter then re-reads it and retries the step.

use crate::error::EngineResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use minijinja::{context, Environment};
use serde::Serialize;
use serde_json::Value;
use serde_yaml::{Mapping, Value as Yaml};
use std::time::Duration;
use sw_core::{ErrorKind, WorldState};
use sw_loader::{ScriptLoader, Section, StepOrigin};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Timeout assumed for a step that does not declare one
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 5_000;

/// Wait injected before a step whose target could not be found
const INJECTED_WAIT_MS: u64 = 1_000;

/// Description marking steps inserted by [`HeuristicCorrector`]
const INJECTED_MARKER: &str = "auto-inserted wait";

const REPORT_TEMPLATE: &str = r#"Step {{ b.step_index }} failed: {{ b.step_label }}
  script:  {{ b.script }}
  action:  {{ b.action }}
  attempt: {{ b.attempt }} of {{ b.max_attempts }}
  error:   {{ kind }}: {{ b.error_message }}
{%- if b.suggestion %}
  hint:    did you mean '{{ b.suggestion }}'?
{%- endif %}
{%- if b.world_state %}
  at:      {{ b.world_state.location or "unknown location" }}
{%- endif %}
{%- if b.variables %}
variables:
{%- for name, value in b.variables|items %}
  {{ name }} = {{ value }}
{%- endfor %}
{%- endif %}
{%- if b.environment %}
environment:
{{ b.environment }}
{%- endif %}
"#;

/// Everything known about a failed step
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticBundle {
    pub run_id: String,
    /// Script being run
    pub script: String,
    pub step_index: usize,
    pub step_label: String,
    /// Action that failed, the top-level step's kind if not known
    pub action: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub error_kind: ErrorKind,
    pub error_message: String,
    /// Provider failure reason (`not_found`, `timeout`, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Suggested replacement for an unknown action
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Where the failing top-level step was declared
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<StepOrigin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub world_state: Option<WorldState>,
    /// Provider environment dump, when enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    pub variables: IndexMap<String, Value>,
    /// Fingerprint of the script the failing step was loaded from
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

impl DiagnosticBundle {
    /// Human readable failure report
    pub fn render(&self) -> String {
        let env = Environment::new();
        match env.render_str(
            REPORT_TEMPLATE,
            context! { b => self, kind => self.error_kind.as_str() },
        ) {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Failed to render diagnostic report");
                format!(
                    "Step {} failed: {}: {}",
                    self.step_index, self.error_kind, self.error_message
                )
            }
        }
    }
}

/// What a correction source did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correction {
    /// The script was edited; re-read it before retrying
    Applied { description: String },
    /// Retry as-is
    Unchanged,
    /// Stop the run
    Abort,
}

/// Produces a correction for a failed step
#[async_trait]
pub trait CorrectionSource: Send + Sync {
    async fn correct(
        &self,
        bundle: &DiagnosticBundle,
        loader: &ScriptLoader,
    ) -> EngineResult<Correction>;
}

/// Retry without corrections
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCorrection;

#[async_trait]
impl CorrectionSource for NoCorrection {
    async fn correct(
        &self,
        _bundle: &DiagnosticBundle,
        _loader: &ScriptLoader,
    ) -> EngineResult<Correction> {
        Ok(Correction::Unchanged)
    }
}

/// Rewrites the failing step for well-known error kinds
///
/// - target not found: insert a wait before the step and raise its timeout
/// - unknown action with a suggestion: replace the action identifier
/// - timeout: double the step's timeout, up to a ceiling
///
/// Only steps declared directly in a section are rewritten; a failure inside
/// a nested block is retried unchanged.
#[derive(Debug, Clone)]
pub struct HeuristicCorrector {
    max_timeout_ms: u64,
}

impl HeuristicCorrector {
    pub fn new(max_timeout_ms: u64) -> Self {
        Self { max_timeout_ms }
    }

    /// Compute the edited document, `None` if nothing applies
    pub fn rewrite(&self, content: &str, bundle: &DiagnosticBundle) -> Option<(String, String)> {
        let origin = bundle.origin.as_ref()?;
        let mut root: Yaml = serde_yaml::from_str(content).ok()?;
        let list = section_list(&mut root, origin.section)?;
        if origin.index >= list.len() {
            return None;
        }

        // Only leaf steps whose action matches the failure
        let step = list.get_mut(origin.index)?;
        if let Yaml::String(name) = step {
            let mut mapping = Mapping::new();
            mapping.insert(key("action"), Yaml::String(name.clone()));
            *step = Yaml::Mapping(mapping);
        }
        let mapping = step.as_mapping_mut()?;
        if mapping.get("action").and_then(Yaml::as_str) != Some(bundle.action.as_str()) {
            return None;
        }

        let description = match (bundle.error_kind, bundle.reason.as_deref()) {
            (ErrorKind::UnknownAction, _) => {
                let suggestion = bundle.suggestion.clone()?;
                mapping.insert(key("action"), Yaml::String(suggestion.clone()));
                format!("replaced '{}' with '{}'", bundle.action, suggestion)
            }
            (ErrorKind::ActionExecution, Some("timeout")) => {
                let timeout = self.raise_timeout(mapping)?;
                format!("raised timeout to {}ms", timeout)
            }
            (ErrorKind::ActionExecution, Some("not_found")) => {
                let timeout = self.raise_timeout(mapping);
                let target = params_of(mapping)
                    .and_then(|p| p.get("target"))
                    .or_else(|| mapping.get("target"))
                    .cloned();
                let preceded = origin.index > 0
                    && list[origin.index - 1]
                        .get("description")
                        .and_then(Yaml::as_str)
                        == Some(INJECTED_MARKER);
                if preceded && timeout.is_none() {
                    return None;
                }
                if !preceded {
                    list.insert(origin.index, injected_wait(target));
                }
                match timeout {
                    Some(ms) => format!("waited before step and raised timeout to {}ms", ms),
                    None => "waited before step".to_string(),
                }
            }
            _ => return None,
        };

        let content = serde_yaml::to_string(&root).ok()?;
        Some((content, description))
    }

    /// Double the step's timeout; `None` if already at the ceiling
    fn raise_timeout(&self, step: &mut Mapping) -> Option<u64> {
        let holder = if params_of(step).is_some_and(|p| p.contains_key("timeout")) {
            params_of_mut(step)?
        } else {
            step
        };
        let current = holder
            .get("timeout")
            .and_then(Yaml::as_u64)
            .unwrap_or(DEFAULT_STEP_TIMEOUT_MS);
        let raised = current.saturating_mul(2).min(self.max_timeout_ms);
        if raised <= current {
            return None;
        }
        holder.insert(key("timeout"), Yaml::Number(raised.into()));
        Some(raised)
    }
}

#[async_trait]
impl CorrectionSource for HeuristicCorrector {
    async fn correct(
        &self,
        bundle: &DiagnosticBundle,
        loader: &ScriptLoader,
    ) -> EngineResult<Correction> {
        let Some(origin) = &bundle.origin else {
            return Ok(Correction::Unchanged);
        };
        let content = match loader.source().load(&origin.script) {
            Ok(content) => content,
            Err(e) => {
                warn!(script = %origin.script, error = %e, "Cannot read script for correction");
                return Ok(Correction::Unchanged);
            }
        };

        match self.rewrite(&content, bundle) {
            Some((edited, description)) => {
                loader.source().store(&origin.script, &edited)?;
                info!(
                    script = %origin.script,
                    step = bundle.step_index,
                    correction = %description,
                    "Applied correction"
                );
                Ok(Correction::Applied { description })
            }
            None => {
                debug!(step = bundle.step_index, kind = %bundle.error_kind, "No heuristic applies");
                Ok(Correction::Unchanged)
            }
        }
    }
}

fn key(name: &str) -> Yaml {
    Yaml::String(name.to_string())
}

fn section_list(root: &mut Yaml, section: Section) -> Option<&mut Vec<Yaml>> {
    match root {
        Yaml::Sequence(steps) if section == Section::Steps => Some(steps),
        Yaml::Mapping(mapping) => mapping.get_mut(section.key())?.as_sequence_mut(),
        _ => None,
    }
}

fn params_of(step: &Mapping) -> Option<&Mapping> {
    step.get("params")
        .or_else(|| step.get("with"))
        .and_then(Yaml::as_mapping)
}

fn params_of_mut(step: &mut Mapping) -> Option<&mut Mapping> {
    let name = if step.contains_key("params") {
        "params"
    } else {
        "with"
    };
    step.get_mut(name)?.as_mapping_mut()
}

fn injected_wait(target: Option<Yaml>) -> Yaml {
    let mut wait = Mapping::new();
    wait.insert(key("description"), key(INJECTED_MARKER));
    match target {
        Some(target) => {
            wait.insert(key("action"), key("wait_for"));
            wait.insert(key("target"), target);
            wait.insert(key("timeout"), Yaml::Number(INJECTED_WAIT_MS.into()));
        }
        None => {
            wait.insert(key("action"), key("sleep"));
            wait.insert(key("ms"), Yaml::Number(INJECTED_WAIT_MS.into()));
        }
    }
    Yaml::Mapping(wait)
}

/// Operator decision delivered while a correction is awaited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionSignal {
    /// Retry now, with or without an edit
    Resume,
    /// Stop the run
    Abort,
}

/// Sending half held by the operator's tooling
#[derive(Debug, Clone)]
pub struct CorrectionSender {
    tx: mpsc::UnboundedSender<CorrectionSignal>,
}

impl CorrectionSender {
    pub fn resume(&self) -> bool {
        self.tx.send(CorrectionSignal::Resume).is_ok()
    }

    pub fn abort(&self) -> bool {
        self.tx.send(CorrectionSignal::Abort).is_ok()
    }
}

/// Waits for an operator to edit the script or send a signal
///
/// The script is polled for a new fingerprint; an edit counts as an applied
/// correction. Signals arriving on the channel short-circuit the wait.
pub struct OperatorCorrector {
    signals: Mutex<Option<mpsc::UnboundedReceiver<CorrectionSignal>>>,
    poll_interval: Duration,
}

impl OperatorCorrector {
    /// Corrector plus the sender the operator signals through
    pub fn new(poll_interval: Duration) -> (Self, CorrectionSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let corrector = Self {
            signals: Mutex::new(Some(rx)),
            poll_interval,
        };
        (corrector, CorrectionSender { tx })
    }

    /// Corrector that only watches for edits
    pub fn watching(poll_interval: Duration) -> Self {
        Self {
            signals: Mutex::new(None),
            poll_interval,
        }
    }

    fn edited(&self, bundle: &DiagnosticBundle, loader: &ScriptLoader) -> bool {
        // a script that cannot be read is probably mid-write
        loader
            .fingerprint(&bundle.script)
            .map(|current| current != bundle.fingerprint)
            .unwrap_or(false)
    }
}

#[async_trait]
impl CorrectionSource for OperatorCorrector {
    async fn correct(
        &self,
        bundle: &DiagnosticBundle,
        loader: &ScriptLoader,
    ) -> EngineResult<Correction> {
        info!(
            script = %bundle.script,
            step = bundle.step_index,
            "Awaiting operator correction\n{}",
            bundle.render()
        );

        let mut signals = self.signals.lock().await;
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            let signal = match signals.as_mut() {
                Some(rx) => tokio::select! {
                    biased;
                    signal = rx.recv() => Some(signal),
                    _ = interval.tick() => None,
                },
                None => {
                    interval.tick().await;
                    None
                }
            };

            match signal {
                Some(Some(CorrectionSignal::Resume)) => {
                    let description = if self.edited(bundle, loader) {
                        "operator edited script"
                    } else {
                        "operator resumed"
                    };
                    return Ok(Correction::Applied {
                        description: description.to_string(),
                    });
                }
                Some(Some(CorrectionSignal::Abort)) => return Ok(Correction::Abort),
                Some(None) => {
                    debug!("Operator channel closed, watching for edits only");
                    *signals = None;
                }
                None => {
                    if self.edited(bundle, loader) {
                        return Ok(Correction::Applied {
                            description: "operator edited script".to_string(),
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use sw_loader::MemorySource;

    fn bundle(kind: ErrorKind, reason: Option<&str>, action: &str, index: usize) -> DiagnosticBundle {
        DiagnosticBundle {
            run_id: "run".into(),
            script: "main".into(),
            step_index: index,
            step_label: action.into(),
            action: action.into(),
            attempt: 1,
            max_attempts: 5,
            error_kind: kind,
            error_message: "boom".into(),
            reason: reason.map(str::to_string),
            suggestion: None,
            origin: Some(StepOrigin {
                script: "main".into(),
                section: Section::Steps,
                index,
            }),
            world_state: Some(WorldState::new().with_location("/login")),
            environment: None,
            variables: IndexMap::from([("user".to_string(), json!("bob"))]),
            fingerprint: String::new(),
            created_at: Utc::now(),
        }
    }

    fn steps_of(content: &str) -> Vec<Yaml> {
        let root: Yaml = serde_yaml::from_str(content).unwrap();
        root["steps"].as_sequence().unwrap().clone()
    }

    #[test]
    fn test_report_mentions_failure() {
        let mut b = bundle(ErrorKind::UnknownAction, None, "tap", 2);
        b.suggestion = Some("click".into());
        let report = b.render();
        assert!(report.contains("Step 2 failed: tap"));
        assert!(report.contains("UnknownActionError: boom"));
        assert!(report.contains("did you mean 'click'?"));
        assert!(report.contains("/login"));
        assert!(report.contains("user = bob"));
    }

    #[test]
    fn test_rewrite_unknown_action() {
        let mut b = bundle(ErrorKind::UnknownAction, None, "tap", 1);
        b.suggestion = Some("click".into());
        let (content, description) = HeuristicCorrector::new(60_000)
            .rewrite("steps:\n  - navigate\n  - action: tap\n    target: '#go'\n", &b)
            .unwrap();
        assert!(description.contains("'click'"));
        let steps = steps_of(&content);
        assert_eq!(steps[1]["action"].as_str(), Some("click"));
        assert_eq!(steps[1]["target"].as_str(), Some("#go"));

        assert!(HeuristicCorrector::new(60_000)
            .rewrite("steps:\n  - tap\n", &bundle(ErrorKind::UnknownAction, None, "tap", 0))
            .is_none());
    }

    #[test]
    fn test_rewrite_timeout_is_capped() {
        let corrector = HeuristicCorrector::new(12_000);
        let b = bundle(ErrorKind::ActionExecution, Some("timeout"), "wait_for", 0);

        let (content, _) = corrector
            .rewrite("steps:\n  - action: wait_for\n    params: {target: '#x', timeout: 8000}\n", &b)
            .unwrap();
        assert_eq!(steps_of(&content)[0]["params"]["timeout"].as_u64(), Some(12_000));

        assert!(corrector.rewrite(&content, &b).is_none());
    }

    #[test]
    fn test_rewrite_not_found_injects_wait_once() {
        let corrector = HeuristicCorrector::new(60_000);
        let b = bundle(ErrorKind::ActionExecution, Some("not_found"), "click", 0);

        let (content, _) = corrector
            .rewrite("steps:\n  - action: click\n    target: '#buy'\n", &b)
            .unwrap();
        let steps = steps_of(&content);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0]["action"].as_str(), Some("wait_for"));
        assert_eq!(steps[0]["target"].as_str(), Some("#buy"));
        assert_eq!(steps[1]["timeout"].as_u64(), Some(DEFAULT_STEP_TIMEOUT_MS * 2));

        // The retried step now sits one further down
        let again = bundle(ErrorKind::ActionExecution, Some("not_found"), "click", 1);
        let (content, _) = corrector.rewrite(&content, &again).unwrap();
        let steps = steps_of(&content);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1]["timeout"].as_u64(), Some(DEFAULT_STEP_TIMEOUT_MS * 4));
    }

    #[test]
    fn test_rewrite_skips_nested_failures() {
        let b = bundle(ErrorKind::ActionExecution, Some("timeout"), "click", 0);
        let content = "steps:\n  - for: item in items\n    do: [click]\n";
        assert!(HeuristicCorrector::new(60_000).rewrite(content, &b).is_none());
    }

    #[tokio::test]
    async fn test_heuristic_stores_edit() {
        let source = Arc::new(MemorySource::new());
        source.insert("main", "steps:\n  - action: tap\n");
        let loader = ScriptLoader::new(source.clone());

        let mut b = bundle(ErrorKind::UnknownAction, None, "tap", 0);
        b.suggestion = Some("click".into());
        let correction = HeuristicCorrector::new(60_000).correct(&b, &loader).await.unwrap();
        assert!(matches!(correction, Correction::Applied { .. }));
        assert!(source.get("main").unwrap().contains("click"));
    }

    #[tokio::test]
    async fn test_operator_signals() {
        let source = Arc::new(MemorySource::new());
        source.insert("main", "steps: [click]\n");
        let loader = ScriptLoader::new(source.clone());
        let mut b = bundle(ErrorKind::ActionExecution, None, "click", 0);
        b.fingerprint = loader.fingerprint("main").unwrap();

        let (corrector, sender) = OperatorCorrector::new(Duration::from_millis(5));
        assert!(sender.abort());
        assert_eq!(corrector.correct(&b, &loader).await.unwrap(), Correction::Abort);

        assert!(sender.resume());
        assert_eq!(
            corrector.correct(&b, &loader).await.unwrap(),
            Correction::Applied {
                description: "operator resumed".into()
            }
        );
    }

    #[tokio::test]
    async fn test_operator_detects_edit() {
        let source = Arc::new(MemorySource::new());
        source.insert("main", "steps: [click]\n");
        let loader = ScriptLoader::new(source.clone());
        let mut b = bundle(ErrorKind::ActionExecution, None, "click", 0);
        b.fingerprint = loader.fingerprint("main").unwrap();

        let corrector = OperatorCorrector::watching(Duration::from_millis(5));
        let editor = {
            let source = source.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                source.insert("main", "steps: [double_click]\n");
            })
        };
        let correction = corrector.correct(&b, &loader).await.unwrap();
        editor.await.unwrap();
        assert_eq!(
            correction,
            Correction::Applied {
                description: "operator edited script".into()
            }
        );
    }

    #[tokio::test]
    async fn test_no_correction() {
        let loader = ScriptLoader::new(Arc::new(MemorySource::new()));
        let b = bundle(ErrorKind::ActionExecution, None, "click", 0);
        assert_eq!(NoCorrection.correct(&b, &loader).await.unwrap(), Correction::Unchanged);
    }
}
