//! Retries, corrections and hot reload

mod common;

use common::{fast_config, init_tracing, interpreter, memory_source, MockProvider};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use sw_core::ErrorKind;
use sw_loader::{MemorySource, ScriptLoader, Section};
use sw_script::{
    ActionError, CorrectionMode, CorrectionSender, Interpreter, OperatorCorrector, RunState,
    RunStatus, StepStatus,
};

fn not_found(target: &str) -> ActionError {
    ActionError::NotFound {
        target: target.to_string(),
    }
}

// ============================================================================
// Retry loop
// ============================================================================

#[tokio::test]
async fn test_retried_step_ends_in_same_environment() {
    let script = "steps:\n  - action: navigate\n    url: /home\n  - click\n";

    let (interp, provider, _) = interpreter(&[("main", script)], CorrectionMode::None);
    provider.fail_next("click", 2, not_found("#go"));
    let retried = interp.run("main").await.unwrap();

    let (interp, _, _) = interpreter(&[("main", script)], CorrectionMode::None);
    let direct = interp.run("main").await.unwrap();

    assert!(retried.is_success(), "{:?}", retried.failure);
    assert_eq!(provider.count("click"), 3);
    assert_eq!(retried.attempts.len(), 2);
    assert!(retried.attempts.iter().all(|a| a.step_index == 1));
    assert_eq!(retried.steps[1].attempts, 3);
    // each failure left the provider at /error; the retry started from /home
    assert_eq!(
        retried.attempts[0].world_state.as_ref().unwrap().location.as_deref(),
        Some("/error")
    );
    assert!(retried
        .world_state
        .as_ref()
        .unwrap()
        .same_environment(direct.world_state.as_ref().unwrap()));
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let (interp, provider, _) = interpreter(
        &[("main", "steps: [navigate, click, hover]\n")],
        CorrectionMode::None,
    );
    provider.always_fail("click");

    let report = interp.run("main").await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(provider.count("click"), 5);
    assert_eq!(provider.count("hover"), 0);
    assert_eq!(report.attempts.len(), 5);
    let failure = report.failure.unwrap();
    assert_eq!(failure.kind, ErrorKind::RetryExhausted);
    assert_eq!(failure.action, "click");
    assert_eq!(failure.section, Section::Steps);
    assert_eq!(interp.state(), RunState::Failed);
}

#[tokio::test]
async fn test_step_overrides_retry_bound() {
    let (interp, provider, _) = interpreter(
        &[("main", "steps:\n  - action: click\n    max_retries: 2\n")],
        CorrectionMode::None,
    );
    provider.always_fail("click");

    let report = interp.run("main").await.unwrap();

    assert_eq!(provider.count("click"), 2);
    assert_eq!(report.steps[0].status, StepStatus::Failed);
    assert_eq!(report.steps[0].attempts, 2);
}

#[tokio::test]
async fn test_retry_rolls_back_variables() {
    let (interp, provider, _) = interpreter(
        &[(
            "main",
            r##"
variables:
  count: 0
steps:
  - for: i in [1, 2]
    steps:
      - set: count = count + 1
      - action: click
        target: "#item-{{ i }}"
"##,
        )],
        CorrectionMode::None,
    );
    provider.fail_next("click", 1, not_found("#item-1"));

    let report = interp.run("main").await.unwrap();

    assert!(report.is_success(), "{:?}", report.failure);
    assert_eq!(report.variables["count"], json!(2));
}

// ============================================================================
// Heuristic corrections
// ============================================================================

#[tokio::test]
async fn test_heuristic_remaps_unknown_action() {
    let (interp, provider, source) = interpreter(
        &[("main", "steps:\n  - tap\n  - hover\n")],
        CorrectionMode::Heuristic,
    );

    let report = interp.run("main").await.unwrap();

    assert!(report.is_success(), "{:?}", report.failure);
    assert_eq!(provider.actions(), vec!["click", "hover"]);
    assert_eq!(report.attempts.len(), 1);
    assert!(report.attempts[0].correction_applied);
    assert_eq!(report.attempts[0].error_kind, ErrorKind::UnknownAction);
    assert_eq!(report.reloads, 1);

    let edited = source.get("main").unwrap();
    assert!(edited.contains("click"));
    assert!(!edited.contains("tap"));
}

#[tokio::test]
async fn test_heuristic_waits_for_missing_target() {
    let (interp, provider, source) = interpreter(
        &[("main", "steps:\n  - action: click\n    target: \"#buy\"\n")],
        CorrectionMode::Heuristic,
    );
    provider.fail_next("click", 1, not_found("#buy"));

    let report = interp.run("main").await.unwrap();

    assert!(report.is_success(), "{:?}", report.failure);
    assert_eq!(provider.actions(), vec!["click", "wait_for", "click"]);
    assert_eq!(provider.param_values("wait_for", "target"), vec![json!("#buy")]);
    assert_eq!(provider.param_values("click", "timeout"), vec![json!(10_000)]);
    assert_eq!(report.records(Section::Steps).count(), 2);
    assert!(source.get("main").unwrap().contains("wait_for"));
}

#[tokio::test]
async fn test_heuristic_leaves_unrelated_failures_alone() {
    let (interp, provider, source) = interpreter(
        &[("main", "steps:\n  - action: click\n    max_retries: 3\n")],
        CorrectionMode::Heuristic,
    );
    provider.always_fail("click");
    let original = source.get("main").unwrap();

    let report = interp.run("main").await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(provider.count("click"), 3);
    assert!(report.attempts.iter().all(|a| !a.correction_applied));
    assert_eq!(source.get("main").unwrap(), original);
}

// ============================================================================
// Operator corrections
// ============================================================================

type OperatorRig = (
    Arc<Interpreter>,
    Arc<MockProvider>,
    Arc<MemorySource>,
    CorrectionSender,
);

fn operator_interpreter(script: &str) -> OperatorRig {
    init_tracing();
    let source = memory_source(&[("main", script)]);
    let provider = MockProvider::new();
    let (corrector, sender) = OperatorCorrector::new(Duration::from_millis(5));
    let interp = Interpreter::with_config(
        ScriptLoader::new(source.clone()),
        provider.clone(),
        fast_config(CorrectionMode::Operator),
    )
    .with_corrector(Arc::new(corrector));
    (Arc::new(interp), provider, source, sender)
}

#[tokio::test]
async fn test_operator_edit_then_resume() {
    let (interp, provider, source, sender) = operator_interpreter("steps: [navigate, click]\n");
    provider.always_fail("click");
    let mut states = interp.subscribe();

    let run = {
        let interp = interp.clone();
        tokio::spawn(async move { interp.run("main").await })
    };

    states
        .wait_for(|s| *s == RunState::AwaitingCorrection(1))
        .await
        .unwrap();
    source.insert("main", "steps: [navigate, hover]\n");
    sender.resume();

    let report = run.await.unwrap().unwrap();

    assert!(report.is_success(), "{:?}", report.failure);
    assert_eq!(provider.actions(), vec!["navigate", "click", "hover"]);
    assert!(report.attempts[0].correction_applied);
}

#[tokio::test]
async fn test_operator_abort() {
    let (interp, provider, _, sender) =
        operator_interpreter("steps: [navigate, click]\nteardown: [screenshot]\n");
    provider.always_fail("click");
    let mut states = interp.subscribe();

    let run = {
        let interp = interp.clone();
        tokio::spawn(async move { interp.run("main").await })
    };

    states
        .wait_for(|s| matches!(s, RunState::AwaitingCorrection(_)))
        .await
        .unwrap();
    sender.abort();

    let report = run.await.unwrap().unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(provider.count("click"), 1);
    assert_eq!(provider.count("screenshot"), 1);
    let failure = report.failure.unwrap();
    assert_eq!(failure.kind, ErrorKind::Cancelled);
    assert!(failure.message.contains("aborted"));
}

#[tokio::test]
async fn test_cancel_interrupts_correction_wait() {
    let (interp, provider, _, _sender) = operator_interpreter("steps: [click]\n");
    provider.always_fail("click");
    let mut states = interp.subscribe();

    let run = {
        let interp = interp.clone();
        tokio::spawn(async move { interp.run("main").await })
    };

    states
        .wait_for(|s| matches!(s, RunState::AwaitingCorrection(_)))
        .await
        .unwrap();
    interp.cancel_handle().cancel();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(provider.count("click"), 1);
}

// ============================================================================
// Hot reload
// ============================================================================

#[tokio::test]
async fn test_appended_step_runs() {
    let (interp, provider, source) =
        interpreter(&[("main", "steps: [navigate, click]\n")], CorrectionMode::None);
    let writer = source.clone();
    provider.on_execute("click", move |_| {
        writer.insert("main", "steps: [navigate, click, hover]\n");
    });

    let report = interp.run("main").await.unwrap();

    assert!(report.is_success());
    assert_eq!(provider.actions(), vec!["navigate", "click", "hover"]);
    assert_eq!(report.reloads, 1);
}

#[tokio::test]
async fn test_edits_to_executed_steps_do_not_replay() {
    let (interp, provider, source) = interpreter(
        &[("main", "steps: [navigate, click, hover]\n")],
        CorrectionMode::None,
    );
    let writer = source.clone();
    provider.on_execute("click", move |_| {
        writer.insert("main", "steps: [screenshot, press, scroll]\n");
    });

    let report = interp.run("main").await.unwrap();

    assert_eq!(provider.actions(), vec!["navigate", "click", "scroll"]);
    let labels: Vec<&str> = report.steps.iter().map(|r| r.label.as_str()).collect();
    assert_eq!(labels, vec!["navigate", "click", "scroll"]);
}

#[tokio::test]
async fn test_unparseable_edit_is_ignored() {
    let (interp, provider, source) = interpreter(
        &[("main", "steps: [navigate, click, hover]\n")],
        CorrectionMode::None,
    );
    let writer = source.clone();
    provider.on_execute("navigate", move |_| {
        writer.insert("main", "steps: [navigate, {if: }\n");
    });

    let report = interp.run("main").await.unwrap();

    assert!(report.is_success(), "{:?}", report.failure);
    assert_eq!(provider.actions(), vec!["navigate", "click", "hover"]);
    assert_eq!(report.reloads, 0);
}

#[tokio::test]
async fn test_forced_reload_of_unchanged_script() {
    let (interp, provider, _) =
        interpreter(&[("main", "steps: [navigate, click]\n")], CorrectionMode::None);
    let reload = interp.reload_handle();
    provider.on_execute("navigate", move |_| reload.request());

    let report = interp.run("main").await.unwrap();

    assert!(report.is_success());
    assert_eq!(provider.actions(), vec!["navigate", "click"]);
    assert_eq!(report.reloads, 1);
}
