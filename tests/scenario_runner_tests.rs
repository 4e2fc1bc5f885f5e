//! Five-phase runner behaviour with scripted scenarios

use async_trait::async_trait;
use parking_lot::Mutex;
use reporter_harness::config::PhaseTimeouts;
use reporter_harness::scenario::ScenarioOutcome;
use reporter_harness::{
    CancellationToken, ChaosScenario, ErrorKind, HarnessError, Phase, PhaseContext, Result, ScenarioRunner,
};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Clone, Copy)]
enum Script {
    Pass,
    Fail(ErrorKind),
    Panic,
    Hang,
    /// Cancel the runner's token, then hang
    CancelRun,
}

struct Scripted {
    scripts: HashMap<Phase, Script>,
    calls: Mutex<Vec<Phase>>,
    restore_saw_cancel: Mutex<Option<bool>>,
    runner_cancel: CancellationToken,
}

impl Scripted {
    fn new(scripts: &[(Phase, Script)], runner_cancel: &CancellationToken) -> Self {
        Self {
            scripts: scripts.iter().copied().collect(),
            calls: Mutex::new(Vec::new()),
            restore_saw_cancel: Mutex::new(None),
            runner_cancel: runner_cancel.clone(),
        }
    }

    fn calls(&self) -> Vec<Phase> {
        self.calls.lock().clone()
    }

    async fn play(&self, ctx: &PhaseContext) -> Result<()> {
        self.calls.lock().push(ctx.phase);
        if ctx.phase == Phase::Restore {
            *self.restore_saw_cancel.lock() = Some(ctx.cancel.is_cancelled());
        }
        match self.scripts.get(&ctx.phase).copied().unwrap_or(Script::Pass) {
            Script::Pass => Ok(()),
            Script::Fail(kind) => Err(error_of(kind)),
            Script::Panic => panic!("scripted panic in {}", ctx.phase),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            Script::CancelRun => {
                self.runner_cancel.cancel();
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }
    }
}

fn error_of(kind: ErrorKind) -> HarnessError {
    match kind {
        ErrorKind::PreconditionUnmet => HarnessError::PreconditionUnmet("no baseline".into()),
        ErrorKind::ProtocolViolation => HarnessError::ProtocolViolation("bad state".into()),
        ErrorKind::ConvergenceFailure => HarnessError::ConvergenceFailure {
            stuck_ids: vec!["r-1".into(), "r-2".into()],
            last_status: "Processing".into(),
            after: Duration::from_secs(1),
        },
        ErrorKind::Transport => HarnessError::UnexpectedStatus {
            status: 404,
            body: String::new(),
        },
        _ => HarnessError::InfrastructureUnavailable("docker gone".into()),
    }
}

#[async_trait]
impl ChaosScenario for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn fault(&self) -> String {
        "scripted fault".to_string()
    }

    async fn normal(&self, ctx: &PhaseContext) -> Result<()> {
        self.play(ctx).await
    }

    async fn inject(&self, ctx: &PhaseContext) -> Result<()> {
        self.play(ctx).await
    }

    async fn verify_failure(&self, ctx: &PhaseContext) -> Result<()> {
        self.play(ctx).await
    }

    async fn restore(&self, ctx: &PhaseContext) -> Result<()> {
        self.play(ctx).await
    }

    async fn verify_recovery(&self, ctx: &PhaseContext) -> Result<()> {
        self.play(ctx).await
    }
}

fn short_timeouts() -> PhaseTimeouts {
    PhaseTimeouts {
        normal: Duration::from_millis(500),
        inject: Duration::from_millis(500),
        verify_failure: Duration::from_millis(500),
        restore: Duration::from_millis(500),
        verify_recovery: Duration::from_millis(500),
    }
}

async fn run(scripts: &[(Phase, Script)]) -> (reporter_harness::ScenarioReport, Scripted) {
    let cancel = CancellationToken::new();
    let scenario = Scripted::new(scripts, &cancel);
    let report = ScenarioRunner::new(short_timeouts(), cancel).run(&scenario).await;
    (report, scenario)
}

#[tokio::test]
async fn all_phases_run_in_order_on_success() {
    let (report, scenario) = run(&[]).await;
    assert!(report.passed());
    assert_eq!(scenario.calls(), Phase::ALL.to_vec());
    assert!(report.to_string().contains("passed"));
}

#[tokio::test]
async fn failed_baseline_skips_everything_else() {
    let (report, scenario) = run(&[(Phase::Normal, Script::Fail(ErrorKind::PreconditionUnmet))]).await;
    assert!(report.skipped());
    assert_eq!(scenario.calls(), vec![Phase::Normal]);
    assert!(!report.ran(Phase::Restore));
    assert!(!report.to_string().contains("passed"));
}

#[tokio::test]
async fn protocol_violation_in_baseline_fails() {
    let (report, scenario) = run(&[(Phase::Normal, Script::Fail(ErrorKind::ProtocolViolation))]).await;
    assert_eq!(report.failed_phase(), Some(Phase::Normal));
    assert_eq!(scenario.calls(), vec![Phase::Normal]);
}

#[tokio::test]
async fn restore_runs_after_inject_failure() {
    let (report, scenario) = run(&[(Phase::Inject, Script::Fail(ErrorKind::InfrastructureUnavailable))]).await;
    assert_eq!(report.failed_phase(), Some(Phase::Inject));
    assert_eq!(scenario.calls(), vec![Phase::Normal, Phase::Inject, Phase::Restore]);
}

#[tokio::test]
async fn restore_runs_after_verify_failure_fails() {
    let (report, scenario) = run(&[(Phase::VerifyFailure, Script::Fail(ErrorKind::Transport))]).await;
    assert_eq!(report.failed_phase(), Some(Phase::VerifyFailure));
    assert!(report.ran(Phase::Restore));
    assert!(!report.ran(Phase::VerifyRecovery));
    assert_eq!(scenario.calls().last(), Some(&Phase::Restore));
}

#[tokio::test]
async fn panic_becomes_protocol_violation_and_restores() {
    let (report, scenario) = run(&[(Phase::VerifyFailure, Script::Panic)]).await;
    assert_eq!(report.failed_phase(), Some(Phase::VerifyFailure));
    assert!(scenario.calls().contains(&Phase::Restore));
    let err = report.into_result().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    assert!(err.to_string().contains("scripted panic"));
}

#[tokio::test]
async fn hanging_phase_times_out() {
    let (report, scenario) = run(&[(Phase::VerifyRecovery, Script::Hang)]).await;
    assert_eq!(report.failed_phase(), Some(Phase::VerifyRecovery));
    assert_eq!(scenario.calls(), Phase::ALL.to_vec());
    let err = report.into_result().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationTimeout);
}

#[tokio::test]
async fn cancellation_during_inject_still_restores() {
    let (report, scenario) = run(&[(Phase::Inject, Script::CancelRun)]).await;
    assert_eq!(report.failed_phase(), Some(Phase::Inject));
    assert_eq!(scenario.calls(), vec![Phase::Normal, Phase::Inject, Phase::Restore]);
    assert_eq!(*scenario.restore_saw_cancel.lock(), Some(false));
    match report.outcome {
        ScenarioOutcome::Failed { error, .. } => assert!(matches!(error, HarnessError::Cancelled)),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn cancelled_before_start_is_a_failure_not_a_skip() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let scenario = Scripted::new(&[], &cancel);
    let report = ScenarioRunner::new(short_timeouts(), cancel).run(&scenario).await;
    assert_eq!(report.failed_phase(), Some(Phase::Normal));
    assert!(!report.ran(Phase::Restore));
}

#[tokio::test]
async fn convergence_failure_reports_stuck_ids() {
    let (report, _) = run(&[(Phase::VerifyRecovery, Script::Fail(ErrorKind::ConvergenceFailure))]).await;
    assert_eq!(report.stuck_ids, vec!["r-1".to_string(), "r-2".to_string()]);
    assert_eq!(report.last_status.as_deref(), Some("Processing"));
    let text = report.to_string();
    assert!(text.contains("FAILED in verify-recovery"));
    assert!(text.contains("stuck: r-1, r-2"));
}

#[tokio::test]
async fn restore_failure_fails_the_run() {
    let (report, scenario) = run(&[(Phase::Restore, Script::Fail(ErrorKind::InfrastructureUnavailable))]).await;
    assert_eq!(report.failed_phase(), Some(Phase::Restore));
    assert!(!scenario.calls().contains(&Phase::VerifyRecovery));
}
