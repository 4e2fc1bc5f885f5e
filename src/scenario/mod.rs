//! Five-phase chaos protocol
//!
//! A scenario supplies the body of each phase; [`ScenarioRunner`] enforces
//! the ordering, the per-phase deadlines, the skip rule for a failed
//! baseline and the guarantee that Restore runs once Inject has begun, even
//! after cancellation or a panic.

pub mod blocks;

use crate::cancel::{run_cancellable, CancellationToken};
use crate::config::PhaseTimeouts;
use crate::error::{ErrorKind, HarnessError, Result};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Normal,
    Inject,
    VerifyFailure,
    Restore,
    VerifyRecovery,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Normal,
        Phase::Inject,
        Phase::VerifyFailure,
        Phase::Restore,
        Phase::VerifyRecovery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Normal => "normal",
            Phase::Inject => "inject",
            Phase::VerifyFailure => "verify-failure",
            Phase::Restore => "restore",
            Phase::VerifyRecovery => "verify-recovery",
        }
    }

    pub fn timeout(&self, timeouts: &PhaseTimeouts) -> Duration {
        match self {
            Phase::Normal => timeouts.normal,
            Phase::Inject => timeouts.inject,
            Phase::VerifyFailure => timeouts.verify_failure,
            Phase::Restore => timeouts.restore,
            Phase::VerifyRecovery => timeouts.verify_recovery,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a phase body gets to work with
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub phase: Phase,
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl PhaseContext {
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// The body of one chaos scenario
#[async_trait]
pub trait ChaosScenario: Send + Sync {
    fn name(&self) -> &str;

    /// Label of the injected fault, for reporting
    fn fault(&self) -> String;

    /// Last status the scenario observed, if it tracks one
    fn last_status(&self) -> Option<String> {
        None
    }

    /// Baseline check. Failure skips the scenario.
    async fn normal(&self, ctx: &PhaseContext) -> Result<()>;

    async fn inject(&self, ctx: &PhaseContext) -> Result<()>;

    async fn verify_failure(&self, ctx: &PhaseContext) -> Result<()>;

    /// Runs whenever `inject` has begun, on a token the caller cannot cancel
    async fn restore(&self, ctx: &PhaseContext) -> Result<()>;

    async fn verify_recovery(&self, ctx: &PhaseContext) -> Result<()>;
}

#[derive(Debug)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub elapsed: Duration,
    pub error: Option<String>,
}

#[derive(Debug)]
pub enum ScenarioOutcome {
    Passed,
    Skipped { reason: String },
    Failed { phase: Phase, error: HarnessError },
}

/// Result of one scenario run
#[derive(Debug)]
pub struct ScenarioReport {
    pub name: String,
    pub fault: String,
    pub phases: Vec<PhaseRecord>,
    pub outcome: ScenarioOutcome,
    pub last_status: Option<String>,
    pub stuck_ids: Vec<String>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        matches!(self.outcome, ScenarioOutcome::Passed)
    }

    pub fn skipped(&self) -> bool {
        matches!(self.outcome, ScenarioOutcome::Skipped { .. })
    }

    pub fn failed_phase(&self) -> Option<Phase> {
        match &self.outcome {
            ScenarioOutcome::Failed { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    pub fn ran(&self, phase: Phase) -> bool {
        self.phases.iter().any(|p| p.phase == phase)
    }

    /// `Ok` for passed and skipped runs, the failing error otherwise
    pub fn into_result(self) -> Result<()> {
        match self.outcome {
            ScenarioOutcome::Failed { error, .. } => Err(error),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            ScenarioOutcome::Passed => write!(f, "scenario {}: passed (fault: {})", self.name, self.fault),
            ScenarioOutcome::Skipped { reason } => {
                write!(f, "scenario {}: SKIPPED, baseline not met: {}", self.name, reason)
            }
            ScenarioOutcome::Failed { phase, error } => {
                write!(f, "scenario {}: FAILED in {} (fault: {}", self.name, phase, self.fault)?;
                if let Some(status) = &self.last_status {
                    write!(f, ", last status: {}", status)?;
                }
                if !self.stuck_ids.is_empty() {
                    write!(f, ", stuck: {}", self.stuck_ids.join(", "))?;
                }
                write!(f, "): {}", error)
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Drives scenarios through the five phases
#[derive(Debug, Clone)]
pub struct ScenarioRunner {
    timeouts: PhaseTimeouts,
    cancel: CancellationToken,
}

impl ScenarioRunner {
    pub fn new(timeouts: PhaseTimeouts, cancel: CancellationToken) -> Self {
        Self { timeouts, cancel }
    }

    pub fn timeouts(&self) -> &PhaseTimeouts {
        &self.timeouts
    }

    async fn run_phase(
        &self,
        scenario: &dyn ChaosScenario,
        phase: Phase,
        cancel: &CancellationToken,
        phases: &mut Vec<PhaseRecord>,
    ) -> Result<()> {
        let timeout = phase.timeout(&self.timeouts);
        let started = Instant::now();
        let ctx = PhaseContext {
            phase,
            deadline: started + timeout,
            cancel: cancel.clone(),
        };
        tracing::info!(%phase, fault = %scenario.fault(), "phase started");

        let body = async {
            match phase {
                Phase::Normal => scenario.normal(&ctx).await,
                Phase::Inject => scenario.inject(&ctx).await,
                Phase::VerifyFailure => scenario.verify_failure(&ctx).await,
                Phase::Restore => scenario.restore(&ctx).await,
                Phase::VerifyRecovery => scenario.verify_recovery(&ctx).await,
            }
        };
        let guarded = async {
            match AssertUnwindSafe(body).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(HarnessError::ProtocolViolation(format!(
                    "phase {} panicked: {}",
                    phase,
                    panic_message(payload)
                ))),
            }
        };

        let result = match tokio::time::timeout(timeout, run_cancellable(cancel, guarded)).await {
            Ok(result) => result,
            Err(_) => Err(HarnessError::timeout(format!("phase {}", phase), timeout)),
        };

        let elapsed = started.elapsed();
        match &result {
            Ok(()) => tracing::info!(%phase, ?elapsed, last_status = ?scenario.last_status(), "phase passed"),
            Err(e) => tracing::warn!(
                %phase,
                ?elapsed,
                error = %e,
                last_status = ?scenario.last_status(),
                "phase failed"
            ),
        }
        phases.push(PhaseRecord {
            phase,
            elapsed,
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }

    /// Run all phases of `scenario` and report what happened
    pub async fn run(&self, scenario: &dyn ChaosScenario) -> ScenarioReport {
        let span = tracing::info_span!("scenario", name = %scenario.name(), fault = %scenario.fault());
        self.run_inner(scenario).instrument(span).await
    }

    async fn run_inner(&self, scenario: &dyn ChaosScenario) -> ScenarioReport {
        let mut phases = Vec::new();
        let outcome = self.drive(scenario, &mut phases).await;

        let (last_status, stuck_ids) = match &outcome {
            ScenarioOutcome::Failed {
                error: HarnessError::ConvergenceFailure {
                    stuck_ids, last_status, ..
                },
                ..
            } => (Some(last_status.clone()), stuck_ids.clone()),
            _ => (scenario.last_status(), Vec::new()),
        };

        let report = ScenarioReport {
            name: scenario.name().to_string(),
            fault: scenario.fault(),
            phases,
            outcome,
            last_status,
            stuck_ids,
        };
        match &report.outcome {
            ScenarioOutcome::Passed => tracing::info!("{}", report),
            ScenarioOutcome::Skipped { .. } => tracing::warn!("{}", report),
            ScenarioOutcome::Failed { .. } => tracing::error!("{}", report),
        }
        report
    }

    async fn drive(&self, scenario: &dyn ChaosScenario, phases: &mut Vec<PhaseRecord>) -> ScenarioOutcome {
        if let Err(error) = self.run_phase(scenario, Phase::Normal, &self.cancel, phases).await {
            return match error.kind() {
                ErrorKind::Cancelled | ErrorKind::ProtocolViolation => ScenarioOutcome::Failed {
                    phase: Phase::Normal,
                    error,
                },
                _ => ScenarioOutcome::Skipped {
                    reason: error.to_string(),
                },
            };
        }

        let mut failure = None;
        match self.run_phase(scenario, Phase::Inject, &self.cancel, phases).await {
            Err(error) => failure = Some((Phase::Inject, error)),
            Ok(()) => {
                if let Err(error) = self.run_phase(scenario, Phase::VerifyFailure, &self.cancel, phases).await {
                    failure = Some((Phase::VerifyFailure, error));
                }
            }
        }

        // Restore must not observe the caller's cancellation
        let detached = CancellationToken::new();
        let restored = self.run_phase(scenario, Phase::Restore, &detached, phases).await;

        if let Some((phase, error)) = failure {
            if let Err(restore_error) = restored {
                tracing::error!(error = %restore_error, "restore after failure also failed");
            }
            return ScenarioOutcome::Failed { phase, error };
        }
        if let Err(error) = restored {
            return ScenarioOutcome::Failed {
                phase: Phase::Restore,
                error,
            };
        }

        match self.run_phase(scenario, Phase::VerifyRecovery, &self.cancel, phases).await {
            Ok(()) => ScenarioOutcome::Passed,
            Err(error) => ScenarioOutcome::Failed {
                phase: Phase::VerifyRecovery,
                error,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_and_names() {
        let names: Vec<_> = Phase::ALL.iter().map(Phase::as_str).collect();
        assert_eq!(
            names,
            vec!["normal", "inject", "verify-failure", "restore", "verify-recovery"]
        );
        assert!(Phase::Inject < Phase::Restore);
    }

    #[test]
    fn test_failed_report_lists_stuck_ids() {
        let report = ScenarioReport {
            name: "broker-restart".into(),
            fault: "container restart (broker, down 10s)".into(),
            phases: Vec::new(),
            outcome: ScenarioOutcome::Failed {
                phase: Phase::VerifyRecovery,
                error: HarnessError::ConvergenceFailure {
                    stuck_ids: vec!["r-1".into()],
                    last_status: "Processing".into(),
                    after: Duration::from_secs(60),
                },
            },
            last_status: Some("Processing".into()),
            stuck_ids: vec!["r-1".into()],
        };
        let text = report.to_string();
        assert!(text.contains("FAILED in verify-recovery"));
        assert!(text.contains("last status: Processing"));
        assert!(text.contains("stuck: r-1"));
    }

    #[test]
    fn test_skipped_report_has_no_success_banner() {
        let report = ScenarioReport {
            name: "cache-latency".into(),
            fault: "proxy latency".into(),
            phases: Vec::new(),
            outcome: ScenarioOutcome::Skipped {
                reason: "service unhealthy".into(),
            },
            last_status: None,
            stuck_ids: Vec::new(),
        };
        assert!(!report.to_string().contains("passed"));
        assert!(report.skipped());
        assert!(report.into_result().is_ok());
    }
}
