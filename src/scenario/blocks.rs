//! Reusable pieces of phase bodies

use crate::cancel::{sleep_cancellable, CancellationToken};
use crate::error::{HarnessError, Result};
use crate::models::ReportStatus;
use crate::probe::{HttpProbeClient, ProbeResponse};
use crate::supervisor::ServiceSupervisor;
use http::header::HeaderMap;
use std::time::Duration;

/// How an operation behaved while a dependency was impaired
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Degradation {
    /// Transport error, the dependency is unreachable
    Unreachable(String),
    /// The service answered with a failure status
    Status(u16),
}

/// Classify a Phase-3 observation. Transport errors and failure statuses
/// are the expected symptoms; a success is not.
pub fn expect_degraded(outcome: Result<ProbeResponse>) -> Result<Degradation> {
    match outcome {
        Ok(resp) if resp.status_code() >= 400 => Ok(Degradation::Status(resp.status_code())),
        Ok(resp) => Err(HarnessError::ProtocolViolation(format!(
            "operation succeeded with {} while its dependency was down",
            resp.status
        ))),
        Err(HarnessError::Transport(e)) => {
            tracing::info!(error = %e, "expected transport error during outage");
            Ok(Degradation::Unreachable(e))
        }
        Err(e) => Err(e),
    }
}

/// Phase-1/5 observation: anything but 2xx fails, 5xx as a protocol violation
pub fn expect_success(outcome: Result<ProbeResponse>) -> Result<ProbeResponse> {
    let resp = outcome?;
    if resp.is_server_error() {
        return Err(HarnessError::ProtocolViolation(format!(
            "server error {}: {}",
            resp.status,
            resp.text()
        )));
    }
    resp.error_for_status()
}

/// The service processes must survive any dependency fault
pub fn assert_alive(supervisor: &ServiceSupervisor) -> Result<()> {
    if supervisor.is_running() {
        Ok(())
    } else {
        Err(HarnessError::ProtocolViolation(
            "service process exited during fault window".to_string(),
        ))
    }
}

/// Wait for the service to report healthy after a restore, within the
/// configured `chaos.readiness_timeout`
pub async fn await_readiness(
    client: &HttpProbeClient,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    client.wait_for_system_health(timeout, cancel).await
}

/// Let an injected fault take effect before observing it
pub async fn let_fault_propagate(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    sleep_cancellable(cancel, delay).await
}

/// Wait for every report to reach `expected`; all stuck ids are reported together
pub async fn assert_converged(
    client: &HttpProbeClient,
    ids: &[String],
    expected: ReportStatus,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let headers = HeaderMap::new();
    let mut stuck = Vec::new();
    let mut last_status = String::new();

    let waits = ids
        .iter()
        .map(|id| client.wait_for_report_status(id, &headers, expected, timeout, cancel));
    for (id, outcome) in ids.iter().zip(futures::future::join_all(waits).await) {
        match outcome {
            Ok(_) => {}
            Err(HarnessError::ConvergenceFailure { last_status: status, .. }) => {
                stuck.push(id.clone());
                last_status = status;
            }
            Err(e) => return Err(e),
        }
    }

    if stuck.is_empty() {
        Ok(())
    } else {
        Err(HarnessError::ConvergenceFailure {
            stuck_ids: stuck,
            last_status,
            after: timeout,
        })
    }
}

/// Median round-trip of `samples` sequential GETs
pub async fn median_latency(
    client: &HttpProbeClient,
    path: &str,
    samples: usize,
    cancel: &CancellationToken,
) -> Result<Duration> {
    let mut timings = Vec::with_capacity(samples.max(1));
    for _ in 0..samples.max(1) {
        timings.push(client.get(path, cancel).await?.elapsed);
    }
    timings.sort();
    Ok(timings[timings.len() / 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::StatusCode;

    fn response(status: u16) -> Result<ProbeResponse> {
        Ok(ProbeResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"boom"),
            elapsed: Duration::ZERO,
        })
    }

    #[test]
    fn test_degradation_classification() {
        assert_eq!(expect_degraded(response(503)).unwrap(), Degradation::Status(503));
        assert_eq!(
            expect_degraded(Err(HarnessError::Transport("refused".into()))).unwrap(),
            Degradation::Unreachable("refused".into())
        );
        assert!(matches!(
            expect_degraded(response(200)),
            Err(HarnessError::ProtocolViolation(_))
        ));
        assert!(matches!(expect_degraded(Err(HarnessError::Cancelled)), Err(HarnessError::Cancelled)));
    }

    #[test]
    fn test_success_rejects_server_errors() {
        assert!(matches!(
            expect_success(response(500)),
            Err(HarnessError::ProtocolViolation(_))
        ));
        assert!(matches!(
            expect_success(response(404)),
            Err(HarnessError::UnexpectedStatus { status: 404, .. })
        ));
        assert!(expect_success(response(201)).is_ok());
    }
}
