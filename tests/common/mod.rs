#![allow(dead_code)]

//! Shared helpers for integration tests: in-process mock servers for the
//! hermetic suites, and the setup/teardown lifecycle for the docker suites.

use axum::Router;
use parking_lot::Mutex;
use reporter_harness::logging;
use reporter_harness::models::{OutputFormat, TemplateResponse};
use reporter_harness::scenario::ScenarioRunner;
use reporter_harness::{
    CancellationToken, CompositeFault, ErrorKind, Fault, HarnessConfig, HarnessError, HttpProbeClient, Infrastructure,
    ProbeConfig, Result, ScenarioReport, ServiceSupervisor,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Serve `app` on an ephemeral loopback port
pub async fn spawn_mock(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Probe settings that keep hermetic tests fast
pub fn fast_probe_config() -> ProbeConfig {
    ProbeConfig {
        timeout: Duration::from_secs(2),
        max_attempts: 3,
        base_backoff: Duration::from_millis(10),
        poll_interval: Duration::from_millis(20),
    }
}

/// Running dependencies, services and a client pointed at the API
pub struct Suite {
    pub config: HarnessConfig,
    pub infra: Arc<Infrastructure>,
    pub supervisor: Arc<ServiceSupervisor>,
    pub client: HttpProbeClient,
    pub cancel: CancellationToken,
}

impl Suite {
    /// Boot everything for one test binary. With `through_proxy` the services
    /// reach every dependency via the fault proxy.
    pub async fn setup(suite: &str, through_proxy: bool) -> Result<Self> {
        logging::init_for_tests();
        let config = HarnessConfig::for_suite(suite)?;
        let cancel = CancellationToken::new();
        let infra = Arc::new(Infrastructure::start(config.clone(), &cancel).await?);

        let started = async {
            let endpoints = if through_proxy {
                infra.start_proxy(&cancel).await?;
                infra.endpoints_via_proxy().await?
            } else {
                infra.connection_config()?
            };
            let supervisor = ServiceSupervisor::start(&config.services, &endpoints, &cancel).await?;

            let probe_config = ProbeConfig {
                poll_interval: config.chaos.poll_interval,
                ..ProbeConfig::default()
            };
            let mut client = HttpProbeClient::new(&supervisor.base_url(), probe_config)?;
            if let Some(token) = &config.services.auth_token {
                client = client.with_bearer_token(token)?;
            }
            Ok::<_, HarnessError>((Arc::new(supervisor), client))
        }
        .await;

        match started {
            Ok((supervisor, client)) => Ok(Self {
                config,
                infra,
                supervisor,
                client,
                cancel,
            }),
            Err(e) => {
                let _ = infra.stop(&CancellationToken::new()).await;
                Err(e)
            }
        }
    }

    pub fn runner(&self) -> ScenarioRunner {
        ScenarioRunner::new(self.config.chaos.phase_timeouts, self.cancel.clone())
    }

    /// Services first, then infrastructure; both always attempted
    pub async fn teardown(self) -> Result<()> {
        let cleanup = CancellationToken::new();
        let services = self.supervisor.stop(&cleanup).await;
        let infra = self.infra.stop(&cleanup).await;
        services.and(infra)
    }
}

/// Only a missing docker daemon or missing service binaries skip a suite;
/// adapter, topology and readiness failures abort it
pub fn is_skippable(err: &HarnessError) -> bool {
    err.kind() == ErrorKind::PreconditionUnmet
}

/// `None` (with a note) when docker or the service binaries are missing
pub async fn setup_or_skip(suite: &str, through_proxy: bool) -> Option<Suite> {
    match Suite::setup(suite, through_proxy).await {
        Ok(suite) => Some(suite),
        Err(e) if is_skippable(&e) => {
            eprintln!("skipping {}: {}", suite, e);
            None
        }
        Err(e) => panic!("suite {} failed to start: {}", suite, e),
    }
}

/// Upload a trivial TXT template and return its id
pub async fn create_template(client: &HttpProbeClient, cancel: &CancellationToken) -> Result<String> {
    let resp = client
        .upload_template(&b"Report generated"[..], OutputFormat::Txt, "chaos baseline", cancel)
        .await?
        .error_for_status()?;
    let template: TemplateResponse = resp.json()?;
    Ok(template.id)
}

/// Print the report, tear down, then fail the test if the scenario failed
pub async fn conclude(suite: Suite, report: ScenarioReport) {
    eprintln!("{}", report);
    let teardown = suite.teardown().await;
    if let Err(e) = report.into_result() {
        panic!("scenario failed: {}", e);
    }
    teardown.unwrap();
}

/// Faults a scenario has applied, so Restore can undo them in reverse
#[derive(Default)]
pub struct FaultSlot {
    applied: Mutex<Vec<Arc<dyn Fault>>>,
}

impl FaultSlot {
    /// Recorded before applying, so a half-applied fault is still reverted
    pub async fn apply(&self, fault: Box<dyn Fault>, cancel: &CancellationToken) -> Result<()> {
        let fault: Arc<dyn Fault> = Arc::from(fault);
        self.applied.lock().push(fault.clone());
        fault.apply(cancel).await
    }

    pub async fn revert_all(&self, cancel: &CancellationToken) -> Result<()> {
        let applied: Vec<Box<dyn Fault>> = self
            .applied
            .lock()
            .drain(..)
            .map(|f| Box::new(f) as Box<dyn Fault>)
            .collect();
        CompositeFault::new(applied).revert(cancel).await
    }

    pub fn describe(&self) -> String {
        let applied = self.applied.lock();
        if applied.is_empty() {
            "none yet".to_string()
        } else {
            applied.iter().map(|f| f.describe()).collect::<Vec<_>>().join(" + ")
        }
    }
}

/// Holds the last report status a scenario observed
#[derive(Default)]
pub struct LastStatus(Mutex<Option<String>>);

impl LastStatus {
    pub fn set(&self, status: impl ToString) {
        *self.0.lock() = Some(status.to_string());
    }

    pub fn get(&self) -> Option<String> {
        self.0.lock().clone()
    }
}
