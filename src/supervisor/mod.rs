//! Service supervisor
//!
//! Locates (or builds) the API and worker binaries, launches them with an
//! env map derived from the current endpoints, waits for the API's liveness
//! endpoint and shuts both down on request.

pub mod env;
pub mod process;

pub use env::service_env;
pub use process::{OutputLog, ServiceProcess};

use crate::cancel::{sleep_cancellable, CancellationToken};
use crate::config::{BuildConfig, ServicesConfig};
use crate::error::{HarnessError, Result};
use crate::orchestrator::Endpoints;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

/// Which service binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole {
    Api,
    Worker,
}

impl ServiceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceRole::Api => "api",
            ServiceRole::Worker => "worker",
        }
    }
}

/// Running API and worker processes
pub struct ServiceSupervisor {
    api: ServiceProcess,
    worker: ServiceProcess,
    address: SocketAddr,
}

impl ServiceSupervisor {
    /// Resolve binaries, launch the API, wait for liveness, launch the worker
    pub async fn start(
        config: &ServicesConfig,
        endpoints: &Endpoints,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let api_binary = resolve_binary(ServiceRole::Api, config, cancel).await?;
        let worker_binary = resolve_binary(ServiceRole::Worker, config, cancel).await?;

        let address = free_local_address()?;
        let env = service_env(endpoints, config, address)?;

        let api = ServiceProcess::new("api", api_binary, env.clone(), config.shutdown_grace);
        let worker = ServiceProcess::new("worker", worker_binary, env, config.shutdown_grace);

        let supervisor = Self {
            api,
            worker,
            address,
        };

        supervisor.api.start()?;
        let health_url = format!("{}/health", supervisor.base_url());
        let healthy = wait_for_liveness(
            &health_url,
            config.health_interval,
            config.health_request_timeout,
            config.health_timeout,
            cancel,
        )
        .await;
        if let Err(e) = healthy {
            let tail = supervisor.api.output().tail(20).join("\n");
            tracing::error!(error = %e, output = %tail, "api never became healthy");
            supervisor.api.stop(&cancelled_token()).await?;
            return Err(e);
        }

        supervisor.worker.start()?;
        tracing::info!(address = %supervisor.address, "services running");
        Ok(supervisor)
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// `http://127.0.0.1:<port>`
    pub fn base_url(&self) -> String {
        format!("http://{}", self.address)
    }

    pub fn process(&self, role: ServiceRole) -> &ServiceProcess {
        match role {
            ServiceRole::Api => &self.api,
            ServiceRole::Worker => &self.worker,
        }
    }

    /// Both processes alive
    pub fn is_running(&self) -> bool {
        self.api.is_running() && self.worker.is_running()
    }

    pub async fn stop_worker(&self, cancel: &CancellationToken) -> Result<()> {
        self.worker.stop(cancel).await?;
        Ok(())
    }

    pub fn start_worker(&self) -> Result<()> {
        self.worker.start()
    }

    /// Stop the worker, then the API
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        let worker = self.worker.stop(cancel).await;
        let api = self.api.stop(cancel).await;
        worker?;
        api?;
        Ok(())
    }
}

fn cancelled_token() -> CancellationToken {
    let token = CancellationToken::new();
    token.cancel();
    token
}

/// Bind an ephemeral port on loopback and release it for the service
pub fn free_local_address() -> Result<SocketAddr> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?)
}

/// Poll `url` until it answers 200, each request bounded by `per_request`
pub async fn wait_for_liveness(
    url: &str,
    interval: Duration,
    per_request: Duration,
    overall: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let client = reqwest::Client::builder().timeout(per_request).build()?;
    let deadline = Instant::now() + overall;
    let mut last = String::from("no response");

    loop {
        cancel.check()?;
        match client.get(url).send().await {
            Ok(resp) if resp.status().as_u16() == 200 => return Ok(()),
            Ok(resp) => last = format!("status {}", resp.status()),
            Err(e) => last = e.to_string(),
        }
        if Instant::now() + interval > deadline {
            tracing::warn!(%url, %last, "liveness deadline reached");
            return Err(HarnessError::timeout(format!("liveness of {}", url), overall));
        }
        sleep_cancellable(cancel, interval).await?;
    }
}

/// Explicit path, then `<bin_dir>/<name>`, then an on-demand build
pub async fn resolve_binary(
    role: ServiceRole,
    config: &ServicesConfig,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    let explicit = match role {
        ServiceRole::Api => config.api_binary.as_ref(),
        ServiceRole::Worker => config.worker_binary.as_ref(),
    };
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.clone());
        }
        return Err(HarnessError::PreconditionUnmet(format!(
            "{} binary {} does not exist",
            role.as_str(),
            path.display()
        )));
    }

    let name = binary_name(role, config.build.as_ref());
    let cached = config.bin_dir.join(&name);
    if cached.is_file() {
        return Ok(cached);
    }

    match &config.build {
        Some(build) => {
            run_build(build, &name, &cached, cancel).await?;
            Ok(cached)
        }
        None => Err(HarnessError::PreconditionUnmet(format!(
            "No {} binary: set REPORTER_HARNESS_{}_BIN or configure services.build",
            role.as_str(),
            role.as_str().to_uppercase()
        ))),
    }
}

fn binary_name(role: ServiceRole, build: Option<&BuildConfig>) -> String {
    match (role, build) {
        (ServiceRole::Api, Some(b)) => b.api_name.clone(),
        (ServiceRole::Worker, Some(b)) => b.worker_name.clone(),
        (role, None) => format!("reporter-{}", role.as_str()),
    }
}

/// Substitute `{output}` and `{name}` in build arguments
pub fn build_args(build: &BuildConfig, name: &str, output: &Path) -> Vec<String> {
    build
        .args
        .iter()
        .map(|a| {
            a.replace("{output}", &output.to_string_lossy())
                .replace("{name}", name)
        })
        .collect()
}

async fn run_build(build: &BuildConfig, name: &str, output: &Path, cancel: &CancellationToken) -> Result<()> {
    if let Some(dir) = output.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let args = build_args(build, name, output);
    tracing::info!(program = %build.program, ?args, "building service binary");

    let mut cmd = tokio::process::Command::new(&build.program);
    cmd.args(&args)
        .current_dir(&build.working_dir)
        .kill_on_drop(true);

    let out = crate::cancel::run_cancellable(cancel, async { Ok(cmd.output().await?) }).await?;
    if !out.status.success() {
        return Err(HarnessError::PreconditionUnmet(format!(
            "Build of {} failed: {}",
            name,
            String::from_utf8_lossy(&out.stderr)
        )));
    }
    if !output.is_file() {
        return Err(HarnessError::PreconditionUnmet(format!(
            "Build of {} produced no file at {}",
            name,
            output.display()
        )));
    }
    Ok(())
}
