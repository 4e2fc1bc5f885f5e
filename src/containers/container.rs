//! One docker container with a readiness strategy and port bookkeeping

use crate::cancel::{sleep_cancellable, CancellationToken};
use crate::docker::{ContainerSpec, DockerCli};
use crate::error::{HarnessError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;

const READINESS_POLL: Duration = Duration::from_millis(250);

/// How to decide a freshly started container is usable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitStrategy {
    /// A TCP connect to the host port mapped for `container_port` succeeds
    Tcp { container_port: u16 },
    /// `message` has appeared in the logs at least `occurrences` times
    Log { message: String, occurrences: usize },
    /// `GET path` on the mapped port answers `status`
    Http {
        container_port: u16,
        path: String,
        status: u16,
    },
}

impl WaitStrategy {
    pub fn log(message: impl Into<String>, occurrences: usize) -> Self {
        WaitStrategy::Log {
            message: message.into(),
            occurrences,
        }
    }
}

/// A container owned by one adapter.
///
/// Lifecycle calls are serialized through a mutation lock so a fault and a
/// teardown never interleave on the same container.
pub struct ManagedContainer {
    docker: DockerCli,
    spec: ContainerSpec,
    first_boot: WaitStrategy,
    restart: WaitStrategy,
    startup_timeout: Duration,
    stop_grace_secs: u32,
    id: RwLock<Option<String>>,
    host_ports: RwLock<HashMap<u16, u16>>,
    mutation: Mutex<()>,
}

impl ManagedContainer {
    pub fn new(
        docker: DockerCli,
        spec: ContainerSpec,
        first_boot: WaitStrategy,
        startup_timeout: Duration,
        stop_grace_secs: u32,
    ) -> Self {
        Self {
            docker,
            spec,
            restart: first_boot.clone(),
            first_boot,
            startup_timeout,
            stop_grace_secs,
            id: RwLock::new(None),
            host_ports: RwLock::new(HashMap::new()),
            mutation: Mutex::new(()),
        }
    }

    /// Use a different readiness check after `start` than after `launch`
    pub fn with_restart_wait(mut self, strategy: WaitStrategy) -> Self {
        self.restart = strategy;
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn alias(&self) -> &str {
        &self.spec.alias
    }

    pub fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    pub fn docker(&self) -> &DockerCli {
        &self.docker
    }

    pub fn id(&self) -> Option<String> {
        self.id.read().clone()
    }

    fn require_id(&self) -> Result<String> {
        self.id().ok_or_else(|| {
            HarnessError::InfrastructureUnavailable(format!("{} has not been launched", self.spec.name))
        })
    }

    /// Create and start the container, then wait for first-boot readiness.
    /// A container that never becomes ready is removed before returning.
    pub async fn launch(&self, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.mutation.lock().await;

        let id = self.docker.run_container(&self.spec, cancel).await?;
        *self.id.write() = Some(id.clone());
        tracing::info!(container = %self.spec.name, image = %self.spec.image, "container created");

        let ready = async {
            self.refresh_ports_locked(cancel).await?;
            self.wait_ready(&id, &self.first_boot, None, cancel).await
        }
        .await;

        if let Err(e) = ready {
            tracing::warn!(container = %self.spec.name, error = %e, "container failed to become ready");
            let cleanup = CancellationToken::new();
            if let Err(rm) = self.docker.remove(&id, &cleanup).await {
                tracing::warn!(container = %self.spec.name, error = %rm, "cleanup after failed launch");
            }
            *self.id.write() = None;
            return Err(e);
        }
        Ok(())
    }

    /// Take over an already-running container of the same name
    pub async fn adopt(&self, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.mutation.lock().await;
        *self.id.write() = Some(self.spec.name.clone());
        if let Err(e) = self.refresh_ports_locked(cancel).await {
            *self.id.write() = None;
            return Err(e);
        }
        Ok(())
    }

    pub async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.mutation.lock().await;
        let id = self.require_id()?;
        self.docker.stop(&id, self.stop_grace_secs, cancel).await?;
        tracing::info!(container = %self.spec.name, "container stopped");
        Ok(())
    }

    /// Start a stopped container and wait for it to serve again.
    /// Ephemeral host ports are re-read since docker may have reassigned them.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.mutation.lock().await;
        let id = self.require_id()?;
        let since = Utc::now();
        self.docker.start(&id, cancel).await?;
        self.refresh_ports_locked(cancel).await?;
        self.wait_ready(&id, &self.restart, Some(since), cancel).await?;
        tracing::info!(container = %self.spec.name, "container started");
        Ok(())
    }

    /// Remove the container and its anonymous volumes
    pub async fn terminate(&self, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.mutation.lock().await;
        let id = self.id.write().take();
        if let Some(id) = id {
            self.docker.remove(&id, cancel).await?;
            tracing::info!(container = %self.spec.name, "container removed");
        }
        self.host_ports.write().clear();
        Ok(())
    }

    /// Host port bound to `container_port`, as last observed
    pub fn host_port(&self, container_port: u16) -> Result<u16> {
        self.host_ports
            .read()
            .get(&container_port)
            .copied()
            .ok_or_else(|| {
                HarnessError::InfrastructureUnavailable(format!(
                    "{} publishes no host port for {}",
                    self.spec.name, container_port
                ))
            })
    }

    /// Re-read the published ports from the daemon
    pub async fn refresh_ports(&self, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.mutation.lock().await;
        self.refresh_ports_locked(cancel).await
    }

    async fn refresh_ports_locked(&self, cancel: &CancellationToken) -> Result<()> {
        let id = self.require_id()?;
        let mut ports = HashMap::with_capacity(self.spec.ports.len());
        for binding in &self.spec.ports {
            let host = match binding.host_port {
                Some(fixed) => fixed,
                None => self.docker.port(&id, binding.container_port, cancel).await?,
            };
            ports.insert(binding.container_port, host);
        }
        *self.host_ports.write() = ports;
        Ok(())
    }

    pub async fn is_running(&self, cancel: &CancellationToken) -> Result<bool> {
        match self.id() {
            Some(id) => Ok(self.docker.state(&id, cancel).await? == "running"),
            None => Ok(false),
        }
    }

    async fn wait_ready(
        &self,
        id: &str,
        strategy: &WaitStrategy,
        since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = Instant::now() + self.startup_timeout;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        loop {
            cancel.check()?;

            let state = self.docker.state(id, cancel).await?;
            if state == "exited" || state == "dead" {
                let logs = self.docker.logs_since(id, since, cancel).await.unwrap_or_default();
                return Err(HarnessError::InfrastructureUnavailable(format!(
                    "{} exited during startup: {}",
                    self.spec.name,
                    tail(&logs, 20)
                )));
            }

            if state == "running" && self.probe(id, strategy, since, &http, cancel).await? {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(HarnessError::timeout(
                    format!("{} readiness", self.spec.name),
                    self.startup_timeout,
                ));
            }
            sleep_cancellable(cancel, READINESS_POLL).await?;
        }
    }

    async fn probe(
        &self,
        id: &str,
        strategy: &WaitStrategy,
        since: Option<DateTime<Utc>>,
        http: &reqwest::Client,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        match strategy {
            WaitStrategy::Tcp { container_port } => {
                let port = self.host_port(*container_port)?;
                let connect = TcpStream::connect(("127.0.0.1", port));
                Ok(matches!(
                    tokio::time::timeout(Duration::from_secs(1), connect).await,
                    Ok(Ok(_))
                ))
            }
            WaitStrategy::Log {
                message,
                occurrences,
            } => {
                let logs = self.docker.logs_since(id, since, cancel).await?;
                Ok(logs.matches(message.as_str()).count() >= *occurrences)
            }
            WaitStrategy::Http {
                container_port,
                path,
                status,
            } => {
                let port = self.host_port(*container_port)?;
                let url = format!("http://127.0.0.1:{}{}", port, path);
                Ok(match http.get(&url).send().await {
                    Ok(resp) => resp.status().as_u16() == *status,
                    Err(_) => false,
                })
            }
        }
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
