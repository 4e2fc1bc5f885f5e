//! Infrastructure orchestrator
//!
//! Owns the private network, the four dependency adapters and the optional
//! fault proxy. Adapters start concurrently; teardown runs proxy first, then
//! dependencies in reverse creation order, then the network.

use crate::cancel::CancellationToken;
use crate::config::{HarnessConfig, TopologyConfig};
use crate::containers::{
    AdapterContext, BrokerAdapter, CacheAdapter, DependencyAdapter, DependencyEndpoint, DependencyKind,
    DocumentStoreAdapter, ObjectStoreAdapter,
};
use crate::docker::{DockerCli, SESSION_LABEL};
use crate::error::{HarnessError, Result};
use crate::proxy::FaultProxy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinSet;
use uuid::Uuid;

/// Connection details for every dependency, plus the names the service needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub dependencies: BTreeMap<DependencyKind, DependencyEndpoint>,
    pub document_database: String,
    pub broker_vhost: String,
    pub topology: TopologyConfig,
    pub bucket: String,
    pub region: String,
    pub cache_database: u8,
}

impl Endpoints {
    pub fn get(&self, kind: DependencyKind) -> Result<&DependencyEndpoint> {
        self.dependencies
            .get(&kind)
            .ok_or_else(|| HarnessError::PreconditionUnmet(format!("No endpoint for {}", kind)))
    }

    /// Replace the endpoint for one dependency
    pub fn with_endpoint(mut self, endpoint: DependencyEndpoint) -> Self {
        self.dependencies.insert(endpoint.kind, endpoint);
        self
    }
}

/// Leftovers found by label after teardown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResidualResources {
    pub containers: Vec<String>,
    pub networks: Vec<String>,
}

impl ResidualResources {
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty() && self.networks.is_empty()
    }
}

/// Held for the duration of a scenario that mutates shared infrastructure
pub struct ScenarioLease {
    _guard: OwnedMutexGuard<()>,
}

/// Handle to one running set of dependency containers
pub struct Infrastructure {
    config: HarnessConfig,
    docker: DockerCli,
    session: String,
    network: String,
    ctx: AdapterContext,
    document_store: Arc<DocumentStoreAdapter>,
    broker: Arc<BrokerAdapter>,
    cache: Arc<CacheAdapter>,
    object_store: Arc<ObjectStoreAdapter>,
    proxy: AsyncMutex<Option<Arc<FaultProxy>>>,
    lease: Arc<AsyncMutex<()>>,
    stopped: AtomicBool,
}

impl Infrastructure {
    /// Create the network and bring every dependency up in parallel.
    ///
    /// If any adapter fails, the ones that did start are terminated and the
    /// network removed before the combined error is returned.
    pub async fn start(config: HarnessConfig, cancel: &CancellationToken) -> Result<Self> {
        config.validate()?;
        let docker = DockerCli::new(&config.docker.binary, config.docker.command_timeout);
        let version = docker.ensure_daemon(cancel).await?;

        let session = Uuid::new_v4().simple().to_string()[..12].to_string();
        let network = format!("{}-{}", config.docker.network_prefix, session);
        tracing::info!(%network, %session, docker = %version, "starting infrastructure");

        let labels: BTreeMap<String, String> = [(SESSION_LABEL.to_string(), session.clone())]
            .into_iter()
            .collect();
        docker.network_create(&network, &labels, cancel).await?;

        let infra = Self::assemble(config, docker, session, network);

        let started: Arc<Mutex<Vec<DependencyKind>>> = Arc::new(Mutex::new(Vec::new()));
        let failures: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = JoinSet::new();
        for adapter in infra.adapters() {
            let started = started.clone();
            let failures = failures.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let kind = adapter.kind();
                match adapter.launch(&cancel).await {
                    Ok(_) => started.lock().push(kind),
                    Err(e) => {
                        // Launch removes its own container on failure
                        tracing::error!(dependency = %kind, error = %e, "dependency failed to start");
                        failures.lock().push(format!("{}: {}", kind, e));
                    }
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                failures.lock().push(format!("startup task: {}", e));
            }
        }

        let failures = std::mem::take(&mut *failures.lock());
        if failures.is_empty() {
            tracing::info!(network = %infra.network, "infrastructure ready");
            return Ok(infra);
        }

        let started = started.lock().clone();
        tracing::warn!(started = ?started, failed = failures.len(), "rolling back partial startup");
        infra.rollback().await;
        if cancel.is_cancelled() {
            return Err(HarnessError::Cancelled);
        }
        Err(HarnessError::Startup { failures })
    }

    fn assemble(config: HarnessConfig, docker: DockerCli, session: String, network: String) -> Self {
        let ctx = AdapterContext {
            docker: docker.clone(),
            network: network.clone(),
            session: session.clone(),
            startup_timeout: config.docker.startup_timeout,
            stop_grace_secs: config.docker.stop_grace_secs,
        };
        Self {
            document_store: Arc::new(DocumentStoreAdapter::new(&ctx, &config.document_store)),
            broker: Arc::new(BrokerAdapter::new(&ctx, &config.broker)),
            cache: Arc::new(CacheAdapter::new(&ctx, &config.cache)),
            object_store: Arc::new(ObjectStoreAdapter::new(&ctx, &config.object_store)),
            config,
            docker,
            session,
            network,
            ctx,
            proxy: AsyncMutex::new(None),
            lease: Arc::new(AsyncMutex::new(())),
            stopped: AtomicBool::new(false),
        }
    }

    /// Handle to a session started elsewhere (e.g. by `reporter-harness up`).
    /// Containers are found by their deterministic names and their ports
    /// re-read; nothing is created.
    pub async fn attach(config: HarnessConfig, session: &str, cancel: &CancellationToken) -> Result<Self> {
        config.validate()?;
        let docker = DockerCli::new(&config.docker.binary, config.docker.command_timeout);
        let network = format!("{}-{}", config.docker.network_prefix, session);
        let infra = Self::assemble(config, docker, session.to_string(), network);
        for adapter in infra.adapters() {
            adapter.container().adopt(cancel).await?;
        }
        tracing::info!(network = %infra.network, "attached to running infrastructure");
        Ok(infra)
    }

    /// Tear down partially started adapters after a failed start
    ///
    /// Every adapter is visited since one may own a container whose
    /// provisioning failed; terminating a never-launched adapter is a no-op.
    async fn rollback(&self) {
        let cleanup = CancellationToken::new();
        for adapter in self.adapters().into_iter().rev() {
            if let Err(e) = adapter.terminate(&cleanup).await {
                tracing::warn!(dependency = %adapter.kind(), error = %e, "rollback terminate failed");
            }
        }
        if let Err(e) = self.docker.network_remove(&self.network, &cleanup).await {
            tracing::warn!(network = %self.network, error = %e, "rollback network removal failed");
        }
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Every adapter, in creation order
    pub fn adapters(&self) -> Vec<Arc<dyn DependencyAdapter>> {
        DependencyKind::ALL
            .into_iter()
            .map(|kind| self.adapter(kind))
            .collect()
    }

    pub fn adapter(&self, kind: DependencyKind) -> Arc<dyn DependencyAdapter> {
        match kind {
            DependencyKind::DocumentStore => self.document_store.clone() as Arc<dyn DependencyAdapter>,
            DependencyKind::Broker => self.broker.clone(),
            DependencyKind::Cache => self.cache.clone(),
            DependencyKind::ObjectStore => self.object_store.clone(),
        }
    }

    pub fn document_store(&self) -> &Arc<DocumentStoreAdapter> {
        &self.document_store
    }

    pub fn broker(&self) -> &Arc<BrokerAdapter> {
        &self.broker
    }

    pub fn cache(&self) -> &Arc<CacheAdapter> {
        &self.cache
    }

    pub fn object_store(&self) -> &Arc<ObjectStoreAdapter> {
        &self.object_store
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn docker(&self) -> &DockerCli {
        &self.docker
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Direct endpoints of every dependency
    pub fn connection_config(&self) -> Result<Endpoints> {
        let mut dependencies = BTreeMap::new();
        for adapter in self.adapters() {
            dependencies.insert(adapter.kind(), adapter.endpoint()?);
        }
        Ok(Endpoints {
            dependencies,
            document_database: self.config.document_store.database.clone(),
            broker_vhost: self.config.broker.vhost.clone(),
            topology: self.config.broker.topology.clone(),
            bucket: self.config.object_store.bucket.clone(),
            region: self.config.object_store.region.clone(),
            cache_database: self.config.cache.database,
        })
    }

    /// Start the fault proxy with one binding per dependency.
    /// Idempotent; returns the running proxy on repeat calls.
    pub async fn start_proxy(&self, cancel: &CancellationToken) -> Result<Arc<FaultProxy>> {
        if !self.config.proxy.enabled {
            return Err(HarnessError::PreconditionUnmet(
                "Fault proxy is disabled by configuration".to_string(),
            ));
        }

        let mut slot = self.proxy.lock().await;
        if let Some(proxy) = slot.as_ref() {
            return Ok(proxy.clone());
        }

        // Bindings are built from live endpoints, so every adapter must be up
        let endpoints = self.connection_config()?;
        let upstreams: Vec<DependencyEndpoint> = endpoints.dependencies.into_values().collect();
        let proxy = Arc::new(FaultProxy::new(&self.ctx, &self.config.proxy, &upstreams)?);

        if let Err(e) = proxy.launch(cancel).await {
            let cleanup = CancellationToken::new();
            if let Err(rm) = proxy.terminate(&cleanup).await {
                tracing::warn!(error = %rm, "failed to remove proxy after failed launch");
            }
            return Err(e);
        }

        *slot = Some(proxy.clone());
        Ok(proxy)
    }

    pub async fn proxy(&self) -> Option<Arc<FaultProxy>> {
        self.proxy.lock().await.clone()
    }

    /// Binding name to host port for the running proxy
    pub async fn proxy_endpoints(&self) -> Result<BTreeMap<String, u16>> {
        match self.proxy().await {
            Some(proxy) => proxy.endpoints(),
            None => Err(HarnessError::PreconditionUnmet("Fault proxy not started".to_string())),
        }
    }

    /// Endpoints that route every dependency through the proxy
    pub async fn endpoints_via_proxy(&self) -> Result<Endpoints> {
        let proxy = self
            .proxy()
            .await
            .ok_or_else(|| HarnessError::PreconditionUnmet("Fault proxy not started".to_string()))?;
        let mut endpoints = self.connection_config()?;
        for kind in DependencyKind::ALL {
            endpoints = endpoints.with_endpoint(proxy.host_endpoint(kind)?);
        }
        Ok(endpoints)
    }

    /// Exclusive right to mutate shared infrastructure
    pub async fn lease(&self) -> ScenarioLease {
        ScenarioLease {
            _guard: self.lease.clone().lock_owned().await,
        }
    }

    /// Tear everything down: proxy, dependencies in reverse, network.
    /// Keeps going after individual failures and reports them together.
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.config.docker.keep_infra {
            tracing::warn!(network = %self.network, session = %self.session, "keeping infrastructure for inspection");
            return Ok(());
        }

        let mut failures = Vec::new();

        if let Some(proxy) = self.proxy.lock().await.take() {
            if let Err(e) = proxy.terminate(cancel).await {
                failures.push(format!("proxy: {}", e));
            }
        }

        for adapter in self.adapters().into_iter().rev() {
            if let Err(e) = adapter.terminate(cancel).await {
                failures.push(format!("{}: {}", adapter.kind(), e));
            }
        }

        if let Err(e) = self.docker.network_remove(&self.network, cancel).await {
            failures.push(format!("network: {}", e));
        }

        if failures.is_empty() {
            tracing::info!(network = %self.network, "infrastructure stopped");
            Ok(())
        } else {
            Err(HarnessError::InfrastructureUnavailable(format!(
                "Teardown incomplete: {}",
                failures.join("; ")
            )))
        }
    }

    /// Containers and networks still labelled with this session
    pub async fn residual_resources(&self, cancel: &CancellationToken) -> Result<ResidualResources> {
        residual_resources(&self.docker, &self.session, cancel).await
    }
}

/// Containers and networks labelled with `session`
pub async fn residual_resources(
    docker: &DockerCli,
    session: &str,
    cancel: &CancellationToken,
) -> Result<ResidualResources> {
    Ok(ResidualResources {
        containers: docker.containers_with_label(SESSION_LABEL, session, cancel).await?,
        networks: docker.networks_with_label(SESSION_LABEL, session, cancel).await?,
    })
}

/// Force-remove everything labelled with `session`; returns what was removed
pub async fn sweep_session_resources(
    docker: &DockerCli,
    session: &str,
    cancel: &CancellationToken,
) -> Result<ResidualResources> {
    let found = residual_resources(docker, session, cancel).await?;
    for id in &found.containers {
        docker.remove(id, cancel).await?;
    }
    for network in &found.networks {
        docker.network_remove(network, cancel).await?;
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::Credentials;

    fn endpoint(kind: DependencyKind, port: u16) -> DependencyEndpoint {
        DependencyEndpoint {
            kind,
            host: "127.0.0.1".into(),
            client_port: port,
            admin_port: None,
            credentials: Credentials::default(),
            upstream_alias: kind.as_str().into(),
            upstream_port: port,
        }
    }

    #[test]
    fn test_endpoint_override() {
        let endpoints = Endpoints {
            dependencies: [(DependencyKind::Cache, endpoint(DependencyKind::Cache, 36379))]
                .into_iter()
                .collect(),
            document_database: "reporter".into(),
            broker_vhost: "/".into(),
            topology: TopologyConfig::default(),
            bucket: "reporter-storage".into(),
            region: "us-east-1".into(),
            cache_database: 0,
        };
        let proxied = endpoints
            .clone()
            .with_endpoint(endpoint(DependencyKind::Cache, 49001));
        assert_eq!(proxied.get(DependencyKind::Cache).unwrap().client_port, 49001);
        assert_eq!(endpoints.get(DependencyKind::Cache).unwrap().client_port, 36379);
        assert!(endpoints.get(DependencyKind::Broker).is_err());
    }

    #[test]
    fn test_residual_empty() {
        assert!(ResidualResources::default().is_empty());
        let left = ResidualResources {
            containers: vec!["abc".into()],
            networks: vec![],
        };
        assert!(!left.is_empty());
    }

    #[tokio::test]
    async fn test_start_without_docker_is_precondition() {
        let mut config = HarnessConfig::default();
        config.docker.binary = "/nonexistent/docker".into();
        let err = Infrastructure::start(config, &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HarnessError::PreconditionUnmet(_)));
    }
}
