//! Dependency container adapters
//!
//! One adapter per dependency kind. Each wraps a [`ManagedContainer`] and adds
//! the first-boot provisioning that dependency needs (topology, buckets).

pub mod broker;
pub mod cache;
pub mod container;
pub mod document_store;
pub mod object_store;
pub mod s3;
pub mod topology;

pub use broker::BrokerAdapter;
pub use cache::CacheAdapter;
pub use container::{ManagedContainer, WaitStrategy};
pub use document_store::DocumentStoreAdapter;
pub use object_store::ObjectStoreAdapter;

use crate::cancel::{sleep_cancellable, CancellationToken};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Logical dependency of the report service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyKind {
    DocumentStore,
    Broker,
    Cache,
    ObjectStore,
}

impl DependencyKind {
    pub const ALL: [DependencyKind; 4] = [
        DependencyKind::DocumentStore,
        DependencyKind::Broker,
        DependencyKind::Cache,
        DependencyKind::ObjectStore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyKind::DocumentStore => "document-store",
            DependencyKind::Broker => "broker",
            DependencyKind::Cache => "cache",
            DependencyKind::ObjectStore => "object-store",
        }
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DependencyKind {
    type Err = crate::error::HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        DependencyKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| crate::error::HarnessError::Config(format!("Unknown dependency: {}", s)))
    }
}

/// Credentials a client needs for a dependency
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: Option<&str>, password: Option<&str>) -> Self {
        Self {
            username: username.map(String::from),
            password: password.map(String::from),
        }
    }
}

/// How the host (and the service processes) reach a dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEndpoint {
    pub kind: DependencyKind,
    pub host: String,
    pub client_port: u16,
    pub admin_port: Option<u16>,
    pub credentials: Credentials,
    /// Name on the private network
    pub upstream_alias: String,
    /// Client port inside the container
    pub upstream_port: u16,
}

impl DependencyEndpoint {
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.client_port)
    }

    pub fn upstream(&self) -> String {
        format!("{}:{}", self.upstream_alias, self.upstream_port)
    }

    /// Same endpoint reached through another host port (a proxy listener)
    pub fn via(&self, host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            client_port: port,
            ..self.clone()
        }
    }
}

/// Lifecycle contract shared by every dependency adapter
#[async_trait]
pub trait DependencyAdapter: Send + Sync {
    fn kind(&self) -> DependencyKind;

    fn container(&self) -> &ManagedContainer;

    /// Client port inside the container
    fn client_port(&self) -> u16;

    fn alias(&self) -> &str {
        self.container().alias()
    }

    /// Endpoint computed from the last observed host ports
    fn endpoint(&self) -> Result<DependencyEndpoint>;

    /// Work done once after the first successful boot
    async fn provision(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    /// Work done after every start that follows a stop
    async fn after_restart(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    /// Create the container, wait for it, provision it
    async fn launch(&self, cancel: &CancellationToken) -> Result<DependencyEndpoint> {
        self.container().launch(cancel).await?;
        self.provision(cancel).await?;
        let endpoint = self.endpoint()?;
        tracing::info!(dependency = %self.kind(), endpoint = %endpoint.host_port(), "dependency ready");
        Ok(endpoint)
    }

    async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        tracing::info!(dependency = %self.kind(), "stopping dependency");
        self.container().stop(cancel).await
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        tracing::info!(dependency = %self.kind(), "starting dependency");
        self.container().start(cancel).await?;
        self.after_restart(cancel).await
    }

    /// Stop, stay down for `delay`, start again
    async fn restart(&self, delay: Duration, cancel: &CancellationToken) -> Result<()> {
        self.stop(cancel).await?;
        sleep_cancellable(cancel, delay).await?;
        self.start(cancel).await
    }

    async fn terminate(&self, cancel: &CancellationToken) -> Result<()> {
        self.container().terminate(cancel).await
    }

    /// Re-read host ports and return the endpoint they imply
    async fn refresh_endpoint(&self, cancel: &CancellationToken) -> Result<DependencyEndpoint> {
        self.container().refresh_ports(cancel).await?;
        self.endpoint()
    }
}

/// Shared construction parameters for adapters
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub docker: crate::docker::DockerCli,
    pub network: String,
    pub session: String,
    pub startup_timeout: Duration,
    pub stop_grace_secs: u32,
}

impl AdapterContext {
    /// Container name unique to this session
    pub fn container_name(&self, alias: &str) -> String {
        format!("{}-{}", self.network, alias)
    }

    /// Spec pre-filled with name, network, alias and session label
    pub fn spec(&self, alias: &str, image: &str) -> crate::docker::ContainerSpec {
        crate::docker::ContainerSpec::new(self.container_name(alias), image, &self.network)
            .alias(alias)
            .label(crate::docker::SESSION_LABEL, &self.session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in DependencyKind::ALL {
            assert_eq!(kind.as_str().parse::<DependencyKind>().unwrap(), kind);
        }
        assert!("queue".parse::<DependencyKind>().is_err());
    }

    #[test]
    fn test_endpoint_via_proxy_keeps_upstream() {
        let endpoint = DependencyEndpoint {
            kind: DependencyKind::Cache,
            host: "127.0.0.1".into(),
            client_port: 36379,
            admin_port: None,
            credentials: Credentials::new(None, Some("pw")),
            upstream_alias: "cache".into(),
            upstream_port: 6379,
        };
        let proxied = endpoint.via("127.0.0.1", 49200);
        assert_eq!(proxied.host_port(), "127.0.0.1:49200");
        assert_eq!(proxied.upstream(), "cache:6379");
        assert_eq!(proxied.credentials, endpoint.credentials);
    }
}
