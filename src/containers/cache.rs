//! Cache (Redis-compatible) adapter

use super::{AdapterContext, Credentials, DependencyAdapter, DependencyEndpoint, DependencyKind};
use super::{ManagedContainer, WaitStrategy};
use crate::config::CacheConfig;
use crate::docker::PortBinding;
use crate::error::Result;
use async_trait::async_trait;

pub const CACHE_PORT: u16 = 6379;

pub struct CacheAdapter {
    config: CacheConfig,
    container: ManagedContainer,
}

impl CacheAdapter {
    pub fn new(ctx: &AdapterContext, config: &CacheConfig) -> Self {
        let binding = match config.host_port {
            Some(port) => PortBinding::fixed(CACHE_PORT, port),
            None => PortBinding::ephemeral(CACHE_PORT),
        };
        let spec = ctx
            .spec(&config.alias, &config.image)
            .port(binding)
            .command([server_binary(&config.image), "--requirepass", config.password.as_str()]);

        let container = ManagedContainer::new(
            ctx.docker.clone(),
            spec,
            WaitStrategy::log("Ready to accept connections", 1),
            ctx.startup_timeout,
            ctx.stop_grace_secs,
        );

        Self {
            config: config.clone(),
            container,
        }
    }

    /// `redis://:password@host:port/db`
    pub fn url(&self) -> Result<String> {
        let endpoint = self.endpoint()?;
        Ok(cache_url(&endpoint, self.config.database))
    }

    pub fn database(&self) -> u8 {
        self.config.database
    }
}

/// Build the cache URL for an endpoint, which may be a proxy listener
pub fn cache_url(endpoint: &DependencyEndpoint, database: u8) -> String {
    format!(
        "redis://:{}@{}/{}",
        endpoint.credentials.password.as_deref().unwrap_or_default(),
        endpoint.host_port(),
        database
    )
}

fn server_binary(image: &str) -> &'static str {
    if image.contains("valkey") {
        "valkey-server"
    } else {
        "redis-server"
    }
}

#[async_trait]
impl DependencyAdapter for CacheAdapter {
    fn kind(&self) -> DependencyKind {
        DependencyKind::Cache
    }

    fn container(&self) -> &ManagedContainer {
        &self.container
    }

    fn client_port(&self) -> u16 {
        CACHE_PORT
    }

    fn endpoint(&self) -> Result<DependencyEndpoint> {
        Ok(DependencyEndpoint {
            kind: self.kind(),
            host: "127.0.0.1".to_string(),
            client_port: self.container.host_port(CACHE_PORT)?,
            admin_port: None,
            credentials: Credentials::new(None, Some(&self.config.password)),
            upstream_alias: self.config.alias.clone(),
            upstream_port: CACHE_PORT,
        })
    }
}
