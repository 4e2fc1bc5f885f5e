//! Broker (RabbitMQ) adapter

use super::topology::{ManagementClient, TopologyDeclaration, TopologySnapshot};
use super::{AdapterContext, Credentials, DependencyAdapter, DependencyEndpoint, DependencyKind};
use super::{ManagedContainer, WaitStrategy};
use crate::cancel::{run_cancellable, CancellationToken};
use crate::config::BrokerConfig;
use crate::docker::PortBinding;
use crate::error::Result;
use async_trait::async_trait;

pub const AMQP_PORT: u16 = 5672;
pub const MANAGEMENT_PORT: u16 = 15672;

pub struct BrokerAdapter {
    config: BrokerConfig,
    declaration: TopologyDeclaration,
    container: ManagedContainer,
}

impl BrokerAdapter {
    pub fn new(ctx: &AdapterContext, config: &BrokerConfig) -> Self {
        let amqp = match config.amqp_host_port {
            Some(port) => PortBinding::fixed(AMQP_PORT, port),
            None => PortBinding::ephemeral(AMQP_PORT),
        };
        let management = match config.management_host_port {
            Some(port) => PortBinding::fixed(MANAGEMENT_PORT, port),
            None => PortBinding::ephemeral(MANAGEMENT_PORT),
        };
        let spec = ctx
            .spec(&config.alias, &config.image)
            .env("RABBITMQ_DEFAULT_USER", &config.username)
            .env("RABBITMQ_DEFAULT_PASS", &config.password)
            .env("RABBITMQ_DEFAULT_VHOST", &config.vhost)
            .port(amqp)
            .port(management);

        let container = ManagedContainer::new(
            ctx.docker.clone(),
            spec,
            WaitStrategy::log("Server startup complete", 1),
            ctx.startup_timeout,
            ctx.stop_grace_secs,
        );

        Self {
            declaration: TopologyDeclaration::from_config(&config.topology),
            config: config.clone(),
            container,
        }
    }

    pub fn declaration(&self) -> &TopologyDeclaration {
        &self.declaration
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Management client bound to the current host port
    pub fn management(&self) -> Result<ManagementClient> {
        let port = self.container.host_port(MANAGEMENT_PORT)?;
        ManagementClient::new(
            &format!("127.0.0.1:{}", port),
            &self.config.vhost,
            &self.config.username,
            &self.config.password,
        )
    }

    pub fn management_url(&self) -> Result<String> {
        Ok(format!(
            "http://127.0.0.1:{}",
            self.container.host_port(MANAGEMENT_PORT)?
        ))
    }

    /// Declare the topology, retrying while the broker warms up
    pub async fn declare_topology(&self, cancel: &CancellationToken) -> Result<()> {
        self.management()?
            .declare_with_retry(
                &self.declaration,
                self.config.redeclare_attempts,
                self.config.redeclare_backoff,
                cancel,
            )
            .await
    }

    /// Drain the primary queue and the DLQ
    pub async fn purge_queues(&self, cancel: &CancellationToken) -> Result<()> {
        let management = self.management()?;
        let topology = &self.config.topology;
        run_cancellable(cancel, async {
            management.purge_queue(&topology.queue).await?;
            management.purge_queue(&topology.dead_letter_queue).await
        })
        .await?;
        tracing::info!("broker queues purged");
        Ok(())
    }

    /// Observed exchanges, queues and bindings named by the declaration
    pub async fn inspect_topology(&self, cancel: &CancellationToken) -> Result<TopologySnapshot> {
        let management = self.management()?;
        run_cancellable(cancel, management.inspect(&self.declaration)).await
    }

    /// Ready messages waiting on the primary queue
    pub async fn pending_messages(&self, cancel: &CancellationToken) -> Result<u64> {
        let management = self.management()?;
        run_cancellable(cancel, management.queue_depth(&self.config.topology.queue)).await
    }
}

#[async_trait]
impl DependencyAdapter for BrokerAdapter {
    fn kind(&self) -> DependencyKind {
        DependencyKind::Broker
    }

    fn container(&self) -> &ManagedContainer {
        &self.container
    }

    fn client_port(&self) -> u16 {
        AMQP_PORT
    }

    fn endpoint(&self) -> Result<DependencyEndpoint> {
        Ok(DependencyEndpoint {
            kind: self.kind(),
            host: "127.0.0.1".to_string(),
            client_port: self.container.host_port(AMQP_PORT)?,
            admin_port: Some(self.container.host_port(MANAGEMENT_PORT)?),
            credentials: Credentials::new(Some(&self.config.username), Some(&self.config.password)),
            upstream_alias: self.config.alias.clone(),
            upstream_port: AMQP_PORT,
        })
    }

    async fn provision(&self, cancel: &CancellationToken) -> Result<()> {
        self.declare_topology(cancel).await
    }

    async fn after_restart(&self, cancel: &CancellationToken) -> Result<()> {
        tracing::info!("re-declaring broker topology after restart");
        self.declare_topology(cancel).await
    }
}
