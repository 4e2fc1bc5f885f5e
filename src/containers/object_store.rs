//! Object store (S3-compatible) adapter

use super::s3::{BucketOutcome, S3Client, SigningCredentials};
use super::{AdapterContext, Credentials, DependencyAdapter, DependencyEndpoint, DependencyKind};
use super::{ManagedContainer, WaitStrategy};
use crate::cancel::{run_cancellable, sleep_cancellable, CancellationToken};
use crate::config::ObjectStoreConfig;
use crate::docker::PortBinding;
use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use std::time::Duration;

pub const S3_PORT: u16 = 9000;

pub struct ObjectStoreAdapter {
    config: ObjectStoreConfig,
    container: ManagedContainer,
}

impl ObjectStoreAdapter {
    pub fn new(ctx: &AdapterContext, config: &ObjectStoreConfig) -> Self {
        let binding = match config.host_port {
            Some(port) => PortBinding::fixed(S3_PORT, port),
            None => PortBinding::ephemeral(S3_PORT),
        };
        let spec = ctx
            .spec(&config.alias, &config.image)
            .env("MINIO_ROOT_USER", &config.access_key)
            .env("MINIO_ROOT_PASSWORD", &config.secret_key)
            .env("MINIO_REGION", &config.region)
            .port(binding)
            .command(["server", "/data"]);

        let container = ManagedContainer::new(
            ctx.docker.clone(),
            spec,
            WaitStrategy::Tcp {
                container_port: S3_PORT,
            },
            config.startup_timeout,
            ctx.stop_grace_secs,
        );

        Self {
            config: config.clone(),
            container,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    pub fn region(&self) -> &str {
        &self.config.region
    }

    /// `http://127.0.0.1:<port>`
    pub fn endpoint_url(&self) -> Result<String> {
        Ok(format!("http://{}", self.endpoint()?.host_port()))
    }

    pub fn client(&self) -> Result<S3Client> {
        S3Client::new(
            &self.endpoint()?.host_port(),
            SigningCredentials {
                access_key: self.config.access_key.clone(),
                secret_key: self.config.secret_key.clone(),
                region: self.config.region.clone(),
            },
        )
    }

    /// Create the default bucket; TCP comes up before the S3 API is serving
    pub async fn ensure_bucket(&self, cancel: &CancellationToken) -> Result<BucketOutcome> {
        let client = self.client()?;
        let attempts = self.config.bucket_attempts;
        let mut last_error = None;

        for attempt in 0..attempts {
            match run_cancellable(cancel, client.create_bucket(&self.config.bucket)).await {
                Ok(outcome) => {
                    tracing::info!(bucket = %self.config.bucket, ?outcome, "bucket ready");
                    return Ok(outcome);
                }
                Err(HarnessError::Cancelled) => return Err(HarnessError::Cancelled),
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "bucket creation failed");
                    last_error = Some(e);
                }
            }
            sleep_cancellable(cancel, bucket_backoff(attempt)).await?;
        }

        Err(HarnessError::InfrastructureUnavailable(format!(
            "Bucket {} not created after {} attempts: {}",
            self.config.bucket,
            attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

/// Linear backoff `(attempt + 1) * 500ms`
pub fn bucket_backoff(attempt: u32) -> Duration {
    Duration::from_millis(500 * (u64::from(attempt) + 1))
}

#[async_trait]
impl DependencyAdapter for ObjectStoreAdapter {
    fn kind(&self) -> DependencyKind {
        DependencyKind::ObjectStore
    }

    fn container(&self) -> &ManagedContainer {
        &self.container
    }

    fn client_port(&self) -> u16 {
        S3_PORT
    }

    fn endpoint(&self) -> Result<DependencyEndpoint> {
        Ok(DependencyEndpoint {
            kind: self.kind(),
            host: "127.0.0.1".to_string(),
            client_port: self.container.host_port(S3_PORT)?,
            admin_port: None,
            credentials: Credentials::new(Some(&self.config.access_key), Some(&self.config.secret_key)),
            upstream_alias: self.config.alias.clone(),
            upstream_port: S3_PORT,
        })
    }

    async fn provision(&self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_bucket(cancel).await.map(|_| ())
    }
}
