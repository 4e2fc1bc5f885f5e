//! Harness configuration management
//!
//! This module provides centralized configuration with:
//! - Optional TOML file loading (`REPORTER_HARNESS_CONFIG`)
//! - Environment variable overrides
//! - Validation before any container is started

use crate::containers::broker::AMQP_PORT;
use crate::containers::cache::CACHE_PORT;
use crate::containers::document_store::MONGO_PORT;
use crate::containers::object_store::S3_PORT;
use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the TOML config file
pub const CONFIG_PATH_ENV: &str = "REPORTER_HARNESS_CONFIG";

/// Prefix shared by every override variable
pub const ENV_PREFIX: &str = "REPORTER_HARNESS_";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub docker: DockerConfig,
    pub document_store: DocumentStoreConfig,
    pub broker: BrokerConfig,
    pub cache: CacheConfig,
    pub object_store: ObjectStoreConfig,
    pub proxy: ProxyConfig,
    pub services: ServicesConfig,
    pub chaos: ChaosConfig,
}

/// Docker daemon access and shared container settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub binary: PathBuf,
    /// Network names are `<prefix>-<session>`; one prefix per test binary
    pub network_prefix: String,
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Seconds `docker stop` waits before killing
    pub stop_grace_secs: u32,
    /// Leave containers running after the suite (debugging aid)
    pub keep_infra: bool,
}

/// Document store (MongoDB) adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentStoreConfig {
    pub image: String,
    pub alias: String,
    pub username: String,
    pub password: String,
    pub database: String,
    /// Fixed host port; survives restarts without re-reading
    pub host_port: Option<u16>,
}

/// Broker (RabbitMQ) adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub image: String,
    pub alias: String,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub amqp_host_port: Option<u16>,
    pub management_host_port: Option<u16>,
    pub topology: TopologyConfig,
    pub redeclare_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub redeclare_backoff: Duration,
}

/// Names used by the broker topology declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub exchange: String,
    pub dead_letter_exchange: String,
    pub queue: String,
    pub dead_letter_queue: String,
    pub routing_key: String,
    pub dead_letter_routing_key: String,
    pub dlq_message_ttl_ms: u64,
    pub dlq_max_length: u64,
}

/// Cache (Redis-compatible) adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub image: String,
    pub alias: String,
    pub password: String,
    pub database: u8,
    pub host_port: Option<u16>,
}

/// Object store (S3-compatible) adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    pub image: String,
    pub alias: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub bucket: String,
    pub host_port: Option<u16>,
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,
    pub bucket_attempts: u32,
}

/// Fault proxy sidecar settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub image: String,
    pub api_port: u16,
    /// Added to each upstream port to form the listen port inside the proxy
    pub listen_port_offset: u16,
}

/// How the service binaries are found, built and launched
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub api_binary: Option<PathBuf>,
    pub worker_binary: Option<PathBuf>,
    pub bin_dir: PathBuf,
    pub build: Option<BuildConfig>,
    #[serde(with = "humantime_serde")]
    pub health_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub health_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub health_request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    pub worker_count: u32,
    pub log_level: String,
    /// Bearer token passed through to the service and used by probes
    pub auth_token: Option<String>,
}

/// On-demand build of the service binaries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    pub program: String,
    /// Arguments; `{output}` and `{name}` are substituted per binary
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub api_name: String,
    pub worker_name: String,
}

/// Fault selection and chaos protocol deadlines
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosConfig {
    pub fault_strategy: FaultStrategy,
    #[serde(with = "humantime_serde")]
    pub readiness_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub convergence_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub phase_timeouts: PhaseTimeouts,
}

/// Deadline per chaos phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseTimeouts {
    #[serde(with = "humantime_serde")]
    pub normal: Duration,
    #[serde(with = "humantime_serde")]
    pub inject: Duration,
    #[serde(with = "humantime_serde")]
    pub verify_failure: Duration,
    #[serde(with = "humantime_serde")]
    pub restore: Duration,
    #[serde(with = "humantime_serde")]
    pub verify_recovery: Duration,
}

/// Which variant expresses a logical fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultStrategy {
    Container,
    Proxy,
}

impl std::str::FromStr for FaultStrategy {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "container" => Ok(FaultStrategy::Container),
            "proxy" => Ok(FaultStrategy::Proxy),
            other => Err(HarnessError::Config(format!("Unknown fault strategy: {}", other))),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            docker: DockerConfig::default(),
            document_store: DocumentStoreConfig::default(),
            broker: BrokerConfig::default(),
            cache: CacheConfig::default(),
            object_store: ObjectStoreConfig::default(),
            proxy: ProxyConfig::default(),
            services: ServicesConfig::default(),
            chaos: ChaosConfig::default(),
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("docker"),
            network_prefix: "reporter-harness".to_string(),
            startup_timeout: Duration::from_secs(120),
            command_timeout: Duration::from_secs(60),
            stop_grace_secs: 10,
            keep_infra: false,
        }
    }
}

impl Default for DocumentStoreConfig {
    fn default() -> Self {
        Self {
            image: "mongo:7.0".to_string(),
            alias: "document-store".to_string(),
            username: "reporter".to_string(),
            password: "reporter-secret".to_string(),
            database: "reporter".to_string(),
            host_port: Some(37017),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            image: "rabbitmq:3.13-management-alpine".to_string(),
            alias: "broker".to_string(),
            username: "reporter".to_string(),
            password: "reporter-secret".to_string(),
            vhost: "/".to_string(),
            amqp_host_port: Some(35672),
            management_host_port: Some(45672),
            topology: TopologyConfig::default(),
            redeclare_attempts: 10,
            redeclare_backoff: Duration::from_secs(2),
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            exchange: "reporter.generate-report.exchange".to_string(),
            dead_letter_exchange: "reporter.generate-report.dlx".to_string(),
            queue: "reporter.generate-report.queue".to_string(),
            dead_letter_queue: "reporter.generate-report.dlq".to_string(),
            routing_key: "reporter.generate-report.key".to_string(),
            dead_letter_routing_key: "reporter.generate-report.dlq.key".to_string(),
            // 7 days
            dlq_message_ttl_ms: 604_800_000,
            dlq_max_length: 10_000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            image: "valkey/valkey:8-alpine".to_string(),
            alias: "cache".to_string(),
            password: "reporter-secret".to_string(),
            database: 0,
            host_port: Some(36379),
        }
    }
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            image: "minio/minio:latest".to_string(),
            alias: "object-store".to_string(),
            access_key: "reporter-access".to_string(),
            secret_key: "reporter-secret-key".to_string(),
            region: "us-east-1".to_string(),
            bucket: "reporter-storage".to_string(),
            host_port: None,
            startup_timeout: Duration::from_secs(60),
            bucket_attempts: 10,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            image: "ghcr.io/shopify/toxiproxy:2.9.0".to_string(),
            api_port: 8474,
            listen_port_offset: 20_000,
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            api_binary: None,
            worker_binary: None,
            bin_dir: PathBuf::from(".bin"),
            build: None,
            health_timeout: Duration::from_secs(60),
            health_interval: Duration::from_millis(500),
            health_request_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(10),
            worker_count: 2,
            log_level: "error".to_string(),
            auth_token: None,
        }
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            fault_strategy: FaultStrategy::Container,
            readiness_timeout: Duration::from_secs(90),
            convergence_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            phase_timeouts: PhaseTimeouts::default(),
        }
    }
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            normal: Duration::from_secs(60),
            inject: Duration::from_secs(120),
            verify_failure: Duration::from_secs(120),
            restore: Duration::from_secs(180),
            verify_recovery: Duration::from_secs(120),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from file (if configured) and environment
    pub fn load() -> Result<Self> {
        let mut config = match env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::load_from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };

        config.override_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration scoped to one test binary.
    ///
    /// Several test binaries may share a Docker daemon; giving each its own
    /// network prefix keeps their resources apart.
    pub fn for_suite(suite: &str) -> Result<Self> {
        let mut config = Self::load()?;
        config.docker.network_prefix = format!("{}-{}", config.docker.network_prefix, suite);
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| HarnessError::Config(format!("Failed to read config file: {}", e)))?;

        let config: HarnessConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Override configuration with environment variables
    pub fn override_from_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    /// Apply overrides from an arbitrary lookup (keys are given without prefix)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("DOCKER_BIN") {
            self.docker.binary = PathBuf::from(val);
        }

        if let Some(val) = lookup("API_BIN") {
            self.services.api_binary = Some(PathBuf::from(val));
        }

        if let Some(val) = lookup("WORKER_BIN") {
            self.services.worker_binary = Some(PathBuf::from(val));
        }

        if let Some(val) = lookup("FAULT_STRATEGY") {
            self.chaos.fault_strategy = val.parse()?;
        }

        if let Some(val) = lookup("PROXY_ENABLED") {
            self.proxy.enabled = parse_bool(&val)
                .ok_or_else(|| HarnessError::Config("Invalid PROXY_ENABLED".to_string()))?;
        }

        if let Some(val) = lookup("KEEP_INFRA") {
            self.docker.keep_infra = parse_bool(&val)
                .ok_or_else(|| HarnessError::Config("Invalid KEEP_INFRA".to_string()))?;
        }

        if let Some(val) = lookup("STARTUP_TIMEOUT") {
            self.docker.startup_timeout = humantime_serde::re::humantime::parse_duration(&val)
                .map_err(|_| HarnessError::Config("Invalid STARTUP_TIMEOUT".to_string()))?;
        }

        if let Some(val) = lookup("CONVERGENCE_TIMEOUT") {
            self.chaos.convergence_timeout = humantime_serde::re::humantime::parse_duration(&val)
                .map_err(|_| HarnessError::Config("Invalid CONVERGENCE_TIMEOUT".to_string()))?;
        }

        if let Some(val) = lookup("AUTH_TOKEN") {
            self.services.auth_token = Some(val);
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let images = [
            ("document store", &self.document_store.image),
            ("broker", &self.broker.image),
            ("cache", &self.cache.image),
            ("object store", &self.object_store.image),
            ("proxy", &self.proxy.image),
        ];
        for (name, image) in images {
            if image.trim().is_empty() {
                return Err(HarnessError::Config(format!("{} image cannot be empty", name)));
            }
        }

        if self.document_store.username.is_empty() || self.document_store.password.is_empty() {
            return Err(HarnessError::Config(
                "Document store credentials cannot be empty".to_string(),
            ));
        }

        if self.cache.password.is_empty() {
            return Err(HarnessError::Config("Cache password is required".to_string()));
        }

        if self.object_store.bucket.is_empty() {
            return Err(HarnessError::Config("Object store bucket cannot be empty".to_string()));
        }

        if self.services.worker_count == 0 {
            return Err(HarnessError::Config("Worker count must be >= 1".to_string()));
        }

        if self.broker.redeclare_attempts == 0 || self.object_store.bucket_attempts == 0 {
            return Err(HarnessError::Config("Retry attempts must be >= 1".to_string()));
        }

        let timeouts = [
            self.docker.startup_timeout,
            self.object_store.startup_timeout,
            self.services.health_timeout,
            self.chaos.readiness_timeout,
            self.chaos.convergence_timeout,
            self.chaos.poll_interval,
        ];
        if timeouts.iter().any(|t| t.is_zero()) {
            return Err(HarnessError::Config("Timeouts must be non-zero".to_string()));
        }

        for port in [MONGO_PORT, AMQP_PORT, CACHE_PORT, S3_PORT] {
            if port.checked_add(self.proxy.listen_port_offset).is_none() {
                return Err(HarnessError::Config(format!(
                    "Proxy listen offset {} overflows upstream port {}",
                    self.proxy.listen_port_offset, port
                )));
            }
        }

        let mut seen = HashSet::new();
        for port in self.fixed_host_ports() {
            if !seen.insert(port) {
                return Err(HarnessError::Config(format!(
                    "Fixed host port {} is assigned twice",
                    port
                )));
            }
        }

        Ok(())
    }

    /// Every fixed host port claimed by a dependency
    pub fn fixed_host_ports(&self) -> Vec<u16> {
        [
            self.document_store.host_port,
            self.broker.amqp_host_port,
            self.broker.management_host_port,
            self.cache.host_port,
            self.object_store.host_port,
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| HarnessError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, contents)
            .map_err(|e| HarnessError::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
