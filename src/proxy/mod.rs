//! Fault proxy sidecar
//!
//! A TCP proxy container on the private network with one binding per
//! dependency. Each binding listens on `<offset + port>` inside the proxy and
//! forwards to `<alias>:<port>`; the host reaches it through the proxy
//! container's published ports. Toxics perturb a binding until removed.

pub mod client;

pub use client::ToxiproxyClient;

use crate::cancel::{run_cancellable, CancellationToken};
use crate::config::ProxyConfig;
use crate::containers::{AdapterContext, DependencyEndpoint, DependencyKind, ManagedContainer, WaitStrategy};
use crate::docker::PortBinding;
use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Container alias of the proxy on the private network
pub const PROXY_ALIAS: &str = "fault-proxy";

/// Which half of the connection a toxic applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamDirection {
    /// Client towards upstream
    Upstream,
    /// Upstream towards client
    Downstream,
}

impl StreamDirection {
    fn as_str(&self) -> &'static str {
        match self {
            StreamDirection::Upstream => "upstream",
            StreamDirection::Downstream => "downstream",
        }
    }
}

/// A packet-level perturbation on one binding
#[derive(Debug, Clone, PartialEq)]
pub enum Toxic {
    /// Delay of `latency_ms` plus uniform jitter in `[0, jitter_ms]`
    Latency { latency_ms: u64, jitter_ms: u64 },
    /// Rate set to zero; every byte in `direction` stalls
    BandwidthZero { direction: StreamDirection },
    /// A fraction `probability` of connections go silent and close after `timeout_ms`
    Timeout { probability: f32, timeout_ms: u64 },
}

/// Wire representation of a toxic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToxicRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub stream: StreamDirection,
    pub toxicity: f32,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl Toxic {
    /// Stable name; adding the same toxic twice is rejected by the proxy
    pub fn name(&self) -> String {
        match self {
            Toxic::Latency { .. } => "latency_downstream".to_string(),
            Toxic::BandwidthZero { direction } => format!("bandwidth_zero_{}", direction.as_str()),
            Toxic::Timeout { .. } => "timeout_downstream".to_string(),
        }
    }

    pub fn to_record(&self) -> ToxicRecord {
        let (kind, stream, toxicity, attributes) = match self {
            Toxic::Latency {
                latency_ms,
                jitter_ms,
            } => (
                "latency",
                StreamDirection::Downstream,
                1.0,
                vec![("latency", json!(latency_ms)), ("jitter", json!(jitter_ms))],
            ),
            Toxic::BandwidthZero { direction } => {
                ("bandwidth", *direction, 1.0, vec![("rate", json!(0))])
            }
            Toxic::Timeout {
                probability,
                timeout_ms,
            } => (
                "timeout",
                StreamDirection::Downstream,
                probability.clamp(0.0, 1.0),
                vec![("timeout", json!(timeout_ms))],
            ),
        };

        ToxicRecord {
            name: self.name(),
            kind: kind.to_string(),
            stream,
            toxicity,
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    pub fn from_record(record: &ToxicRecord) -> Result<Self> {
        let attr = |key: &str| record.attributes.get(key).and_then(Value::as_u64);
        match record.kind.as_str() {
            "latency" => Ok(Toxic::Latency {
                latency_ms: attr("latency").unwrap_or(0),
                jitter_ms: attr("jitter").unwrap_or(0),
            }),
            "bandwidth" if attr("rate") == Some(0) => Ok(Toxic::BandwidthZero {
                direction: record.stream,
            }),
            "timeout" => Ok(Toxic::Timeout {
                probability: record.toxicity,
                timeout_ms: attr("timeout").unwrap_or(0),
            }),
            other => Err(HarnessError::ProtocolViolation(format!(
                "Unrecognized toxic {} of type {}",
                record.name, other
            ))),
        }
    }
}

/// A named listen/upstream pair inside the proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyBinding {
    pub name: String,
    pub listen: String,
    pub upstream: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub toxics: Vec<ToxicRecord>,
}

fn default_enabled() -> bool {
    true
}

impl ProxyBinding {
    /// Binding that forwards `<offset + port>` to the endpoint's alias
    pub fn for_endpoint(endpoint: &DependencyEndpoint, listen_offset: u16) -> Result<Self> {
        let port = listen_port(endpoint.upstream_port, listen_offset).ok_or_else(|| {
            HarnessError::Config(format!(
                "Proxy offset {} pushes {} port {} past 65535",
                listen_offset, endpoint.kind, endpoint.upstream_port
            ))
        })?;
        Ok(Self {
            name: endpoint.kind.as_str().to_string(),
            listen: format!("0.0.0.0:{}", port),
            upstream: endpoint.upstream(),
            enabled: true,
            toxics: Vec::new(),
        })
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.listen.rsplit_once(':').and_then(|(_, p)| p.parse().ok())
    }
}

/// Container-local listen port for an upstream port, `None` on overflow
pub fn listen_port(upstream_port: u16, offset: u16) -> Option<u16> {
    upstream_port.checked_add(offset)
}

/// The proxy container plus its bindings
pub struct FaultProxy {
    container: ManagedContainer,
    config: ProxyConfig,
    bindings: BTreeMap<DependencyKind, ProxyBinding>,
    upstreams: BTreeMap<DependencyKind, DependencyEndpoint>,
}

impl FaultProxy {
    pub fn new(ctx: &AdapterContext, config: &ProxyConfig, upstreams: &[DependencyEndpoint]) -> Result<Self> {
        let bindings = upstreams
            .iter()
            .map(|e| Ok((e.kind, ProxyBinding::for_endpoint(e, config.listen_port_offset)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        let mut spec = ctx
            .spec(PROXY_ALIAS, &config.image)
            .port(PortBinding::ephemeral(config.api_port));
        for binding in bindings.values() {
            if let Some(port) = binding.listen_port() {
                spec = spec.port(PortBinding::ephemeral(port));
            }
        }

        let container = ManagedContainer::new(
            ctx.docker.clone(),
            spec,
            WaitStrategy::Http {
                container_port: config.api_port,
                path: "/version".to_string(),
                status: 200,
            },
            ctx.startup_timeout,
            ctx.stop_grace_secs,
        );

        Ok(Self {
            container,
            config: config.clone(),
            bindings,
            upstreams: upstreams.iter().map(|e| (e.kind, e.clone())).collect(),
        })
    }

    pub fn container(&self) -> &ManagedContainer {
        &self.container
    }

    /// Start the container and create one binding per upstream
    pub async fn launch(&self, cancel: &CancellationToken) -> Result<()> {
        self.container.launch(cancel).await?;
        let client = self.client()?;
        for binding in self.bindings.values() {
            run_cancellable(cancel, client.create_proxy(binding)).await?;
            tracing::info!(binding = %binding.name, listen = %binding.listen, upstream = %binding.upstream, "proxy binding created");
        }
        Ok(())
    }

    pub async fn terminate(&self, cancel: &CancellationToken) -> Result<()> {
        self.container.terminate(cancel).await
    }

    pub fn client(&self) -> Result<ToxiproxyClient> {
        let port = self.container.host_port(self.config.api_port)?;
        ToxiproxyClient::new(&format!("127.0.0.1:{}", port))
    }

    pub fn binding(&self, kind: DependencyKind) -> Result<&ProxyBinding> {
        self.bindings.get(&kind).ok_or_else(|| {
            HarnessError::PreconditionUnmet(format!("No proxy binding for {}", kind))
        })
    }

    /// Host port that reaches `kind` through the proxy
    pub fn host_port(&self, kind: DependencyKind) -> Result<u16> {
        let binding = self.binding(kind)?;
        let listen = binding.listen_port().ok_or_else(|| {
            HarnessError::ProtocolViolation(format!("Malformed listen address {}", binding.listen))
        })?;
        self.container.host_port(listen)
    }

    /// Endpoint for `kind` that routes through the proxy
    pub fn host_endpoint(&self, kind: DependencyKind) -> Result<DependencyEndpoint> {
        let upstream = self.upstreams.get(&kind).ok_or_else(|| {
            HarnessError::PreconditionUnmet(format!("No upstream recorded for {}", kind))
        })?;
        Ok(upstream.via("127.0.0.1", self.host_port(kind)?))
    }

    /// Binding name to host port
    pub fn endpoints(&self) -> Result<BTreeMap<String, u16>> {
        self.bindings
            .iter()
            .map(|(kind, binding)| Ok((binding.name.clone(), self.host_port(*kind)?)))
            .collect()
    }

    async fn add(&self, kind: DependencyKind, toxic: Toxic, cancel: &CancellationToken) -> Result<()> {
        let binding = self.binding(kind)?;
        let client = self.client()?;
        run_cancellable(cancel, client.add_toxic(&binding.name, &toxic)).await
    }

    pub async fn inject_latency(
        &self,
        kind: DependencyKind,
        latency_ms: u64,
        jitter_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tracing::info!(binding = %kind, latency_ms, jitter_ms, "injecting latency");
        self.add(
            kind,
            Toxic::Latency {
                latency_ms,
                jitter_ms,
            },
            cancel,
        )
        .await
    }

    /// Zero bandwidth in both directions
    pub async fn inject_connection_loss(&self, kind: DependencyKind, cancel: &CancellationToken) -> Result<()> {
        tracing::info!(binding = %kind, "injecting connection loss");
        for direction in [StreamDirection::Upstream, StreamDirection::Downstream] {
            self.add(kind, Toxic::BandwidthZero { direction }, cancel).await?;
        }
        Ok(())
    }

    /// A `percent` share of connections stall and close after `timeout_ms`
    pub async fn inject_packet_loss(
        &self,
        kind: DependencyKind,
        percent: f32,
        timeout_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !(0.0..=100.0).contains(&percent) {
            return Err(HarnessError::Config(format!("Packet loss {}% out of range", percent)));
        }
        tracing::info!(binding = %kind, percent, "injecting packet loss");
        self.add(
            kind,
            Toxic::Timeout {
                probability: percent / 100.0,
                timeout_ms,
            },
            cancel,
        )
        .await
    }

    /// Back to transparent forwarding
    pub async fn remove_all_toxics(&self, kind: DependencyKind, cancel: &CancellationToken) -> Result<()> {
        let binding = self.binding(kind)?;
        let client = self.client()?;
        let removed = run_cancellable(cancel, client.remove_all_toxics(&binding.name)).await?;
        tracing::info!(binding = %kind, removed, "toxics removed");
        Ok(())
    }

    pub async fn toxics(&self, kind: DependencyKind, cancel: &CancellationToken) -> Result<Vec<Toxic>> {
        let binding = self.binding(kind)?;
        let client = self.client()?;
        let records = run_cancellable(cancel, client.list_toxics(&binding.name)).await?;
        records.iter().map(Toxic::from_record).collect()
    }

    /// Refuse new connections on the binding and drop existing ones
    pub async fn disable(&self, kind: DependencyKind, cancel: &CancellationToken) -> Result<()> {
        let binding = self.binding(kind)?;
        let client = self.client()?;
        run_cancellable(cancel, client.set_enabled(&binding.name, false)).await
    }

    pub async fn enable(&self, kind: DependencyKind, cancel: &CancellationToken) -> Result<()> {
        let binding = self.binding(kind)?;
        let client = self.client()?;
        run_cancellable(cancel, client.set_enabled(&binding.name, true)).await
    }
}
