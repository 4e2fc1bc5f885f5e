//! Broker topology over the management HTTP API
//!
//! Declarations are idempotent PUT/POST calls, so re-declaring after a
//! restart converges to the same exchanges, queues and bindings.

use crate::cancel::{run_cancellable, sleep_cancellable, CancellationToken};
use crate::config::TopologyConfig;
use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Exchange as declared or observed
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExchangeState {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub durable: bool,
}

/// Queue as declared or observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    pub name: String,
    pub durable: bool,
    #[serde(default)]
    pub arguments: BTreeMap<String, Value>,
}

/// Exchange-to-queue binding
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BindingState {
    pub source: String,
    pub destination: String,
    pub routing_key: String,
}

/// Observable broker topology, normalized for comparison
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub exchanges: Vec<ExchangeState>,
    pub queues: Vec<QueueState>,
    pub bindings: Vec<BindingState>,
}

impl TopologySnapshot {
    fn normalize(mut self) -> Self {
        self.exchanges.sort();
        self.queues.sort_by(|a, b| a.name.cmp(&b.name));
        self.bindings.sort();
        self.bindings.dedup();
        self
    }
}

/// Exchanges, queues and bindings the report service expects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyDeclaration {
    pub exchanges: Vec<ExchangeState>,
    pub queues: Vec<QueueState>,
    pub bindings: Vec<BindingState>,
}

impl TopologyDeclaration {
    /// Primary exchange and queue, dead-letter exchange and bounded DLQ
    pub fn from_config(config: &TopologyConfig) -> Self {
        let exchanges = vec![
            ExchangeState {
                name: config.exchange.clone(),
                kind: "direct".to_string(),
                durable: true,
            },
            ExchangeState {
                name: config.dead_letter_exchange.clone(),
                kind: "direct".to_string(),
                durable: true,
            },
        ];

        let mut primary_args = BTreeMap::new();
        primary_args.insert(
            "x-dead-letter-exchange".to_string(),
            json!(config.dead_letter_exchange),
        );
        primary_args.insert(
            "x-dead-letter-routing-key".to_string(),
            json!(config.dead_letter_routing_key),
        );

        let mut dlq_args = BTreeMap::new();
        dlq_args.insert("x-message-ttl".to_string(), json!(config.dlq_message_ttl_ms));
        dlq_args.insert("x-max-length".to_string(), json!(config.dlq_max_length));

        let queues = vec![
            QueueState {
                name: config.queue.clone(),
                durable: true,
                arguments: primary_args,
            },
            QueueState {
                name: config.dead_letter_queue.clone(),
                durable: true,
                arguments: dlq_args,
            },
        ];

        let bindings = vec![
            BindingState {
                source: config.exchange.clone(),
                destination: config.queue.clone(),
                routing_key: config.routing_key.clone(),
            },
            BindingState {
                source: config.dead_letter_exchange.clone(),
                destination: config.dead_letter_queue.clone(),
                routing_key: config.dead_letter_routing_key.clone(),
            },
        ];

        Self {
            exchanges,
            queues,
            bindings,
        }
    }

    /// What a freshly declared broker should report
    pub fn expected_snapshot(&self) -> TopologySnapshot {
        TopologySnapshot {
            exchanges: self.exchanges.clone(),
            queues: self.queues.clone(),
            bindings: self.bindings.clone(),
        }
        .normalize()
    }
}

/// Client for the broker's management API
#[derive(Debug, Clone)]
pub struct ManagementClient {
    base_url: String,
    vhost: String,
    username: String,
    password: String,
    client: reqwest::Client,
}

impl ManagementClient {
    pub fn new(address: &str, vhost: &str, username: &str, password: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            base_url: format!("http://{}/api", address),
            vhost: encode_segment(vhost),
            username: username.to_string(),
            password: password.to_string(),
            client,
        })
    }

    fn url(&self, parts: &[&str]) -> String {
        let encoded: Vec<String> = parts.iter().map(|p| encode_segment(p)).collect();
        format!("{}/{}", self.base_url, encoded.join("/"))
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = request
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(HarnessError::InfrastructureUnavailable(format!(
                "Broker management {} failed ({}): {}",
                what, status, body
            )));
        }
        Ok(response)
    }

    pub async fn declare_exchange(&self, exchange: &ExchangeState) -> Result<()> {
        let url = format!("{}/exchanges/{}/{}", self.base_url, self.vhost, encode_segment(&exchange.name));
        let body = json!({
            "type": exchange.kind,
            "durable": exchange.durable,
            "auto_delete": false,
            "internal": false,
            "arguments": {},
        });
        self.send(self.client.put(&url).json(&body), "declare exchange")
            .await?;
        Ok(())
    }

    pub async fn declare_queue(&self, queue: &QueueState) -> Result<()> {
        let url = format!("{}/queues/{}/{}", self.base_url, self.vhost, encode_segment(&queue.name));
        let body = json!({
            "durable": queue.durable,
            "auto_delete": false,
            "arguments": queue.arguments,
        });
        self.send(self.client.put(&url).json(&body), "declare queue")
            .await?;
        Ok(())
    }

    pub async fn bind(&self, binding: &BindingState) -> Result<()> {
        let url = format!(
            "{}/bindings/{}/e/{}/q/{}",
            self.base_url,
            self.vhost,
            encode_segment(&binding.source),
            encode_segment(&binding.destination)
        );
        let body = json!({ "routing_key": binding.routing_key, "arguments": {} });
        self.send(self.client.post(&url).json(&body), "bind").await?;
        Ok(())
    }

    /// Declare everything once
    pub async fn declare(&self, declaration: &TopologyDeclaration) -> Result<()> {
        for exchange in &declaration.exchanges {
            self.declare_exchange(exchange).await?;
        }
        for queue in &declaration.queues {
            self.declare_queue(queue).await?;
        }
        for binding in &declaration.bindings {
            self.bind(binding).await?;
        }
        Ok(())
    }

    /// Declare with a fixed backoff; the broker takes TCP connections
    /// before its management plugin is serving.
    pub async fn declare_with_retry(
        &self,
        declaration: &TopologyDeclaration,
        attempts: u32,
        backoff: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=attempts {
            match run_cancellable(cancel, self.declare(declaration)).await {
                Ok(()) => {
                    tracing::debug!(attempt, "broker topology declared");
                    return Ok(());
                }
                Err(HarnessError::Cancelled) => return Err(HarnessError::Cancelled),
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "topology declaration failed");
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                sleep_cancellable(cancel, backoff).await?;
            }
        }
        Err(HarnessError::InfrastructureUnavailable(format!(
            "Topology not declared after {} attempts: {}",
            attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Drop every ready message from `queue`
    pub async fn purge_queue(&self, queue: &str) -> Result<()> {
        let url = format!("{}/queues/{}/{}/contents", self.base_url, self.vhost, encode_segment(queue));
        self.send(self.client.delete(&url), "purge").await?;
        Ok(())
    }

    /// Messages currently in `queue`
    pub async fn queue_depth(&self, queue: &str) -> Result<u64> {
        let url = format!("{}/queues/{}/{}", self.base_url, self.vhost, encode_segment(queue));
        let response = self.send(self.client.get(&url), "inspect queue").await?;
        let value: Value = response.json().await?;
        Ok(value.get("messages").and_then(Value::as_u64).unwrap_or(0))
    }

    /// Read back the parts of the topology named by `declaration`
    pub async fn inspect(&self, declaration: &TopologyDeclaration) -> Result<TopologySnapshot> {
        let mut snapshot = TopologySnapshot::default();

        for exchange in &declaration.exchanges {
            let url = format!("{}/exchanges/{}/{}", self.base_url, self.vhost, encode_segment(&exchange.name));
            let response = self.send(self.client.get(&url), "inspect exchange").await?;
            snapshot.exchanges.push(response.json().await?);
        }

        for queue in &declaration.queues {
            let url = format!("{}/queues/{}/{}", self.base_url, self.vhost, encode_segment(&queue.name));
            let response = self.send(self.client.get(&url), "inspect queue").await?;
            snapshot.queues.push(response.json().await?);
        }

        for binding in &declaration.bindings {
            let url = format!(
                "{}/bindings/{}/e/{}/q/{}",
                self.base_url,
                self.vhost,
                encode_segment(&binding.source),
                encode_segment(&binding.destination)
            );
            let response = self.send(self.client.get(&url), "inspect bindings").await?;
            let observed: Vec<BindingState> = response.json().await?;
            snapshot.bindings.extend(observed);
        }

        Ok(snapshot.normalize())
    }
}

fn encode_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}
