//! Environment handed to the service processes

use crate::config::ServicesConfig;
use crate::containers::cache::cache_url;
use crate::containers::DependencyKind;
use crate::error::Result;
use crate::orchestrator::Endpoints;
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Build the env map for both service binaries from `endpoints`, which may
/// point at the dependencies directly or at proxy listeners.
pub fn service_env(
    endpoints: &Endpoints,
    services: &ServicesConfig,
    address: SocketAddr,
) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    let mut set = |key: &str, value: String| {
        env.insert(key.to_string(), value);
    };

    set("SERVER_ADDRESS", address.to_string());

    let mongo = endpoints.get(DependencyKind::DocumentStore)?;
    set("MONGO_HOST", mongo.host.clone());
    set("MONGO_PORT", mongo.client_port.to_string());
    set("MONGO_USER", mongo.credentials.username.clone().unwrap_or_default());
    set("MONGO_PASSWORD", mongo.credentials.password.clone().unwrap_or_default());
    set("MONGO_NAME", endpoints.document_database.clone());

    let broker = endpoints.get(DependencyKind::Broker)?;
    let management_port = broker.admin_port.unwrap_or_default();
    set("RABBITMQ_HOST", broker.host.clone());
    set("RABBITMQ_PORT_AMQP", broker.client_port.to_string());
    set("RABBITMQ_PORT_HOST", management_port.to_string());
    set("RABBITMQ_DEFAULT_USER", broker.credentials.username.clone().unwrap_or_default());
    set("RABBITMQ_DEFAULT_PASS", broker.credentials.password.clone().unwrap_or_default());
    set("RABBITMQ_VHOST", endpoints.broker_vhost.clone());
    set("RABBITMQ_GENERATE_REPORT_QUEUE", endpoints.topology.queue.clone());
    set("RABBITMQ_EXCHANGE", endpoints.topology.exchange.clone());
    set("RABBITMQ_GENERATE_REPORT_KEY", endpoints.topology.routing_key.clone());
    set(
        "RABBITMQ_URL",
        format!("http://{}:{}", broker.host, management_port),
    );

    let storage = endpoints.get(DependencyKind::ObjectStore)?;
    set("OBJECT_STORAGE_ENDPOINT", format!("http://{}", storage.host_port()));
    set("OBJECT_STORAGE_REGION", endpoints.region.clone());
    set("OBJECT_STORAGE_ACCESS_KEY_ID", storage.credentials.username.clone().unwrap_or_default());
    set("OBJECT_STORAGE_SECRET_KEY", storage.credentials.password.clone().unwrap_or_default());
    set("OBJECT_STORAGE_BUCKET", endpoints.bucket.clone());
    set("OBJECT_STORAGE_USE_PATH_STYLE", "true".to_string());
    set("OBJECT_STORAGE_DISABLE_SSL", "true".to_string());

    let cache = endpoints.get(DependencyKind::Cache)?;
    set("REDIS_HOST", cache.host_port());
    set("REDIS_PASSWORD", cache.credentials.password.clone().unwrap_or_default());
    set("REDIS_DB", endpoints.cache_database.to_string());
    set("REDIS_URL", cache_url(cache, endpoints.cache_database));

    set("PLUGIN_AUTH_ENABLED", "false".to_string());
    set("ENABLE_TELEMETRY", "false".to_string());
    set("WORKER_COUNT", services.worker_count.to_string());
    set("LOG_LEVEL", services.log_level.clone());

    Ok(env)
}
