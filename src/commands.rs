//! Command implementations for the operator CLI

use reporter_harness::docker::DockerCli;
use reporter_harness::orchestrator::sweep_session_resources;
use reporter_harness::supervisor::service_env;
use reporter_harness::{CancellationToken, Endpoints, HarnessConfig, HarnessError, Infrastructure, Result};
use std::collections::BTreeMap;
use std::net::SocketAddr;

fn print_env(env: &BTreeMap<String, String>) {
    for (key, value) in env {
        println!("{}={}", key, value);
    }
}

fn print_services_env(endpoints: &Endpoints, config: &HarnessConfig, address: SocketAddr) -> Result<()> {
    print_env(&service_env(endpoints, &config.services, address)?);
    Ok(())
}

/// Cancel `token` on the first Ctrl-C
pub fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            token.cancel();
        }
    });
}

pub async fn up_command(config: HarnessConfig, with_proxy: bool, address: SocketAddr) -> Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let infra = Infrastructure::start(config, &cancel).await?;
    let result = async {
        let endpoints = if with_proxy {
            infra.start_proxy(&cancel).await?;
            for (binding, port) in infra.proxy_endpoints().await? {
                tracing::info!(%binding, port, "proxy binding");
            }
            infra.endpoints_via_proxy().await?
        } else {
            infra.connection_config()?
        };

        println!("# session {}", infra.session());
        print_services_env(&endpoints, infra.config(), address)?;
        cancel.cancelled().await;
        Ok::<(), HarnessError>(())
    }
    .await;

    // Teardown must run even though `cancel` has fired
    let teardown = infra.stop(&CancellationToken::new()).await;
    result.and(teardown)
}

pub async fn sweep_command(config: &HarnessConfig, label: &str) -> Result<()> {
    let cancel = CancellationToken::new();
    let docker = DockerCli::new(&config.docker.binary, config.docker.command_timeout);
    let removed = sweep_session_resources(&docker, label, &cancel).await?;
    println!(
        "removed {} container(s) and {} network(s) for session {}",
        removed.containers.len(),
        removed.networks.len(),
        label
    );
    Ok(())
}

pub async fn env_command(config: HarnessConfig, session: &str, address: SocketAddr) -> Result<()> {
    if session.is_empty() {
        return Err(HarnessError::Config("Session must not be empty".to_string()));
    }
    let cancel = CancellationToken::new();
    let infra = Infrastructure::attach(config, session, &cancel).await?;
    print_services_env(&infra.connection_config()?, infra.config(), address)
}
