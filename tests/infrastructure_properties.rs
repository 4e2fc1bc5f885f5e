//! Properties of the dependency infrastructure itself: stable host ports,
//! idempotent broker topology, transparent proxy bindings, clean teardown.
//! The docker-backed checks run as a single test because dependencies bind
//! fixed host ports.
//!
//! Checks report violations as errors so teardown always runs before the
//! test fails; a leaked container would hold the fixed ports.

mod common;

use common::is_skippable;
use reporter_harness::logging;
use reporter_harness::{
    CancellationToken, DependencyAdapter, DependencyKind, HarnessConfig, HarnessError, Infrastructure, Result,
};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const RESTART_CYCLES: usize = 2;
const TRANSPARENCY_SLACK: Duration = Duration::from_millis(10);

fn violation(message: String) -> HarnessError {
    HarnessError::ProtocolViolation(message)
}

async fn start_or_skip(cancel: &CancellationToken) -> Option<Infrastructure> {
    logging::init_for_tests();
    let config = HarnessConfig::for_suite("infrastructure-properties").unwrap();
    match Infrastructure::start(config, cancel).await {
        Ok(infra) => Some(infra),
        Err(e) if is_skippable(&e) => {
            eprintln!("skipping infrastructure properties: {}", e);
            None
        }
        Err(e) => panic!("infrastructure failed to start: {}", e),
    }
}

async fn port_stability(infra: &Infrastructure, cancel: &CancellationToken) -> Result<()> {
    let config = infra.config();
    let fixed = [
        (DependencyKind::DocumentStore, config.document_store.host_port),
        (DependencyKind::Broker, config.broker.amqp_host_port),
        (DependencyKind::Cache, config.cache.host_port),
        (DependencyKind::ObjectStore, config.object_store.host_port),
    ];
    for (kind, port) in fixed {
        let Some(port) = port else { continue };
        let adapter = infra.adapter(kind);
        let initial = adapter.endpoint()?.client_port;
        if initial != port {
            return Err(violation(format!("{} started on {} instead of {}", kind, initial, port)));
        }
        for cycle in 0..RESTART_CYCLES {
            adapter.restart(Duration::from_secs(1), cancel).await?;
            let observed = adapter.refresh_endpoint(cancel).await?.client_port;
            if observed != port {
                return Err(violation(format!(
                    "{} moved to port {} after restart cycle {}",
                    kind, observed, cycle
                )));
            }
        }
    }
    Ok(())
}

async fn topology_idempotence(infra: &Infrastructure, cancel: &CancellationToken) -> Result<()> {
    let broker = infra.broker();
    let expected = broker.declaration().expected_snapshot();
    let initial = broker.inspect_topology(cancel).await?;
    if initial != expected {
        return Err(violation(format!(
            "initial topology {:?} differs from declaration {:?}",
            initial, expected
        )));
    }

    for cycle in 0..RESTART_CYCLES {
        broker.restart(Duration::from_secs(1), cancel).await?;
        let observed = broker.inspect_topology(cancel).await?;
        if observed != initial {
            return Err(violation(format!(
                "topology after restart cycle {} is {:?}",
                cycle, observed
            )));
        }
    }
    Ok(())
}

/// Median request/reply round trip against the cache at `addr`. Without
/// AUTH the reply is an error line, which is still a full round trip.
async fn cache_round_trip(addr: &str, samples: usize) -> Result<Duration> {
    let mut stream = TcpStream::connect(addr).await?;
    let mut timings = Vec::with_capacity(samples);
    let mut buf = [0u8; 128];
    for _ in 0..samples {
        let started = Instant::now();
        stream.write_all(b"PING\r\n").await?;
        let n = stream.read(&mut buf).await?;
        timings.push(started.elapsed());
        if n == 0 {
            return Err(violation(format!("cache at {} closed the connection", addr)));
        }
    }
    timings.sort();
    Ok(timings[timings.len() / 2])
}

async fn proxy_transparency(infra: &Infrastructure, cancel: &CancellationToken) -> Result<()> {
    let proxy = infra.start_proxy(cancel).await?;
    proxy.inject_latency(DependencyKind::Cache, 200, 0, cancel).await?;
    proxy.remove_all_toxics(DependencyKind::Cache, cancel).await?;
    let left = proxy.toxics(DependencyKind::Cache, cancel).await?;
    if !left.is_empty() {
        return Err(violation(format!("toxics left after removal: {:?}", left)));
    }

    let direct = cache_round_trip(&infra.cache().endpoint()?.host_port(), 20).await?;
    let proxied = cache_round_trip(&proxy.host_endpoint(DependencyKind::Cache)?.host_port(), 20).await?;
    tracing::info!(?direct, ?proxied, "cache round trips");
    if proxied > direct + TRANSPARENCY_SLACK {
        return Err(violation(format!("proxied {:?} vs direct {:?}", proxied, direct)));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn infrastructure_properties() {
    let cancel = CancellationToken::new();
    let Some(infra) = start_or_skip(&cancel).await else {
        return;
    };

    let checks = async {
        port_stability(&infra, &cancel).await?;
        topology_idempotence(&infra, &cancel).await?;
        proxy_transparency(&infra, &cancel).await
    }
    .await;

    let teardown = infra.stop(&CancellationToken::new()).await;
    let residual = infra.residual_resources(&CancellationToken::new()).await;

    checks.unwrap();
    teardown.unwrap();
    let residual = residual.unwrap();
    assert!(residual.is_empty(), "left behind: {:?}", residual);
}

#[tokio::test]
async fn closed_cache_connection_is_reported_not_panicked() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 16];
        let _ = socket.read(&mut buf).await;
    });

    let err = cache_round_trip(&addr.to_string(), 3).await.unwrap_err();
    assert!(matches!(err, HarnessError::ProtocolViolation(_)), "{}", err);
}
