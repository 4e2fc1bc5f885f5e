//! Slow cache: the service keeps answering from origin while the cache
//! link is delayed, and latency drops back once the toxic is removed.

mod common;

use async_trait::async_trait;
use common::{conclude, setup_or_skip, FaultSlot, Suite};
use reporter_harness::fault::select_fault;
use reporter_harness::scenario::blocks::{
    assert_alive, await_readiness, expect_success, let_fault_propagate, median_latency,
};
use reporter_harness::{ChaosScenario, DependencyKind, HarnessError, LogicalFault, PhaseContext, Result};
use std::time::Duration;

const LIST_TEMPLATES: &str = "/v1/templates?limit=1";
const LATENCY_MS: u64 = 3_000;
const JITTER_MS: u64 = 1_000;
const RECOVERED_LATENCY: Duration = Duration::from_secs(1);

struct CacheLatency<'a> {
    suite: &'a Suite,
    faults: FaultSlot,
}

#[async_trait]
impl ChaosScenario for CacheLatency<'_> {
    fn name(&self) -> &str {
        "cache-latency"
    }

    fn fault(&self) -> String {
        self.faults.describe()
    }

    async fn normal(&self, ctx: &PhaseContext) -> Result<()> {
        if self.suite.infra.proxy().await.is_none() {
            return Err(HarnessError::PreconditionUnmet(
                "latency needs the fault proxy".to_string(),
            ));
        }
        let client = &self.suite.client;
        client.wait_for_system_health(ctx.remaining(), &ctx.cancel).await?;
        expect_success(client.get(LIST_TEMPLATES, &ctx.cancel).await)?;
        let baseline = median_latency(client, LIST_TEMPLATES, 5, &ctx.cancel).await?;
        tracing::info!(?baseline, "baseline latency");
        Ok(())
    }

    async fn inject(&self, ctx: &PhaseContext) -> Result<()> {
        let fault = select_fault(
            &self.suite.infra,
            LogicalFault::Latency {
                kind: DependencyKind::Cache,
                latency_ms: LATENCY_MS,
                jitter_ms: JITTER_MS,
            },
        )
        .await?;
        self.faults.apply(fault, &ctx.cancel).await
    }

    async fn verify_failure(&self, ctx: &PhaseContext) -> Result<()> {
        let_fault_propagate(Duration::from_secs(1), &ctx.cancel).await?;
        let client = &self.suite.client;
        expect_success(client.get("/health", &ctx.cancel).await)?;
        let resp = expect_success(client.get(LIST_TEMPLATES, &ctx.cancel).await)?;
        tracing::info!(elapsed = ?resp.elapsed, "templates served with a slow cache");
        assert_alive(&self.suite.supervisor)
    }

    async fn restore(&self, ctx: &PhaseContext) -> Result<()> {
        self.faults.revert_all(&ctx.cancel).await?;
        await_readiness(&self.suite.client, self.suite.config.chaos.readiness_timeout, &ctx.cancel).await
    }

    async fn verify_recovery(&self, ctx: &PhaseContext) -> Result<()> {
        let latency = median_latency(&self.suite.client, LIST_TEMPLATES, 5, &ctx.cancel).await?;
        if latency >= RECOVERED_LATENCY {
            return Err(HarnessError::ProtocolViolation(format!(
                "median latency still {:?} after the toxic was removed",
                latency
            )));
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn service_degrades_gracefully_with_slow_cache() {
    let Some(suite) = setup_or_skip("cache-latency", true).await else {
        return;
    };
    let scenario = CacheLatency {
        suite: &suite,
        faults: FaultSlot::default(),
    };
    let report = {
        let _lease = suite.infra.lease().await;
        suite.runner().run(&scenario).await
    };
    drop(scenario);
    conclude(suite, report).await;
}
