//! Document store partitioned behind the fault proxy: template listing
//! degrades without crashing the service and comes back once healed.

mod common;

use async_trait::async_trait;
use common::{conclude, setup_or_skip, FaultSlot, Suite};
use reporter_harness::fault::{select_fault, ProxyAction};
use reporter_harness::scenario::blocks::{
    assert_alive, await_readiness, expect_degraded, expect_success, let_fault_propagate,
};
use reporter_harness::{ChaosScenario, DependencyKind, Fault, LogicalFault, PhaseContext, ProxyFault, Result};
use std::time::Duration;

const LIST_TEMPLATES: &str = "/v1/templates?limit=1";

struct DocumentStorePartition<'a> {
    suite: &'a Suite,
    faults: FaultSlot,
}

#[async_trait]
impl ChaosScenario for DocumentStorePartition<'_> {
    fn name(&self) -> &str {
        "document-store-partition"
    }

    fn fault(&self) -> String {
        self.faults.describe()
    }

    async fn normal(&self, ctx: &PhaseContext) -> Result<()> {
        let client = &self.suite.client;
        client.wait_for_system_health(ctx.remaining(), &ctx.cancel).await?;
        expect_success(client.get(LIST_TEMPLATES, &ctx.cancel).await)?;
        Ok(())
    }

    async fn inject(&self, ctx: &PhaseContext) -> Result<()> {
        let fault: Box<dyn Fault> = match self.suite.infra.proxy().await {
            Some(proxy) => Box::new(ProxyFault::new(proxy, DependencyKind::DocumentStore, ProxyAction::Partition)),
            None => select_fault(&self.suite.infra, LogicalFault::Outage(DependencyKind::DocumentStore)).await?,
        };
        self.faults.apply(fault, &ctx.cancel).await
    }

    async fn verify_failure(&self, ctx: &PhaseContext) -> Result<()> {
        let_fault_propagate(Duration::from_secs(2), &ctx.cancel).await?;
        let degradation = expect_degraded(self.suite.client.get(LIST_TEMPLATES, &ctx.cancel).await)?;
        tracing::info!(?degradation, "template listing degraded");
        assert_alive(&self.suite.supervisor)
    }

    async fn restore(&self, ctx: &PhaseContext) -> Result<()> {
        self.faults.revert_all(&ctx.cancel).await?;
        await_readiness(&self.suite.client, self.suite.config.chaos.readiness_timeout, &ctx.cancel).await
    }

    async fn verify_recovery(&self, ctx: &PhaseContext) -> Result<()> {
        expect_success(self.suite.client.get(LIST_TEMPLATES, &ctx.cancel).await)?;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn template_listing_recovers_from_partition() {
    let Some(suite) = setup_or_skip("document-store-partition", true).await else {
        return;
    };
    let scenario = DocumentStorePartition {
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
