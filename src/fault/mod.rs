//! Fault primitives
//!
//! Every fault is something that can be applied and later reverted. The same
//! logical failure can usually be expressed through container lifecycle or
//! through the fault proxy; [`select_fault`] picks the variant from the
//! configured strategy and what is actually running.

use crate::cancel::{sleep_cancellable, CancellationToken};
use crate::config::FaultStrategy;
use crate::containers::{DependencyAdapter, DependencyKind};
use crate::error::{HarnessError, Result};
use crate::orchestrator::Infrastructure;
use crate::proxy::FaultProxy;
use crate::supervisor::ServiceSupervisor;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Something a scenario injects in Phase 2 and undoes in Phase 4
#[async_trait]
pub trait Fault: Send + Sync {
    /// Human-readable label used in logs and reports
    fn describe(&self) -> String;

    async fn apply(&self, cancel: &CancellationToken) -> Result<()>;

    /// Must be safe to call whether or not `apply` finished
    async fn revert(&self, cancel: &CancellationToken) -> Result<()>;
}

#[async_trait]
impl<F: Fault + ?Sized> Fault for Arc<F> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    async fn apply(&self, cancel: &CancellationToken) -> Result<()> {
        (**self).apply(cancel).await
    }

    async fn revert(&self, cancel: &CancellationToken) -> Result<()> {
        (**self).revert(cancel).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerAction {
    Stop,
    /// Stop, stay down for the delay, start
    RestartWithDelay(Duration),
}

/// Fault expressed through a dependency container's lifecycle
pub struct ContainerFault {
    adapter: Arc<dyn DependencyAdapter>,
    action: ContainerAction,
    down: AtomicBool,
}

impl ContainerFault {
    pub fn new(adapter: Arc<dyn DependencyAdapter>, action: ContainerAction) -> Self {
        Self {
            adapter,
            action,
            down: AtomicBool::new(false),
        }
    }

    pub fn stop(adapter: Arc<dyn DependencyAdapter>) -> Self {
        Self::new(adapter, ContainerAction::Stop)
    }

    pub fn restart_with_delay(adapter: Arc<dyn DependencyAdapter>, delay: Duration) -> Self {
        Self::new(adapter, ContainerAction::RestartWithDelay(delay))
    }

    /// Whether the container is currently held down by this fault
    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    async fn bring_up(&self, cancel: &CancellationToken) -> Result<()> {
        self.adapter.start(cancel).await?;
        self.down.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Fault for ContainerFault {
    fn describe(&self) -> String {
        match self.action {
            ContainerAction::Stop => format!("container stop ({})", self.adapter.kind()),
            ContainerAction::RestartWithDelay(delay) => {
                format!("container restart ({}, down {:?})", self.adapter.kind(), delay)
            }
        }
    }

    async fn apply(&self, cancel: &CancellationToken) -> Result<()> {
        self.adapter.stop(cancel).await?;
        self.down.store(true, Ordering::SeqCst);
        if let ContainerAction::RestartWithDelay(delay) = self.action {
            sleep_cancellable(cancel, delay).await?;
            self.bring_up(cancel).await?;
        }
        Ok(())
    }

    async fn revert(&self, cancel: &CancellationToken) -> Result<()> {
        if self.is_down() {
            self.bring_up(cancel).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProxyAction {
    Latency { latency_ms: u64, jitter_ms: u64 },
    /// Zero bandwidth both ways
    Partition,
    PacketLoss { percent: f32, timeout_ms: u64 },
    /// Binding disabled for `outage`, then re-enabled
    Blackout { outage: Duration },
}

/// Fault expressed as toxics on one proxy binding
pub struct ProxyFault {
    proxy: Arc<FaultProxy>,
    kind: DependencyKind,
    action: ProxyAction,
}

impl ProxyFault {
    pub fn new(proxy: Arc<FaultProxy>, kind: DependencyKind, action: ProxyAction) -> Self {
        Self { proxy, kind, action }
    }
}

#[async_trait]
impl Fault for ProxyFault {
    fn describe(&self) -> String {
        match self.action {
            ProxyAction::Latency { latency_ms, jitter_ms } => {
                format!("proxy latency ({}, {}ms +{}ms)", self.kind, latency_ms, jitter_ms)
            }
            ProxyAction::Partition => format!("proxy partition ({})", self.kind),
            ProxyAction::PacketLoss { percent, .. } => format!("proxy packet loss ({}, {}%)", self.kind, percent),
            ProxyAction::Blackout { outage } => format!("proxy blackout ({}, {:?})", self.kind, outage),
        }
    }

    async fn apply(&self, cancel: &CancellationToken) -> Result<()> {
        match self.action {
            ProxyAction::Latency { latency_ms, jitter_ms } => {
                self.proxy.inject_latency(self.kind, latency_ms, jitter_ms, cancel).await
            }
            ProxyAction::Partition => self.proxy.inject_connection_loss(self.kind, cancel).await,
            ProxyAction::PacketLoss { percent, timeout_ms } => {
                self.proxy.inject_packet_loss(self.kind, percent, timeout_ms, cancel).await
            }
            ProxyAction::Blackout { outage } => {
                self.proxy.disable(self.kind, cancel).await?;
                sleep_cancellable(cancel, outage).await?;
                self.proxy.enable(self.kind, cancel).await
            }
        }
    }

    async fn revert(&self, cancel: &CancellationToken) -> Result<()> {
        if let ProxyAction::Blackout { .. } = self.action {
            self.proxy.enable(self.kind, cancel).await?;
        }
        self.proxy.remove_all_toxics(self.kind, cancel).await
    }
}

/// Stops the worker process and starts it again on revert
pub struct ProcessFault {
    supervisor: Arc<ServiceSupervisor>,
}

impl ProcessFault {
    pub fn worker(supervisor: Arc<ServiceSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl Fault for ProcessFault {
    fn describe(&self) -> String {
        "worker process stop".to_string()
    }

    async fn apply(&self, cancel: &CancellationToken) -> Result<()> {
        self.supervisor.stop_worker(cancel).await
    }

    async fn revert(&self, _cancel: &CancellationToken) -> Result<()> {
        self.supervisor.start_worker()
    }
}

/// Faults applied in order and reverted in reverse
pub struct CompositeFault {
    faults: Vec<Box<dyn Fault>>,
}

impl CompositeFault {
    pub fn new(faults: Vec<Box<dyn Fault>>) -> Self {
        Self { faults }
    }
}

#[async_trait]
impl Fault for CompositeFault {
    fn describe(&self) -> String {
        self.faults.iter().map(|f| f.describe()).collect::<Vec<_>>().join(" + ")
    }

    async fn apply(&self, cancel: &CancellationToken) -> Result<()> {
        for fault in &self.faults {
            fault.apply(cancel).await?;
        }
        Ok(())
    }

    /// Keeps reverting after a failure and reports the first error
    async fn revert(&self, cancel: &CancellationToken) -> Result<()> {
        let mut first_error = None;
        for fault in self.faults.iter().rev() {
            if let Err(e) = fault.revert(cancel).await {
                tracing::warn!(fault = %fault.describe(), error = %e, "revert failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// A failure described independently of how it is produced
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogicalFault {
    /// Dependency unreachable until restored
    Outage(DependencyKind),
    /// Dependency unreachable for a fixed time
    Restart(DependencyKind, Duration),
    Latency {
        kind: DependencyKind,
        latency_ms: u64,
        jitter_ms: u64,
    },
    PacketLoss {
        kind: DependencyKind,
        percent: f32,
    },
}

impl LogicalFault {
    pub fn dependency(&self) -> DependencyKind {
        match *self {
            LogicalFault::Outage(kind) | LogicalFault::Restart(kind, _) => kind,
            LogicalFault::Latency { kind, .. } | LogicalFault::PacketLoss { kind, .. } => kind,
        }
    }

    /// Only outages can be produced without the proxy
    pub fn needs_proxy(&self) -> bool {
        matches!(self, LogicalFault::Latency { .. } | LogicalFault::PacketLoss { .. })
    }
}

/// Which variant will produce `fault`.
///
/// A proxy request falls back to the container path when no proxy is
/// running; faults with no container form need the proxy either way.
pub fn resolve_strategy(requested: FaultStrategy, proxy_running: bool, fault: &LogicalFault) -> Result<FaultStrategy> {
    if fault.needs_proxy() {
        return if proxy_running {
            Ok(FaultStrategy::Proxy)
        } else {
            Err(HarnessError::PreconditionUnmet(format!(
                "{:?} needs the fault proxy, which is not running",
                fault
            )))
        };
    }
    match requested {
        FaultStrategy::Proxy if proxy_running => Ok(FaultStrategy::Proxy),
        FaultStrategy::Proxy => {
            tracing::warn!(?fault, "fault proxy not running, falling back to container faults");
            Ok(FaultStrategy::Container)
        }
        FaultStrategy::Container => Ok(FaultStrategy::Container),
    }
}

/// Packet-loss connections stall this long before closing
const PACKET_LOSS_TIMEOUT_MS: u64 = 1_000;

/// Build the fault for `logical` under the configured strategy
pub async fn select_fault(infra: &Infrastructure, logical: LogicalFault) -> Result<Box<dyn Fault>> {
    let proxy = infra.proxy().await;
    let strategy = resolve_strategy(infra.config().chaos.fault_strategy, proxy.is_some(), &logical)?;
    let kind = logical.dependency();

    let fault: Box<dyn Fault> = match (strategy, proxy) {
        (FaultStrategy::Proxy, Some(proxy)) => {
            let action = match logical {
                LogicalFault::Outage(_) => ProxyAction::Partition,
                LogicalFault::Restart(_, outage) => ProxyAction::Blackout { outage },
                LogicalFault::Latency {
                    latency_ms, jitter_ms, ..
                } => ProxyAction::Latency { latency_ms, jitter_ms },
                LogicalFault::PacketLoss { percent, .. } => ProxyAction::PacketLoss {
                    percent,
                    timeout_ms: PACKET_LOSS_TIMEOUT_MS,
                },
            };
            Box::new(ProxyFault::new(proxy, kind, action))
        }
        _ => {
            let adapter = infra.adapter(kind);
            match logical {
                LogicalFault::Restart(_, delay) => Box::new(ContainerFault::restart_with_delay(adapter, delay)),
                _ => Box::new(ContainerFault::stop(adapter)),
            }
        }
    };
    tracing::info!(fault = %fault.describe(), ?strategy, "fault selected");
    Ok(fault)
}
