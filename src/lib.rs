//! Reporter harness - chaos, property and end-to-end testing for the report
//! generation service
//!
//! The harness never contains the service itself. It brings up the service's
//! dependencies in containers, runs the service binaries against them,
//! perturbs the dependencies and checks that the service recovers:
//! - docker / containers: dependency containers and their adapters
//! - orchestrator: the network, parallel startup and ordered teardown
//! - proxy: the fault proxy sidecar and its toxics
//! - supervisor: the API and worker processes
//! - probe: the HTTP client used against the service
//! - fault / scenario: fault primitives and the five-phase chaos protocol
//! - models / resilience / fuzz: DTOs, reference models and fuzz corpora

pub mod cancel;
pub mod config;
pub mod containers;
pub mod docker;
pub mod error;
pub mod fault;
pub mod fuzz;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod probe;
pub mod proxy;
pub mod resilience;
pub mod scenario;
pub mod supervisor;

// Re-export commonly used types for easy access
pub use cancel::CancellationToken;
pub use config::{FaultStrategy, HarnessConfig};
pub use containers::{DependencyAdapter, DependencyEndpoint, DependencyKind};
pub use error::{ErrorKind, HarnessError, Result};
pub use fault::{CompositeFault, ContainerFault, Fault, LogicalFault, ProcessFault, ProxyFault};
pub use models::{CreateReportRequest, FilterCondition, FilterValue, ReportProbe, ReportStatus};
pub use orchestrator::{Endpoints, Infrastructure};
pub use probe::{HttpProbeClient, ProbeConfig, ProbeResponse};
pub use proxy::{FaultProxy, Toxic};
pub use scenario::{ChaosScenario, Phase, PhaseContext, ScenarioReport, ScenarioRunner};
pub use supervisor::ServiceSupervisor;
