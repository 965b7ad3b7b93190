use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::agent::ExecutionCoordinator;
use crate::api::agent::AgentState;
use crate::api::center::CenterState;
use crate::config::{AgentConfig, CenterConfig};
use crate::error::Result;
use crate::fleet::FleetRegistry;
use crate::lease::MachineLeaseManager;
use crate::orchestrator::{HttpAgentClient, Orchestrator};

/// Coordinating process: lease table, fleet registry and orchestration API.
pub struct CenterNode {
    pub config: CenterConfig,
    pub leases: Arc<MachineLeaseManager>,
    pub registry: Arc<FleetRegistry>,
    pub orchestrator: Arc<Orchestrator>,
}

impl CenterNode {
    pub fn new(config: CenterConfig) -> Result<Self> {
        let leases = Arc::new(MachineLeaseManager::new(config.lease.clone()));
        let registry = Arc::new(FleetRegistry::with_agent_probe(config.discovery.clone())?);
        let agents = Arc::new(HttpAgentClient::new(
            config.discovery.agent_port,
            Duration::from_millis(config.agent_request_timeout_ms),
        )?);
        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            leases.clone(),
            agents,
        ));

        Ok(Self {
            config,
            leases,
            registry,
            orchestrator,
        })
    }

    pub fn state(&self) -> CenterState {
        CenterState {
            leases: self.leases.clone(),
            registry: self.registry.clone(),
            orchestrator: self.orchestrator.clone(),
        }
    }

    /// Run the center until `shutdown` is cancelled.
    ///
    /// Starts, in order:
    /// 1. the manual machine list load
    /// 2. the lease expiry sweep
    /// 3. the discovery and health-check loops
    /// 4. the HTTP API (blocks)
    ///
    /// A final lease snapshot is written once the server has stopped.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let manual = self.registry.load_manual().await;
        tracing::info!(
            addr = %self.config.listen_addr,
            manual_machines = manual,
            lease_timeout_ms = self.config.lease.lease_timeout_ms,
            "Starting center"
        );

        let sweep = self.leases.spawn_expiry_sweep(shutdown.clone());
        let discovery = self.registry.spawn_discovery_loop(shutdown.clone());
        let health = self.registry.spawn_health_check_loop(shutdown.clone());

        let app = crate::api::center::router(self.state());
        let served = crate::api::serve(self.config.listen_addr, app, shutdown.clone()).await;

        // The server can also stop on a bind error; make sure the loops follow.
        shutdown.cancel();
        for task in [sweep, discovery, health] {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.leases.persist_now().await;
        tracing::info!("Center stopped");
        served
    }
}

/// Machine-local agent: inventory and run supervision.
pub struct AgentNode {
    pub config: Arc<AgentConfig>,
    pub coordinator: Arc<ExecutionCoordinator>,
}

impl AgentNode {
    pub fn new(config: AgentConfig) -> Self {
        let coordinator = Arc::new(ExecutionCoordinator::new(config.execution.clone()));
        Self {
            config: Arc::new(config),
            coordinator,
        }
    }

    pub fn state(&self) -> AgentState {
        AgentState {
            coordinator: self.coordinator.clone(),
            config: self.config.clone(),
        }
    }

    /// Serve the agent API until `shutdown`; active runs are stopped on exit.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            addr = %self.config.listen_addr,
            case_dirs = ?self.config.execution.case_dirs,
            interpreter = ?self.config.execution.interpreter,
            "Starting agent"
        );

        let app = crate::api::agent::router(self.state());
        let served = crate::api::serve(self.config.listen_addr, app, shutdown).await;

        self.coordinator.stop_all().await;
        tracing::info!("Agent stopped");
        served
    }
}
