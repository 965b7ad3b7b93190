//! "Run test X on machine Y" on behalf of a lease holder.
//!
//! The [`Orchestrator`] checks the fleet registry and the lease table, then
//! forwards to the machine's agent through the [`AgentClient`] seam. No lock
//! of the lease manager is held while talking to an agent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::{LogChunk, RunRecord, StopAck};
use crate::api::{Envelope, StartRunRequest};
use crate::error::{BenchError, Result};
use crate::fleet::{FleetRegistry, MachineRecord};
use crate::lease::{AcquireRequest, Lease, MachineLeaseManager};

/// Remote surface of a machine's execution coordinator.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn start_run(&self, address: &str, test_case: &str, port: &str) -> Result<RunRecord>;

    async fn run_status(&self, address: &str, run_id: &str) -> Result<RunRecord>;

    async fn run_logs(&self, address: &str, run_id: &str, after: u64) -> Result<LogChunk>;

    async fn request_stop(&self, address: &str, run_id: &str) -> Result<StopAck>;
}

/// [`AgentClient`] speaking the agent's JSON-over-HTTP API.
#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    port: u16,
    client: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new(port: u16, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { port, client })
    }

    fn url(&self, address: &str, path: &str) -> String {
        format!("http://{}:{}{}", address, self.port, path)
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let envelope: Envelope<T> = response.json().await?;
        envelope.into_result()
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn start_run(&self, address: &str, test_case: &str, port: &str) -> Result<RunRecord> {
        let body = StartRunRequest {
            test_case: test_case.to_string(),
            port: port.to_string(),
        };
        let response = self
            .client
            .post(self.url(address, "/api/runs"))
            .json(&body)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn run_status(&self, address: &str, run_id: &str) -> Result<RunRecord> {
        let response = self
            .client
            .get(self.url(address, &format!("/api/runs/{}", run_id)))
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn run_logs(&self, address: &str, run_id: &str, after: u64) -> Result<LogChunk> {
        let response = self
            .client
            .get(self.url(address, &format!("/api/runs/{}/logs", run_id)))
            .query(&[("after", after)])
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn request_stop(&self, address: &str, run_id: &str) -> Result<StopAck> {
        let response = self
            .client
            .post(self.url(address, &format!("/api/runs/{}/stop", run_id)))
            .send()
            .await?;
        Self::decode(response).await
    }
}

/// Result of [`Orchestrator::acquire_and_start`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedRun {
    pub lease: Lease,
    pub run: RunRecord,
}

pub struct Orchestrator {
    registry: Arc<FleetRegistry>,
    leases: Arc<MachineLeaseManager>,
    agents: Arc<dyn AgentClient>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<FleetRegistry>,
        leases: Arc<MachineLeaseManager>,
        agents: Arc<dyn AgentClient>,
    ) -> Self {
        Self {
            registry,
            leases,
            agents,
        }
    }

    pub fn registry(&self) -> &Arc<FleetRegistry> {
        &self.registry
    }

    pub fn leases(&self) -> &Arc<MachineLeaseManager> {
        &self.leases
    }

    async fn reachable_machine(&self, address: &str) -> Result<MachineRecord> {
        let machine = self
            .registry
            .get_machine(address)
            .await
            .ok_or_else(|| BenchError::HostNotFound(address.to_string()))?;
        if !machine.reachable {
            return Err(BenchError::HostOffline(address.to_string()));
        }
        Ok(machine)
    }

    /// Start a run on a machine the caller already holds.
    pub async fn start_run(
        &self,
        address: &str,
        holder_id: &str,
        test_case: &str,
        port: &str,
    ) -> Result<RunRecord> {
        self.reachable_machine(address).await?;

        let status = self.leases.status(address).await;
        match &status.lease {
            None => return Err(BenchError::LeaseNotFound),
            Some(lease) if lease.holder_id != holder_id => {
                return Err(BenchError::NoPermission {
                    holder_name: lease.holder_name.clone(),
                });
            }
            Some(_) => {}
        }

        let run = self.agents.start_run(address, test_case, port).await?;
        self.attach_run(address, holder_id, &run).await;
        Ok(run)
    }

    /// Acquire automatically, then start. A lease created by this call is
    /// released again if the remote start fails; a pre-existing one is kept.
    pub async fn acquire_and_start(&self, req: AcquireRequest) -> Result<StartedRun> {
        self.reachable_machine(&req.address).await?;

        let held_before = self
            .leases
            .status(&req.address)
            .await
            .lease
            .is_some_and(|l| l.holder_id == req.holder_id);

        let address = req.address.clone();
        let holder_id = req.holder_id.clone();
        let test_case = req.test_case.clone();
        let port = req.port.clone();
        let ack = self.leases.acquire(req).await?;

        match self.agents.start_run(&address, &test_case, &port).await {
            Ok(run) => {
                self.attach_run(&address, &holder_id, &run).await;
                let lease = self
                    .leases
                    .status(&address)
                    .await
                    .lease
                    .unwrap_or(ack.lease);
                Ok(StartedRun { lease, run })
            }
            Err(e) => {
                tracing::warn!(address = %address, holder = %holder_id, error = %e, "Remote start failed");
                if !held_before {
                    if let Err(release_err) = self.leases.release(&address, &holder_id).await {
                        tracing::warn!(address = %address, error = %release_err, "Failed to roll back lease");
                    }
                }
                Err(e)
            }
        }
    }

    async fn attach_run(&self, address: &str, holder_id: &str, run: &RunRecord) {
        if let Err(e) = self
            .leases
            .heartbeat(address, holder_id, Some(run.run_id.clone()))
            .await
        {
            tracing::warn!(address, run_id = %run.run_id, error = %e, "Could not attach run to lease");
        }
    }

    pub async fn run_status(&self, address: &str, run_id: &str) -> Result<RunRecord> {
        self.known(address).await?;
        self.agents.run_status(address, run_id).await
    }

    pub async fn run_logs(&self, address: &str, run_id: &str, after: u64) -> Result<LogChunk> {
        self.known(address).await?;
        self.agents.run_logs(address, run_id, after).await
    }

    /// Stop a run. While the machine is leased only the holder may stop it.
    pub async fn stop_run(&self, address: &str, holder_id: &str, run_id: &str) -> Result<StopAck> {
        self.known(address).await?;
        if let Some(lease) = self.leases.status(address).await.lease {
            if lease.holder_id != holder_id {
                return Err(BenchError::NoPermission {
                    holder_name: lease.holder_name,
                });
            }
        }
        let ack = self.agents.request_stop(address, run_id).await?;
        tracing::info!(address, holder = holder_id, run_id, "Run stop forwarded");
        Ok(ack)
    }

    async fn known(&self, address: &str) -> Result<()> {
        match self.registry.get_machine(address).await {
            Some(_) => Ok(()),
            None => Err(BenchError::HostNotFound(address.to_string())),
        }
    }
}
