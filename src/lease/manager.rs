use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::LeaseConfig;
use crate::error::{BenchError, Result};
use crate::fleet::{FleetRegistry, MachineRecord};
use crate::lease::record::{Lease, LeaseMode};
use crate::lease::store::{write_snapshot, LeaseStore};

/// Parameters of an acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireRequest {
    pub address: String,
    pub holder_id: String,
    pub holder_name: String,
    #[serde(default)]
    pub test_case: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub manual: bool,
}

impl AcquireRequest {
    pub fn new(
        address: impl Into<String>,
        holder_id: impl Into<String>,
        holder_name: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            holder_id: holder_id.into(),
            holder_name: holder_name.into(),
            test_case: String::new(),
            port: String::new(),
            manual: false,
        }
    }

    pub fn test_case(mut self, test_case: impl Into<String>) -> Self {
        self.test_case = test_case.into();
        self
    }

    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.port = port.into();
        self
    }

    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    fn mode(&self) -> LeaseMode {
        if self.manual {
            LeaseMode::Manual
        } else {
            LeaseMode::Automatic
        }
    }
}

/// Successful lease operation: a human-readable message and the lease as it
/// stands (or stood, for releases) afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseAck {
    pub message: String,
    pub lease: Lease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Occupancy {
    Idle,
    Busy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineLeaseStatus {
    pub address: String,
    pub state: Occupancy,
    pub available: bool,
    pub message: String,
    pub lease: Option<Lease>,
}

impl MachineLeaseStatus {
    fn idle(address: &str) -> Self {
        Self {
            address: address.to_string(),
            state: Occupancy::Idle,
            available: true,
            message: "空闲".to_string(),
            lease: None,
        }
    }

    fn busy(lease: Lease) -> Self {
        Self {
            address: lease.machine_address.clone(),
            state: Occupancy::Busy,
            available: false,
            message: format!("正在被 {} 使用", lease.holder_name),
            lease: Some(lease),
        }
    }
}

/// One fleet member merged with its lease status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetMachineStatus {
    pub address: String,
    /// `None` when a lease exists for an address the registry does not know.
    pub machine: Option<MachineRecord>,
    pub lease: MachineLeaseStatus,
}

/// Grants exclusive, heartbeat-bounded occupancy of machines.
///
/// All check-then-act sequences run under a single mutex, so two holders can
/// never both observe "no valid lease" for the same address. Snapshot writes
/// also happen under the lock to keep the file in mutation order.
pub struct MachineLeaseManager {
    store: Mutex<LeaseStore>,
    config: LeaseConfig,
}

impl MachineLeaseManager {
    /// Build a manager, reloading the snapshot file if one is configured.
    pub fn new(config: LeaseConfig) -> Self {
        let store = match &config.state_file {
            Some(path) => LeaseStore::load(path, config.lease_timeout()),
            None => LeaseStore::new(config.lease_timeout()),
        };
        Self {
            store: Mutex::new(store),
            config,
        }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    pub async fn acquire(&self, req: AcquireRequest) -> Result<LeaseAck> {
        let now = Utc::now();
        let mut store = self.store.lock().await;

        if let Some(existing) = store.valid(&req.address, now) {
            if existing.holder_id != req.holder_id {
                tracing::info!(
                    address = %req.address,
                    holder = %req.holder_id,
                    current_holder = %existing.holder_id,
                    "Acquire rejected, machine busy"
                );
                return Err(BenchError::HostBusy {
                    holder_name: existing.holder_name.clone(),
                });
            }

            existing.renew(now, &req.test_case, &req.port);
            let lease = existing.clone();
            tracing::debug!(address = %req.address, holder = %req.holder_id, "Lease renewed");
            self.persist(&store).await;
            return Ok(LeaseAck {
                message: format!("继续使用测试机 {}", req.address),
                lease,
            });
        }

        if !req.manual {
            let elsewhere: Vec<String> = store
                .valid_leases_of(&req.holder_id, now)
                .into_iter()
                .filter(|l| l.is_automatic() && l.machine_address != req.address)
                .map(|l| l.machine_address)
                .collect();
            if !elsewhere.is_empty() {
                tracing::info!(
                    address = %req.address,
                    holder = %req.holder_id,
                    held = ?elsewhere,
                    "Acquire rejected, holder already owns an automatic lease"
                );
                return Err(BenchError::HolderBusyElsewhere {
                    addresses: elsewhere,
                });
            }
        }

        let mode = req.mode();
        let lease = Lease::new(
            req.address.clone(),
            req.holder_id,
            req.holder_name,
            req.test_case,
            req.port,
            mode,
        );
        store.insert(lease.clone());
        tracing::info!(
            address = %lease.machine_address,
            holder = %lease.holder_id,
            lease_id = %lease.lease_id,
            mode = %mode,
            "Lease acquired"
        );
        self.persist(&store).await;

        let message = match mode {
            LeaseMode::Automatic => format!("成功获取测试机 {} 使用权", lease.machine_address),
            LeaseMode::Manual => format!("成功手动占用测试机 {} 使用权", lease.machine_address),
        };
        Ok(LeaseAck { message, lease })
    }

    pub async fn release(&self, address: &str, holder_id: &str) -> Result<LeaseAck> {
        let now = Utc::now();
        let mut store = self.store.lock().await;

        let current = store.valid(address, now).ok_or(BenchError::LeaseNotFound)?;
        if current.holder_id != holder_id {
            return Err(BenchError::NoPermission {
                holder_name: current.holder_name.clone(),
            });
        }

        let lease = store.remove(address).ok_or(BenchError::LeaseNotFound)?;
        tracing::info!(address, holder = holder_id, lease_id = %lease.lease_id, "Lease released");
        self.persist(&store).await;
        Ok(LeaseAck {
            message: format!("成功释放测试机 {}", address),
            lease,
        })
    }

    /// Refresh the heartbeat of a held lease, optionally attaching a run id.
    pub async fn heartbeat(
        &self,
        address: &str,
        holder_id: &str,
        run_id: Option<String>,
    ) -> Result<LeaseAck> {
        let now = Utc::now();
        let mut store = self.store.lock().await;

        let lease = store.valid(address, now).ok_or(BenchError::SessionNotFound)?;
        if lease.holder_id != holder_id {
            return Err(BenchError::HolderMismatch);
        }
        lease.touch(now);
        if run_id.is_some() {
            lease.run_id = run_id;
        }
        let lease = lease.clone();
        tracing::debug!(address, holder = holder_id, run_id = ?lease.run_id, "Heartbeat");
        self.persist(&store).await;

        Ok(LeaseAck {
            message: "心跳更新成功".to_string(),
            lease,
        })
    }

    /// Destroy any lease on `address` regardless of holder.
    pub async fn force_release(&self, address: &str, admin_name: &str) -> Result<LeaseAck> {
        let mut store = self.store.lock().await;

        // Expired leases are still reclaimable here; the caller wants the slot cleared.
        let lease = store.remove(address).ok_or(BenchError::LeaseNotFound)?;
        tracing::warn!(
            address,
            admin = admin_name,
            holder = %lease.holder_id,
            holder_name = %lease.holder_name,
            lease_id = %lease.lease_id,
            "Lease force-released"
        );
        self.persist(&store).await;

        Ok(LeaseAck {
            message: format!(
                "管理员 {} 强制释放了被 {} 占用的测试机 {}",
                admin_name, lease.holder_name, address
            ),
            lease,
        })
    }

    pub async fn status(&self, address: &str) -> MachineLeaseStatus {
        let mut store = self.store.lock().await;
        match store.valid(address, Utc::now()) {
            Some(lease) => MachineLeaseStatus::busy(lease.clone()),
            None => MachineLeaseStatus::idle(address),
        }
    }

    /// Status of every address that currently carries a valid lease.
    pub async fn all_statuses(&self) -> Vec<MachineLeaseStatus> {
        let now = Utc::now();
        let mut store = self.store.lock().await;
        let purged = store.purge_expired(now);
        if !purged.is_empty() {
            self.persist(&store).await;
        }

        let mut statuses: Vec<MachineLeaseStatus> = store
            .all()
            .cloned()
            .map(MachineLeaseStatus::busy)
            .collect();
        statuses.sort_by(|a, b| a.address.cmp(&b.address));
        statuses
    }

    /// Every machine the registry knows, merged with its lease status.
    /// Leased addresses unknown to the registry are included with no record.
    pub async fn all_statuses_with_fleet(&self, registry: &FleetRegistry) -> Vec<FleetMachineStatus> {
        // Taken before the lease lock so the two locks are never nested.
        let machines = registry.list_known_machines().await;

        let mut merged: BTreeMap<String, FleetMachineStatus> = machines
            .into_iter()
            .map(|m| {
                (
                    m.address.clone(),
                    FleetMachineStatus {
                        address: m.address.clone(),
                        lease: MachineLeaseStatus::idle(&m.address),
                        machine: Some(m),
                    },
                )
            })
            .collect();

        for status in self.all_statuses().await {
            merged
                .entry(status.address.clone())
                .and_modify(|entry| entry.lease = status.clone())
                .or_insert_with(|| FleetMachineStatus {
                    address: status.address.clone(),
                    machine: None,
                    lease: status.clone(),
                });
        }

        merged.into_values().collect()
    }

    /// Addresses validly leased by `holder_id`.
    pub async fn sessions_of(&self, holder_id: &str) -> BTreeSet<String> {
        self.leases_of(holder_id)
            .await
            .into_iter()
            .map(|l| l.machine_address)
            .collect()
    }

    pub async fn leases_of(&self, holder_id: &str) -> Vec<Lease> {
        let mut store = self.store.lock().await;
        store.valid_leases_of(holder_id, Utc::now())
    }

    /// Release everything a holder owns, e.g. on logout.
    pub async fn release_all(&self, holder_id: &str) -> Vec<String> {
        let now = Utc::now();
        let mut store = self.store.lock().await;
        let released: Vec<String> = store
            .valid_leases_of(holder_id, now)
            .into_iter()
            .filter_map(|l| store.remove(&l.machine_address))
            .map(|l| l.machine_address)
            .collect();

        if !released.is_empty() {
            tracing::info!(holder = holder_id, addresses = ?released, "Released all leases of holder");
            self.persist(&store).await;
        }
        released
    }

    /// Purge every expired lease; returns what was removed.
    pub async fn sweep_expired(&self) -> Vec<Lease> {
        let mut store = self.store.lock().await;
        let purged = store.purge_expired(Utc::now());
        for lease in &purged {
            tracing::info!(
                address = %lease.machine_address,
                holder = %lease.holder_id,
                last_heartbeat = %lease.last_heartbeat_at.to_rfc3339(),
                "Lease expired"
            );
        }
        if !purged.is_empty() {
            self.persist(&store).await;
        }
        purged
    }

    /// Background expiry sweep, independent of request traffic.
    pub fn spawn_expiry_sweep(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.sweep_interval());
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let purged = manager.sweep_expired().await;
                        if !purged.is_empty() {
                            tracing::info!(count = purged.len(), "Expiry sweep purged leases");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Lease expiry sweep stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Write the current snapshot immediately (used at shutdown).
    pub async fn persist_now(&self) {
        let store = self.store.lock().await;
        self.persist(&store).await;
    }

    async fn persist(&self, store: &LeaseStore) {
        let Some(path) = &self.config.state_file else {
            return;
        };
        if let Err(e) = write_snapshot(path, &store.snapshot()).await {
            tracing::error!(path = %path.display(), error = %e, "Failed to persist lease snapshot");
        }
    }
}
