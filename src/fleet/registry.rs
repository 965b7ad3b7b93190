use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DiscoveryConfig;
use crate::error::{BenchError, Result};
use crate::fleet::candidates;
use crate::fleet::machine::{Capabilities, MachineOrigin, MachineRecord};
use crate::fleet::manual::{ManualMachine, ManualMachineStore};
use crate::fleet::probe::{AgentProbe, NetworkProbe};

/// Outcome of probing one address.
struct ProbeOutcome {
    address: String,
    reachable: bool,
    capabilities: Option<Result<Capabilities>>,
}

/// Best-effort cache of fleet members.
///
/// The cache is written only by discovery, health checks and the manual
/// list operations; readers get cloned snapshots and may observe data up to
/// one health-check interval old.
pub struct FleetRegistry {
    machines: RwLock<HashMap<String, MachineRecord>>,
    probe: Arc<dyn NetworkProbe>,
    manual: ManualMachineStore,
    /// Serializes read-modify-write of the manual list file.
    manual_lock: Mutex<()>,
    config: DiscoveryConfig,
}

impl FleetRegistry {
    pub fn new(config: DiscoveryConfig, probe: Arc<dyn NetworkProbe>) -> Self {
        Self {
            machines: RwLock::new(HashMap::new()),
            probe,
            manual: ManualMachineStore::new(config.manual_hosts_file.clone()),
            manual_lock: Mutex::new(()),
            config,
        }
    }

    /// Registry probing real agents over the network.
    pub fn with_agent_probe(config: DiscoveryConfig) -> Result<Self> {
        let probe = AgentProbe::new(&config)?;
        Ok(Self::new(config, Arc::new(probe)))
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub async fn list_known_machines(&self) -> Vec<MachineRecord> {
        let machines = self.machines.read().await;
        let mut list: Vec<MachineRecord> = machines.values().cloned().collect();
        list.sort_by(|a, b| a.address.cmp(&b.address));
        list
    }

    pub async fn get_machine(&self, address: &str) -> Option<MachineRecord> {
        self.machines.read().await.get(address).cloned()
    }

    /// Load the manual list into the cache without probing.
    pub async fn load_manual(&self) -> usize {
        let manual = self.manual.load().await;
        self.sync_manual(&manual).await;
        manual.len()
    }

    /// One discovery sweep: sync the manual list, then probe candidate
    /// addresses not yet known. Returns the number of newly found machines.
    pub async fn run_discovery(&self) -> usize {
        let manual = self.manual.load().await;
        self.sync_manual(&manual).await;

        let known: HashSet<String> = self.machines.read().await.keys().cloned().collect();
        let segments = candidates::scan_segments(&self.config);
        let targets = candidates::candidate_addresses(&segments, &self.config, &known);
        if targets.is_empty() {
            return 0;
        }

        tracing::debug!(candidates = targets.len(), segments = ?segments, "Discovery sweep started");
        let ceiling = Duration::from_millis(self.config.discovery_timeout_ms);
        let mut found = 0usize;
        let mut outcomes = self.probe_all(targets);

        let sweep = async {
            while let Some(outcome) = outcomes.next().await {
                if outcome.reachable && self.apply(outcome).await {
                    found += 1;
                }
            }
        };
        if tokio::time::timeout(ceiling, sweep).await.is_err() {
            tracing::warn!(timeout_ms = self.config.discovery_timeout_ms, "Discovery sweep hit its ceiling, keeping partial results");
        }

        if found > 0 {
            tracing::info!(found, "Discovery found new machines");
        }
        found
    }

    /// Probe every known machine concurrently and apply each result as soon
    /// as it arrives.
    pub async fn run_health_check(&self) {
        let snapshot: Vec<String> = self.machines.read().await.keys().cloned().collect();
        let mut outcomes = self.probe_all(snapshot);
        while let Some(outcome) = outcomes.next().await {
            self.apply(outcome).await;
        }
    }

    /// Out-of-band probe of one known machine. Capabilities are always
    /// refetched when it answers.
    pub async fn refresh_now(&self, address: &str) -> Result<MachineRecord> {
        if self.get_machine(address).await.is_none() {
            return Err(BenchError::HostNotFound(address.to_string()));
        }
        let outcome = probe_one(self.probe.as_ref(), address.to_string(), true, true).await;
        self.apply(outcome).await;
        self.get_machine(address)
            .await
            .ok_or_else(|| BenchError::HostNotFound(address.to_string()))
    }

    /// Declare a machine manually and probe it immediately.
    pub async fn add_manual(
        &self,
        address: &str,
        name: &str,
        location: &str,
    ) -> Result<MachineRecord> {
        if address.parse::<IpAddr>().is_err() {
            return Err(BenchError::InvalidAddress(address.to_string()));
        }

        {
            let _guard = self.manual_lock.lock().await;
            let mut list = self.manual.load().await;
            if list.iter().any(|m| m.address == address) {
                return Err(BenchError::HostExists(address.to_string()));
            }
            list.push(ManualMachine {
                address: address.to_string(),
                name: name.to_string(),
                location: location.to_string(),
            });
            self.manual.save(&list).await?;
            self.sync_manual(&list).await;
        }
        tracing::info!(address, name, "Manual machine added");

        self.refresh_now(address).await
    }

    pub async fn update_manual(
        &self,
        address: &str,
        name: &str,
        location: &str,
    ) -> Result<MachineRecord> {
        {
            let _guard = self.manual_lock.lock().await;
            let mut list = self.manual.load().await;
            let entry = list
                .iter_mut()
                .find(|m| m.address == address)
                .ok_or_else(|| BenchError::HostNotFound(address.to_string()))?;
            entry.name = name.to_string();
            entry.location = location.to_string();
            self.manual.save(&list).await?;
            self.sync_manual(&list).await;
        }
        tracing::info!(address, name, "Manual machine updated");

        self.get_machine(address)
            .await
            .ok_or_else(|| BenchError::HostNotFound(address.to_string()))
    }

    /// Remove a machine on operator request.
    ///
    /// A manual declaration is dropped first; the machine then stays known
    /// as discovered while it is reachable. A machine that is only known
    /// through discovery is evicted from the cache, and comes back only if a
    /// later sweep finds it again.
    pub async fn remove_machine(&self, address: &str) -> Result<()> {
        let _guard = self.manual_lock.lock().await;
        let mut list = self.manual.load().await;
        let before = list.len();
        list.retain(|m| m.address != address);
        if list.len() != before {
            self.manual.save(&list).await?;
            self.sync_manual(&list).await;
            tracing::info!(address, "Manual machine removed");
            return Ok(());
        }

        if self.machines.write().await.remove(address).is_none() {
            return Err(BenchError::HostNotFound(address.to_string()));
        }
        tracing::info!(address, "Discovered machine removed");
        Ok(())
    }

    pub async fn manual_machines(&self) -> Vec<ManualMachine> {
        self.manual.load().await
    }

    /// Bring cache origins in line with the manual list.
    async fn sync_manual(&self, manual: &[ManualMachine]) {
        let mut machines = self.machines.write().await;

        for entry in manual {
            match machines.get_mut(&entry.address) {
                Some(record) => {
                    record.origin = MachineOrigin::Manual;
                    if !entry.name.is_empty() {
                        record.display_name = entry.name.clone();
                    }
                    if !entry.location.is_empty() {
                        record.location = entry.location.clone();
                    }
                }
                None => {
                    machines.insert(
                        entry.address.clone(),
                        MachineRecord::manual(
                            entry.address.clone(),
                            entry.name.clone(),
                            entry.location.clone(),
                        ),
                    );
                }
            }
        }

        let declared: HashSet<&str> = manual.iter().map(|m| m.address.as_str()).collect();
        machines.retain(|address, record| {
            if record.origin != MachineOrigin::Manual || declared.contains(address.as_str()) {
                return true;
            }
            if record.reachable {
                tracing::info!(address = %address, "Machine no longer declared manually, keeping as discovered");
                record.origin = MachineOrigin::Discovered;
                true
            } else {
                tracing::info!(address = %address, "Unreachable machine no longer declared manually, dropping");
                false
            }
        });
    }

    fn probe_all(&self, addresses: Vec<String>) -> impl futures::Stream<Item = ProbeOutcome> + '_ {
        let workers = self.config.max_workers.max(1);
        stream::iter(addresses)
            .map(move |address| async move {
                let was_reachable = self
                    .machines
                    .read()
                    .await
                    .get(&address)
                    .is_some_and(|m| m.reachable);
                probe_one(self.probe.as_ref(), address, was_reachable, false).await
            })
            .buffer_unordered(workers)
    }

    /// Apply one probe outcome. Returns true when a new machine was added.
    async fn apply(&self, outcome: ProbeOutcome) -> bool {
        let now = Utc::now();
        let mut machines = self.machines.write().await;

        let Some(record) = machines.get_mut(&outcome.address) else {
            if !outcome.reachable {
                return false;
            }
            let capabilities = match outcome.capabilities {
                Some(Ok(caps)) => caps,
                Some(Err(e)) => {
                    tracing::warn!(address = %outcome.address, error = %e, "Capability fetch failed for new machine");
                    Capabilities::default()
                }
                None => Capabilities::default(),
            };
            let record = MachineRecord::discovered(outcome.address.clone(), capabilities);
            tracing::info!(
                address = %record.address,
                hostname = %record.display_name,
                ports = record.capabilities.ports.len(),
                test_cases = record.capabilities.test_cases.len(),
                "Machine discovered"
            );
            machines.insert(outcome.address, record);
            return true;
        };

        record.last_checked_at = Some(now);
        match (record.reachable, outcome.reachable) {
            (true, false) => {
                tracing::warn!(address = %record.address, "Machine became unreachable");
            }
            (false, true) => {
                tracing::info!(address = %record.address, "Machine became reachable");
            }
            _ => {}
        }
        record.reachable = outcome.reachable;
        if outcome.reachable {
            record.last_seen_at = Some(now);
        }

        match outcome.capabilities {
            Some(Ok(caps)) => record.update_capabilities(caps),
            Some(Err(e)) => {
                tracing::warn!(address = %record.address, error = %e, "Capability refresh failed, keeping previous descriptor");
            }
            None => {}
        }
        false
    }

    /// Spawn the periodic discovery loop.
    pub fn spawn_discovery_loop(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = Duration::from_millis(self.config.discovery_interval_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        registry.run_discovery().await;
                    }
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Discovery loop stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Spawn the periodic health-check loop.
    pub fn spawn_health_check_loop(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = Duration::from_millis(self.config.health_check_interval_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        registry.run_health_check().await;
                    }
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Health check loop stopping");
                        break;
                    }
                }
            }
        })
    }
}

async fn probe_one(
    probe: &dyn NetworkProbe,
    address: String,
    was_reachable: bool,
    force_fetch: bool,
) -> ProbeOutcome {
    let reachable = probe.is_reachable(&address).await;
    // Capabilities are refreshed on transition to reachable, not on every tick.
    let capabilities = if reachable && (!was_reachable || force_fetch) {
        Some(probe.fetch_capabilities(&address).await)
    } else {
        None
    };
    ProbeOutcome {
        address,
        reachable,
        capabilities,
    }
}
