use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lease::record::Lease;

/// On-disk form of the lease table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseSnapshot {
    pub sessions: BTreeMap<String, Lease>,
    pub last_update: DateTime<Utc>,
}

/// Lease map keyed by machine address plus the reverse holder index.
///
/// The store itself is not synchronized; [`MachineLeaseManager`] owns it
/// behind one mutex so check-then-act sequences stay atomic.
///
/// [`MachineLeaseManager`]: crate::lease::MachineLeaseManager
#[derive(Debug)]
pub struct LeaseStore {
    leases: HashMap<String, Lease>,
    holders: HashMap<String, HashSet<String>>,
    timeout: Duration,
}

impl LeaseStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            leases: HashMap::new(),
            holders: HashMap::new(),
            timeout,
        }
    }

    pub fn from_snapshot(snapshot: LeaseSnapshot, timeout: Duration) -> Self {
        let mut store = Self::new(timeout);
        for (address, mut lease) in snapshot.sessions {
            // The map key is authoritative.
            lease.machine_address = address;
            store.insert(lease);
        }
        store
    }

    /// Load a snapshot file. A missing file yields an empty store; a
    /// malformed one is logged and ignored.
    pub fn load(path: &Path, timeout: Duration) -> Self {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No lease snapshot, starting empty");
                return Self::new(timeout);
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to read lease snapshot, starting empty");
                return Self::new(timeout);
            }
        };

        match serde_json::from_str::<LeaseSnapshot>(&data) {
            Ok(snapshot) => {
                let store = Self::from_snapshot(snapshot, timeout);
                tracing::info!(path = %path.display(), leases = store.len(), "Lease snapshot loaded");
                store
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Malformed lease snapshot, starting empty");
                Self::new(timeout)
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Current lease for `address` if it is still valid. An expired lease is
    /// removed as a side effect and reported as absent.
    pub fn valid(&mut self, address: &str, now: DateTime<Utc>) -> Option<&mut Lease> {
        let expired = match self.leases.get(address) {
            Some(lease) => !lease.is_valid(now, self.timeout),
            None => return None,
        };
        if expired {
            if let Some(lease) = self.remove(address) {
                tracing::info!(
                    address,
                    holder = %lease.holder_id,
                    "Expired lease purged on access"
                );
            }
            return None;
        }
        self.leases.get_mut(address)
    }

    /// Raw access without expiry handling.
    pub fn get(&self, address: &str) -> Option<&Lease> {
        self.leases.get(address)
    }

    pub fn insert(&mut self, lease: Lease) {
        self.holders
            .entry(lease.holder_id.clone())
            .or_default()
            .insert(lease.machine_address.clone());
        if let Some(previous) = self.leases.insert(lease.machine_address.clone(), lease) {
            self.unindex(&previous.holder_id, &previous.machine_address);
        }
    }

    pub fn remove(&mut self, address: &str) -> Option<Lease> {
        let lease = self.leases.remove(address)?;
        self.unindex(&lease.holder_id, address);
        Some(lease)
    }

    fn unindex(&mut self, holder_id: &str, address: &str) {
        // The same holder may have re-inserted the address already.
        if self
            .leases
            .get(address)
            .is_some_and(|l| l.holder_id == holder_id)
        {
            return;
        }
        if let Some(addresses) = self.holders.get_mut(holder_id) {
            addresses.remove(address);
            if addresses.is_empty() {
                self.holders.remove(holder_id);
            }
        }
    }

    /// Valid leases of `holder_id`. Expired entries found on the way are purged.
    pub fn valid_leases_of(&mut self, holder_id: &str, now: DateTime<Utc>) -> Vec<Lease> {
        let addresses: Vec<String> = self
            .holders
            .get(holder_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let mut leases: Vec<Lease> = addresses
            .iter()
            .filter_map(|address| self.valid(address, now).map(|l| l.clone()))
            .collect();
        leases.sort_by(|a, b| a.machine_address.cmp(&b.machine_address));
        leases
    }

    /// Remove every invalid lease and return what was purged.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<Lease> {
        let expired: Vec<String> = self
            .leases
            .values()
            .filter(|l| !l.is_valid(now, self.timeout))
            .map(|l| l.machine_address.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|address| self.remove(&address))
            .collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &Lease> {
        self.leases.values()
    }

    pub fn snapshot(&self) -> LeaseSnapshot {
        LeaseSnapshot {
            sessions: self
                .leases
                .iter()
                .map(|(address, lease)| (address.clone(), lease.clone()))
                .collect(),
            last_update: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn holder_count(&self) -> usize {
        self.holders.len()
    }
}

/// Write a snapshot atomically: temp file in the same directory, then rename.
pub async fn write_snapshot(path: &Path, snapshot: &LeaseSnapshot) -> std::io::Result<()> {
    let data = serde_json::to_vec_pretty(snapshot)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::record::LeaseMode;

    fn lease(address: &str, holder: &str) -> Lease {
        Lease::new(
            address.to_string(),
            holder.to_string(),
            holder.to_uppercase(),
            "caseA".to_string(),
            "COM1".to_string(),
            LeaseMode::Automatic,
        )
    }

    #[test]
    fn insert_and_remove_keep_index_in_step() {
        let mut store = LeaseStore::new(Duration::from_secs(60));
        store.insert(lease("10.0.0.1", "u1"));
        store.insert(lease("10.0.0.2", "u1"));
        assert_eq!(store.len(), 2);
        assert_eq!(store.holder_count(), 1);

        store.remove("10.0.0.1");
        assert_eq!(store.valid_leases_of("u1", Utc::now()).len(), 1);

        store.remove("10.0.0.2");
        assert_eq!(store.holder_count(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn replacing_a_lease_moves_the_index() {
        let mut store = LeaseStore::new(Duration::from_secs(60));
        store.insert(lease("10.0.0.1", "u1"));
        store.insert(lease("10.0.0.1", "u2"));
        assert_eq!(store.len(), 1);
        assert!(store.valid_leases_of("u1", Utc::now()).is_empty());
        assert_eq!(store.valid_leases_of("u2", Utc::now()).len(), 1);
    }

    #[test]
    fn valid_purges_expired_on_access() {
        let mut store = LeaseStore::new(Duration::from_secs(10));
        let mut l = lease("10.0.0.1", "u1");
        l.last_heartbeat_at = Utc::now() - chrono::Duration::seconds(11);
        store.insert(l);

        assert!(store.valid("10.0.0.1", Utc::now()).is_none());
        assert!(store.get("10.0.0.1").is_none());
        assert_eq!(store.holder_count(), 0);
    }

    #[test]
    fn purge_expired_only_touches_stale_leases() {
        let mut store = LeaseStore::new(Duration::from_secs(10));
        let mut stale = lease("10.0.0.1", "u1");
        stale.last_heartbeat_at = Utc::now() - chrono::Duration::seconds(30);
        store.insert(stale);
        store.insert(lease("10.0.0.2", "u2"));

        let purged = store.purge_expired(Utc::now());
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].machine_address, "10.0.0.1");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn snapshot_key_wins_over_embedded_address() {
        let mut l = lease("10.0.0.9", "u1");
        l.machine_address = "bogus".to_string();
        let mut sessions = BTreeMap::new();
        sessions.insert("10.0.0.9".to_string(), l);

        let store = LeaseStore::from_snapshot(
            LeaseSnapshot {
                sessions,
                last_update: Utc::now(),
            },
            Duration::from_secs(60),
        );
        assert_eq!(store.get("10.0.0.9").unwrap().machine_address, "10.0.0.9");
    }
}
