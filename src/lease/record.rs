use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Test-case label used for manual occupancy without a named test.
pub const MANUAL_PLACEHOLDER: &str = "手动占用";
/// Test-case label used for automatic occupancy without a named test.
pub const UNKNOWN_CASE: &str = "未知测试";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseMode {
    Automatic,
    Manual,
}

impl std::fmt::Display for LeaseMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseMode::Automatic => write!(f, "automatic"),
            LeaseMode::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: Uuid,
    pub machine_address: String,
    pub holder_id: String,
    pub holder_name: String,
    pub test_case: String,
    pub port: String,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub mode: LeaseMode,
    #[serde(default)]
    pub run_id: Option<String>,
}

impl Lease {
    pub fn new(
        machine_address: String,
        holder_id: String,
        holder_name: String,
        test_case: String,
        port: String,
        mode: LeaseMode,
    ) -> Self {
        let now = Utc::now();
        let test_case = if test_case.is_empty() {
            match mode {
                LeaseMode::Manual => MANUAL_PLACEHOLDER.to_string(),
                LeaseMode::Automatic => UNKNOWN_CASE.to_string(),
            }
        } else {
            test_case
        };

        Self {
            lease_id: Uuid::new_v4(),
            machine_address,
            holder_id,
            holder_name,
            test_case,
            port,
            created_at: now,
            last_heartbeat_at: now,
            mode,
            run_id: None,
        }
    }

    /// A lease is valid while its last heartbeat is younger than `timeout`.
    /// Heartbeats stamped in the future (clock adjustments) count as fresh.
    pub fn is_valid(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match (now - self.last_heartbeat_at).to_std() {
            Ok(elapsed) => elapsed < timeout,
            Err(_) => true,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat_at = now;
    }

    /// Renewal by the same holder: only meaningful values overwrite the
    /// recorded test case and port.
    pub fn renew(&mut self, now: DateTime<Utc>, test_case: &str, port: &str) {
        self.touch(now);
        if !test_case.is_empty() && test_case != MANUAL_PLACEHOLDER {
            self.test_case = test_case.to_string();
        }
        if !port.is_empty() {
            self.port = port.to_string();
        }
    }

    pub fn is_automatic(&self) -> bool {
        self.mode == LeaseMode::Automatic
    }
}
