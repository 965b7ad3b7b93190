use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A serial-like port exposed by an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortDescriptor {
    pub device: String,
    pub description: String,
    pub hwid: String,
}

/// A runnable test program exposed by an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestCaseDescriptor {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub path: String,
    pub is_sample: bool,
}

/// Host information reported by an agent at `/api/info`.
///
/// Agents are versioned independently of the center, so every field is
/// optional on the wire and unknown fields are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentDescriptor {
    pub hostname: String,
    pub location: Option<String>,
    pub platform: String,
    pub agent_version: String,
    pub running_runs: usize,
    pub total_runs: usize,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Last capability descriptor fetched from a machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub hostname: Option<String>,
    pub location: Option<String>,
    pub ports: Vec<PortDescriptor>,
    pub test_cases: Vec<TestCaseDescriptor>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Capabilities {
    pub fn from_parts(
        info: AgentDescriptor,
        ports: Vec<PortDescriptor>,
        test_cases: Vec<TestCaseDescriptor>,
    ) -> Self {
        let mut metadata = info.extra;
        if !info.platform.is_empty() {
            metadata.insert("platform".into(), info.platform.into());
        }
        if !info.agent_version.is_empty() {
            metadata.insert("agent_version".into(), info.agent_version.into());
        }
        metadata.insert("running_runs".into(), info.running_runs.into());

        Self {
            hostname: Some(info.hostname).filter(|h| !h.is_empty()),
            location: info.location,
            ports,
            test_cases,
            metadata,
        }
    }

    pub fn has_port(&self, port: &str) -> bool {
        self.ports.iter().any(|p| p.device == port)
    }

    pub fn has_test_case(&self, name: &str) -> bool {
        self.test_cases.iter().any(|c| c.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineOrigin {
    Manual,
    Discovered,
}

/// A known fleet member.
///
/// `capabilities` is retained when the machine becomes unreachable so it can
/// still be displayed, but it must not be trusted until `reachable` is true
/// again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub address: String,
    pub display_name: String,
    pub location: String,
    pub reachable: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub capabilities: Capabilities,
    pub origin: MachineOrigin,
}

impl MachineRecord {
    pub fn discovered(address: String, capabilities: Capabilities) -> Self {
        let now = Utc::now();
        Self {
            display_name: capabilities
                .hostname
                .clone()
                .unwrap_or_else(|| address.clone()),
            location: capabilities.location.clone().unwrap_or_default(),
            address,
            reachable: true,
            last_seen_at: Some(now),
            last_checked_at: Some(now),
            capabilities,
            origin: MachineOrigin::Discovered,
        }
    }

    /// Operator-declared machine that has not been probed yet.
    pub fn manual(address: String, display_name: String, location: String) -> Self {
        Self {
            display_name: if display_name.is_empty() {
                address.clone()
            } else {
                display_name
            },
            address,
            location,
            reachable: false,
            last_seen_at: None,
            last_checked_at: None,
            capabilities: Capabilities::default(),
            origin: MachineOrigin::Manual,
        }
    }

    /// Capabilities that may be used to authorize work.
    pub fn trusted_capabilities(&self) -> Option<&Capabilities> {
        self.reachable.then_some(&self.capabilities)
    }

    pub fn is_manual(&self) -> bool {
        self.origin == MachineOrigin::Manual
    }

    /// Apply freshly fetched capabilities. Manual records keep their
    /// operator-given name and location.
    pub fn update_capabilities(&mut self, capabilities: Capabilities) {
        if !self.is_manual() {
            if let Some(hostname) = &capabilities.hostname {
                self.display_name = hostname.clone();
            }
            if let Some(location) = &capabilities.location {
                self.location = location.clone();
            }
        } else if self.location.is_empty() {
            self.location = capabilities.location.clone().unwrap_or_default();
        }
        self.capabilities = capabilities;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerant_descriptor_parsing() {
        let info: AgentDescriptor = serde_json::from_str(
            r#"{"hostname":"bench-01","agent_version":"2.0.0","psutil_available":true}"#,
        )
        .unwrap();
        assert_eq!(info.hostname, "bench-01");
        assert_eq!(info.running_runs, 0);
        assert_eq!(info.extra["psutil_available"], serde_json::Value::Bool(true));

        let caps = Capabilities::from_parts(info, vec![], vec![]);
        assert_eq!(caps.hostname.as_deref(), Some("bench-01"));
        assert_eq!(caps.metadata["agent_version"], "2.0.0");
    }

    #[test]
    fn unreachable_capabilities_are_not_trusted() {
        let mut caps = Capabilities::default();
        caps.ports.push(PortDescriptor {
            device: "COM3".to_string(),
            ..Default::default()
        });
        let mut record = MachineRecord::discovered("10.0.0.5".to_string(), caps);
        assert!(record.trusted_capabilities().is_some_and(|c| c.has_port("COM3")));

        record.reachable = false;
        assert!(record.trusted_capabilities().is_none());
        assert!(record.capabilities.has_port("COM3"));
    }

    #[test]
    fn manual_record_keeps_operator_name() {
        let mut record = MachineRecord::manual(
            "10.0.0.7".to_string(),
            "Bench A".to_string(),
            String::new(),
        );
        record.update_capabilities(Capabilities {
            hostname: Some("host-a".to_string()),
            location: Some("Lab 2".to_string()),
            ..Default::default()
        });
        assert_eq!(record.display_name, "Bench A");
        assert_eq!(record.location, "Lab 2");
    }
}
