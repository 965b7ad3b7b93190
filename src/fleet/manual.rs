use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One operator-declared machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualMachine {
    pub address: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: String,
}

/// JSON list of manually declared machines, kept apart from discovered ones
/// so it survives restarts. Without a path the list lives in memory only.
#[derive(Debug)]
pub struct ManualMachineStore {
    path: Option<PathBuf>,
    memory: std::sync::Mutex<Vec<ManualMachine>>,
}

impl ManualMachineStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            memory: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read the list. Missing file means no manual machines; a malformed one
    /// is logged and treated as empty.
    pub async fn load(&self) -> Vec<ManualMachine> {
        let Some(path) = &self.path else {
            return self
                .memory
                .lock()
                .map(|list| list.clone())
                .unwrap_or_default();
        };

        let data = match tokio::fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to read manual machine list");
                return Vec::new();
            }
        };

        match serde_json::from_str(&data) {
            Ok(list) => list,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Malformed manual machine list, ignoring");
                Vec::new()
            }
        }
    }

    pub async fn save(&self, machines: &[ManualMachine]) -> Result<()> {
        let Some(path) = &self.path else {
            if let Ok(mut list) = self.memory.lock() {
                *list = machines.to_vec();
            }
            return Ok(());
        };

        let data = serde_json::to_vec_pretty(machines)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
