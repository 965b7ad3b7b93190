use std::path::{Path, PathBuf};
use std::time::Duration;

/// Out-of-band stop signal: a `<run_id>.stop` file the child polls for
/// between steps.
#[derive(Debug, Clone)]
pub struct StopFlags {
    dir: PathBuf,
}

impl StopFlags {
    /// Relative directories are made absolute, since children run with the
    /// script's directory as working directory.
    pub fn new(dir: PathBuf) -> Self {
        let dir = if dir.is_absolute() {
            dir
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&dir))
                .unwrap_or(dir)
        };
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.stop", run_id))
    }

    pub async fn raise(&self, run_id: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let stamp = chrono::Utc::now().timestamp_millis().to_string();
        tokio::fs::write(self.path(run_id), stamp).await
    }

    pub async fn clear(&self, run_id: &str) {
        match tokio::fs::remove_file(self.path(run_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(run_id, error = %e, "Failed to remove stop flag");
            }
        }
    }

    pub async fn is_raised(&self, run_id: &str) -> bool {
        tokio::fs::try_exists(self.path(run_id)).await.unwrap_or(false)
    }
}

/// Send `signal` to the process group led by `pid`.
pub fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe { libc::kill(-pid, signal) == 0 }
}

fn signal_pid(pid: libc::pid_t, signal: libc::c_int) -> bool {
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe { libc::kill(pid, signal) == 0 }
}

/// Pids whose command line contains `needle` as one argument.
pub fn find_processes(needle: &str) -> Vec<libc::pid_t> {
    let own = std::process::id();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| *pid != own)
        .filter(|pid| {
            std::fs::read(format!("/proc/{}/cmdline", pid))
                .map(|raw| raw.split(|b| *b == 0).any(|arg| arg == needle.as_bytes()))
                .unwrap_or(false)
        })
        .filter_map(|pid| libc::pid_t::try_from(pid).ok())
        .collect()
}

/// Fallback when no child handle exists: terminate every process that was
/// launched for `run_id`, escalating to SIGKILL after `grace`.
pub async fn terminate_matching(run_id: &str, grace: Duration) -> usize {
    let pids = find_processes(run_id);
    for pid in &pids {
        tracing::info!(run_id, pid, "Terminating process found by command line");
        signal_pid(*pid, libc::SIGTERM);
    }
    if pids.is_empty() {
        return 0;
    }

    tokio::time::sleep(grace).await;
    for pid in &pids {
        if Path::new(&format!("/proc/{}", pid)).exists() {
            tracing::warn!(run_id, pid, "Process ignored SIGTERM, killing");
            signal_pid(*pid, libc::SIGKILL);
        }
    }
    pids.len()
}
