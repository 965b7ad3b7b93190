use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::log::{LogBuffer, LogChunk, LogStream};
use crate::agent::resolver::CaseResolver;
use crate::agent::run::{parse_payload, PayloadVerdict, RunRecord, RunState};
use crate::agent::stop::{self, StopFlags};
use crate::config::ExecutionConfig;
use crate::error::{BenchError, Result};

/// Ceiling on waiting for the stream readers after the child exited.
const DRAIN_WAIT: Duration = Duration::from_secs(5);

/// Reply to a stop request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopAck {
    pub run_id: String,
    pub state: RunState,
    pub message: String,
}

struct RunEntry {
    record: RunRecord,
    logs: LogBuffer,
    /// Payload candidate: stdout from the first line starting with `{`.
    payload: Vec<String>,
    /// Set once the supervisor has recorded the outcome and is about to
    /// clear the stop flag.
    concluded: bool,
}

impl RunEntry {
    fn log(&mut self, stream: LogStream, text: impl Into<String>) {
        self.logs.push(stream, text);
        self.record.log_lines = self.logs.total();
    }
}

struct RunHandle {
    entry: Mutex<RunEntry>,
    /// Cancelled by a stop request; the supervision task owns the child and
    /// performs the escalation.
    stop: CancellationToken,
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    StopRequested,
}

/// Launches and supervises test programs on this machine.
pub struct ExecutionCoordinator {
    config: ExecutionConfig,
    resolver: CaseResolver,
    flags: StopFlags,
    runs: RwLock<HashMap<String, Arc<RunHandle>>>,
    seq: AtomicU64,
}

impl ExecutionCoordinator {
    pub fn new(config: ExecutionConfig) -> Self {
        Self {
            resolver: CaseResolver::new(config.case_dirs.clone()),
            flags: StopFlags::new(config.stop_flags_dir.clone()),
            runs: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            config,
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn resolver(&self) -> &CaseResolver {
        &self.resolver
    }

    /// Resolve and launch `test_case` against `port`.
    ///
    /// Resolution and spawn failures are returned here and leave no record
    /// behind. Everything after the spawn is observed through the run state.
    pub async fn start(&self, test_case: &str, port: &str) -> Result<RunRecord> {
        if test_case.is_empty() || port.is_empty() {
            return Err(BenchError::InvalidRequest("test_case 和 port".to_string()));
        }
        let script = self.resolver.resolve(test_case)?;

        let run_id = format!(
            "test_{}_{}",
            chrono::Utc::now().timestamp(),
            self.seq.fetch_add(1, Ordering::Relaxed)
        );
        self.flags.clear(&run_id).await;

        let mut entry = RunEntry {
            record: RunRecord::new(run_id.clone(), test_case.to_string(), port.to_string()),
            logs: LogBuffer::new(self.config.max_log_lines),
            payload: Vec::new(),
            concluded: false,
        };
        entry.log(LogStream::System, format!("Starting test case {} on {}", test_case, port));
        let handle = Arc::new(RunHandle {
            entry: Mutex::new(entry),
            stop: CancellationToken::new(),
        });
        self.runs.write().await.insert(run_id.clone(), handle.clone());

        let mut child = match self.spawn_child(&script, port, &run_id) {
            Ok(child) => child,
            Err(e) => {
                self.runs.write().await.remove(&run_id);
                tracing::error!(run_id = %run_id, script = %script.display(), error = %e, "Failed to spawn test program");
                return Err(BenchError::Spawn(e.to_string()));
            }
        };
        let pid = child.id();

        let readers = [
            child.stdout.take().map(|out| spawn_reader(handle.clone(), out, LogStream::Stdout)),
            child.stderr.take().map(|err| spawn_reader(handle.clone(), err, LogStream::Stderr)),
        ];

        let record = {
            let mut entry = handle.entry.lock().await;
            entry.record.mark_running();
            entry.log(LogStream::System, format!("Process started (pid {})", pid.unwrap_or(0)));
            entry.record.clone()
        };
        tracing::info!(run_id = %run_id, test_case, port, pid = ?pid, "Run started");

        let supervisor = Supervisor {
            handle,
            config: self.config.clone(),
            flags: self.flags.clone(),
            run_id,
            pid,
        };
        tokio::spawn(supervisor.run(child, readers));

        Ok(record)
    }

    fn spawn_child(&self, script: &std::path::Path, port: &str, run_id: &str) -> std::io::Result<Child> {
        let mut cmd = match &self.config.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(script);
                cmd
            }
            None => Command::new(script),
        };
        if let Some(dir) = script.parent() {
            cmd.current_dir(dir);
        }
        cmd.arg(port)
            .arg("--test-id")
            .arg(run_id)
            .arg("--stop-flags-dir")
            .arg(self.flags.dir())
            .env("BENCH_RUN_ID", run_id)
            .env("BENCH_STOP_FILE", self.flags.path(run_id))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        cmd.spawn()
    }

    /// Request a stop. The run reads as `Stopped` as soon as this returns;
    /// the cooperative flag and signal escalation proceed in the background.
    pub async fn request_stop(&self, run_id: &str) -> Result<StopAck> {
        let handle = self.runs.read().await.get(run_id).cloned();
        let Some(handle) = handle else {
            return self.stop_orphan(run_id).await;
        };

        {
            let mut entry = handle.entry.lock().await;
            if let Err(state) = entry.record.request_stop() {
                return Err(BenchError::RunFinished {
                    run_id: run_id.to_string(),
                    state: state.to_string(),
                });
            }
            entry.log(LogStream::System, "Stop requested");
        }

        if let Err(e) = self.flags.raise(run_id).await {
            tracing::warn!(run_id, error = %e, "Failed to write stop flag");
        }
        // The child may have exited on its own while the flag was written.
        if handle.entry.lock().await.concluded {
            self.flags.clear(run_id).await;
        }
        handle.stop.cancel();
        tracing::info!(run_id, "Run stop requested");

        Ok(StopAck {
            run_id: run_id.to_string(),
            state: RunState::Stopped,
            message: format!("测试 {} 已停止", run_id),
        })
    }

    /// Stop for a run this coordinator has no handle for, e.g. after a
    /// restart: find its processes by command line.
    async fn stop_orphan(&self, run_id: &str) -> Result<StopAck> {
        if stop::find_processes(run_id).is_empty() {
            return Err(BenchError::RunNotFound(run_id.to_string()));
        }
        if let Err(e) = self.flags.raise(run_id).await {
            tracing::warn!(run_id, error = %e, "Failed to write stop flag");
        }
        let grace = Duration::from_millis(self.config.terminate_grace_ms);
        let flags = self.flags.clone();
        let id = run_id.to_string();
        tokio::spawn(async move {
            let count = stop::terminate_matching(&id, grace).await;
            flags.clear(&id).await;
            tracing::info!(run_id = %id, count, "Orphaned run processes terminated");
        });

        Ok(StopAck {
            run_id: run_id.to_string(),
            state: RunState::Stopped,
            message: format!("测试 {} 已停止", run_id),
        })
    }

    pub async fn status(&self, run_id: &str) -> Result<RunRecord> {
        let handle = self.handle(run_id).await?;
        let entry = handle.entry.lock().await;
        Ok(entry.record.clone())
    }

    /// Log lines after `after`, at most `limit`.
    pub async fn logs(&self, run_id: &str, after: u64, limit: usize) -> Result<LogChunk> {
        let handle = self.handle(run_id).await?;
        let entry = handle.entry.lock().await;
        Ok(entry.logs.tail_after(after, limit))
    }

    pub async fn list_runs(&self) -> Vec<RunRecord> {
        let handles: Vec<Arc<RunHandle>> = self.runs.read().await.values().cloned().collect();
        let mut records = Vec::with_capacity(handles.len());
        for handle in handles {
            records.push(handle.entry.lock().await.record.clone());
        }
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.run_id.cmp(&b.run_id)));
        records
    }

    pub async fn running_count(&self) -> usize {
        self.list_runs()
            .await
            .iter()
            .filter(|r| !r.state.is_terminal())
            .count()
    }

    /// Stop every active run, used on shutdown.
    pub async fn stop_all(&self) {
        for record in self.list_runs().await {
            if !record.state.is_terminal() {
                let _ = self.request_stop(&record.run_id).await;
            }
        }
    }

    async fn handle(&self, run_id: &str) -> Result<Arc<RunHandle>> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| BenchError::RunNotFound(run_id.to_string()))
    }
}

fn spawn_reader<R>(handle: Arc<RunHandle>, stream: R, kind: LogStream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim_end_matches('\r').to_string();
                    let mut entry = handle.entry.lock().await;
                    let collecting = !entry.payload.is_empty() || line.trim_start().starts_with('{');
                    if kind == LogStream::Stdout && collecting && entry.payload.len() < entry.logs.capacity() {
                        entry.payload.push(line.clone());
                    }
                    entry.log(kind, line);
                }
                Ok(None) => break,
                Err(e) => {
                    let mut entry = handle.entry.lock().await;
                    entry.log(LogStream::System, format!("Failed to read {:?}: {}", kind, e));
                    break;
                }
            }
        }
    })
}

/// Owns the child process for the whole run.
struct Supervisor {
    handle: Arc<RunHandle>,
    config: ExecutionConfig,
    flags: StopFlags,
    run_id: String,
    pid: Option<u32>,
}

impl Supervisor {
    async fn run(self, mut child: Child, readers: [Option<JoinHandle<()>>; 2]) {
        let wake = tokio::select! {
            status = child.wait() => Wake::Exited(status),
            _ = tokio::time::sleep(self.config.run_timeout()) => Wake::TimedOut,
            _ = self.handle.stop.cancelled() => Wake::StopRequested,
        };

        let exit = match wake {
            Wake::Exited(status) => status,
            Wake::TimedOut => {
                self.note(LogStream::System, "Run exceeded its time limit, killing").await;
                tracing::warn!(run_id = %self.run_id, timeout_ms = self.config.run_timeout_ms, "Run timed out");
                let status = self.kill(&mut child).await;
                self.drain(readers).await;
                self.conclude(RunState::TimedOut, status.ok().and_then(|s| s.code()), None)
                    .await;
                return;
            }
            Wake::StopRequested => self.escalate(&mut child).await,
        };
        self.drain(readers).await;

        let status = match exit {
            Ok(status) => status,
            Err(e) => {
                self.note(LogStream::System, format!("Failed to wait for process: {}", e)).await;
                self.conclude(RunState::Error, None, None).await;
                return;
            }
        };

        let code = status.code();
        let stop_requested = self.handle.entry.lock().await.record.stop_requested;
        let stop_requested = stop_requested || self.flags.is_raised(&self.run_id).await;

        if stop_requested {
            self.note(LogStream::System, format!("Process exited after stop request ({:?})", code)).await;
            self.conclude(RunState::Stopped, code, None).await;
        } else if status.success() {
            let payload = self.handle.entry.lock().await.payload.clone();
            let verdict = parse_payload(&payload);
            match &verdict {
                PayloadVerdict::Missing => {
                    self.note(LogStream::System, "No result payload found in output").await;
                }
                PayloadVerdict::Malformed(e) => {
                    self.note(LogStream::System, format!("Malformed result payload: {}", e)).await;
                }
                _ => {}
            }
            let state = verdict.state();
            self.conclude(state, code, verdict.into_value()).await;
        } else {
            self.note(LogStream::System, format!("Process exited with {:?}", code)).await;
            self.conclude(RunState::Failed, code, None).await;
        }
    }

    /// Cooperative window, then SIGTERM to the group, then SIGKILL.
    async fn escalate(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        let window = Duration::from_millis(self.config.cooperative_window_ms);
        if let Ok(status) = tokio::time::timeout(window, child.wait()).await {
            self.note(LogStream::System, "Process stopped cooperatively").await;
            return status;
        }

        if let Some(pid) = self.pid {
            tracing::info!(run_id = %self.run_id, pid, "Sending SIGTERM to run process group");
            stop::signal_group(pid, libc::SIGTERM);
        }
        let grace = Duration::from_millis(self.config.terminate_grace_ms);
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            self.note(LogStream::System, "Process terminated").await;
            return status;
        }

        tracing::warn!(run_id = %self.run_id, "Process ignored SIGTERM, killing");
        self.note(LogStream::System, "Process did not exit after SIGTERM, killing").await;
        self.kill(child).await
    }

    async fn kill(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        if let Some(pid) = self.pid {
            stop::signal_group(pid, libc::SIGKILL);
        }
        let _ = child.start_kill();
        let wait = Duration::from_millis(self.config.kill_wait_ms);
        match tokio::time::timeout(wait, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::error!(run_id = %self.run_id, "Process could not be reaped after SIGKILL");
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "process not reaped after kill",
                ))
            }
        }
    }

    async fn drain(&self, readers: [Option<JoinHandle<()>>; 2]) {
        for reader in readers.into_iter().flatten() {
            if tokio::time::timeout(DRAIN_WAIT, reader).await.is_err() {
                tracing::warn!(run_id = %self.run_id, "Output reader did not finish in time");
            }
        }
    }

    async fn note(&self, stream: LogStream, text: impl Into<String>) {
        self.handle.entry.lock().await.log(stream, text);
    }

    async fn conclude(&self, state: RunState, exit_code: Option<i32>, result: Option<serde_json::Value>) {
        {
            let mut entry = self.handle.entry.lock().await;
            entry.record.exit_code = exit_code;
            if result.is_some() {
                entry.record.result = result;
            }
            // A stop request may already have ended the run.
            entry.record.finish(state);
            entry.concluded = true;
            let final_state = entry.record.state;
            entry.log(LogStream::System, format!("Run finished: {}", final_state));
            tracing::info!(run_id = %self.run_id, state = %final_state, exit_code = ?exit_code, "Run finished");
        }
        self.flags.clear(&self.run_id).await;
    }
}
