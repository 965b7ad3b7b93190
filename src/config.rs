use std::net::SocketAddr;
use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_AGENT_PORT: u16 = 5001;
pub const DEFAULT_CENTER_PORT: u16 = 5002;

/// Lease timing and persistence.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// A lease without a heartbeat for this long is treated as absent.
    pub lease_timeout_ms: u64,
    /// Interval of the background expiry sweep.
    pub sweep_interval_ms: u64,
    /// Snapshot file for the lease table. `None` keeps leases in memory only.
    pub state_file: Option<PathBuf>,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_timeout_ms: 300_000,
            sweep_interval_ms: 60_000,
            state_file: Some(PathBuf::from("machine_status.json")),
        }
    }
}

impl LeaseConfig {
    pub fn in_memory(lease_timeout_ms: u64) -> Self {
        Self {
            lease_timeout_ms,
            state_file: None,
            ..Default::default()
        }
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Fleet discovery and health checking.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Port the agent listens on, on every machine.
    pub agent_port: u16,
    pub discovery_interval_ms: u64,
    pub health_check_interval_ms: u64,
    /// Timeout of a single TCP reachability probe.
    pub probe_timeout_ms: u64,
    /// Timeout of a single capability fetch.
    pub fetch_timeout_ms: u64,
    /// Ceiling for one whole discovery sweep; partial results are kept.
    pub discovery_timeout_ms: u64,
    /// Maximum number of concurrent probes.
    pub max_workers: usize,
    /// Derive a /24 segment from the local outbound interface.
    pub auto_detect_segments: bool,
    /// Additional /24 segments (first three octets) to scan.
    pub scan_segments: Vec<String>,
    /// Host suffixes probed within every segment.
    pub suffix_ranges: Vec<Range<u8>>,
    /// Operator-maintained list of manually declared machines.
    pub manual_hosts_file: Option<PathBuf>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            agent_port: DEFAULT_AGENT_PORT,
            discovery_interval_ms: 30_000,
            health_check_interval_ms: 10_000,
            probe_timeout_ms: 2_000,
            fetch_timeout_ms: 3_000,
            discovery_timeout_ms: 10_000,
            max_workers: 100,
            auto_detect_segments: true,
            scan_segments: vec![
                "192.168.20".to_string(),
                "192.168.1".to_string(),
                "192.168.0".to_string(),
            ],
            suffix_ranges: vec![1..10, 20..40, 100..120, 200..210],
            manual_hosts_file: Some(PathBuf::from("manual_hosts.json")),
        }
    }
}

impl DiscoveryConfig {
    /// Configuration that never scans the network; only manual machines are known.
    pub fn manual_only(manual_hosts_file: Option<PathBuf>) -> Self {
        Self {
            auto_detect_segments: false,
            scan_segments: Vec::new(),
            manual_hosts_file,
            ..Default::default()
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Agent-side run supervision.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Ordered search path for test programs; first match wins.
    pub case_dirs: Vec<PathBuf>,
    /// Program used to launch a test script. `None` executes the script directly.
    pub interpreter: Option<String>,
    /// Hard wall-clock ceiling per run.
    pub run_timeout_ms: u64,
    /// How long a stopped child may react to the cooperative stop flag
    /// before it is sent SIGTERM.
    pub cooperative_window_ms: u64,
    /// Grace period between SIGTERM and SIGKILL.
    pub terminate_grace_ms: u64,
    /// How long to wait for the child to be reaped after SIGKILL.
    pub kill_wait_ms: u64,
    /// Directory holding `<run_id>.stop` flag files.
    pub stop_flags_dir: PathBuf,
    /// Upper bound of retained log lines per run.
    pub max_log_lines: usize,
    /// `/dev` name prefixes reported as serial-like ports.
    pub port_prefixes: Vec<String>,
    /// Ports that are always reported, e.g. `COM3` on a bench PC.
    pub static_ports: Vec<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            case_dirs: vec![PathBuf::from("test_cases"), PathBuf::from("TEST_CASES")],
            interpreter: Some("python3".to_string()),
            run_timeout_ms: 300_000,
            cooperative_window_ms: 1_000,
            terminate_grace_ms: 3_000,
            kill_wait_ms: 2_000,
            stop_flags_dir: PathBuf::from("stop_flags"),
            max_log_lines: 10_000,
            port_prefixes: vec!["ttyUSB".to_string(), "ttyACM".to_string()],
            static_ports: Vec::new(),
        }
    }
}

impl ExecutionConfig {
    pub fn with_case_dir(mut self, dir: PathBuf) -> Self {
        self.case_dirs.push(dir);
        self
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }
}

/// Coordinating process: lease manager, fleet registry, orchestration API.
#[derive(Debug, Clone)]
pub struct CenterConfig {
    pub listen_addr: SocketAddr,
    pub lease: LeaseConfig,
    pub discovery: DiscoveryConfig,
    /// Timeout for forwarded calls into an agent.
    pub agent_request_timeout_ms: u64,
}

impl Default for CenterConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_CENTER_PORT)),
            lease: LeaseConfig::default(),
            discovery: DiscoveryConfig::default(),
            agent_request_timeout_ms: 30_000,
        }
    }
}

/// Machine-local agent: inventory and run supervision.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    /// Human-readable location reported in the capability descriptor.
    pub location: Option<String>,
    pub execution: ExecutionConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_AGENT_PORT)),
            location: None,
            execution: ExecutionConfig::default(),
        }
    }
}
