use clap::{Parser, ValueEnum};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use benchfleet::agent::{LogChunk, RunRecord, StopAck};
use benchfleet::api::center::{
    ForceReleaseRequest, HeartbeatRequest, MachineDetail, ManualMachineRequest, ReleaseRequest,
    RunRequest, StopRequest,
};
use benchfleet::api::Envelope;
use benchfleet::config::{
    AgentConfig, CenterConfig, DiscoveryConfig, ExecutionConfig, LeaseConfig, DEFAULT_AGENT_PORT,
    DEFAULT_CENTER_PORT,
};
use benchfleet::error::BenchError;
use benchfleet::fleet::MachineRecord;
use benchfleet::lease::{AcquireRequest, FleetMachineStatus, Lease, LeaseAck, MachineLeaseStatus};
use benchfleet::node::{AgentNode, CenterNode};
use benchfleet::orchestrator::StartedRun;
use benchfleet::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "benchfleet")]
#[command(version)]
#[command(about = "Shared test-machine fleet: leases, discovery and remote test runs")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the coordinating center (leases, fleet registry, orchestration)
    Center(CenterArgs),

    /// Start the agent on a test machine
    Agent(AgentArgs),

    /// Fleet membership commands
    Machine {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: MachineCommands,
    },

    /// Lease commands
    Lease {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: LeaseCommands,
    },

    /// Remote test run commands
    Run {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: RunCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct CenterArgs {
    /// Port to listen on
    #[arg(long, env = "BENCH_CENTER_PORT", default_value_t = DEFAULT_CENTER_PORT)]
    port: u16,

    /// Port the agents listen on
    #[arg(long, env = "BENCH_AGENT_PORT", default_value_t = DEFAULT_AGENT_PORT)]
    agent_port: u16,

    /// Lease snapshot file
    #[arg(long, env = "BENCH_STATE_FILE", default_value = "machine_status.json")]
    state_file: PathBuf,

    /// Manually declared machine list
    #[arg(long, env = "BENCH_MANUAL_HOSTS", default_value = "manual_hosts.json")]
    manual_hosts: PathBuf,

    /// Seconds without heartbeat before a lease expires
    #[arg(long, default_value = "300")]
    lease_timeout_secs: u64,

    /// Seconds between expiry sweeps
    #[arg(long, default_value = "60")]
    sweep_interval_secs: u64,

    /// Seconds between discovery sweeps
    #[arg(long, default_value = "30")]
    discovery_interval_secs: u64,

    /// Seconds between health checks
    #[arg(long, default_value = "10")]
    health_check_interval_secs: u64,

    /// Extra /24 segments to scan (first three octets, e.g. 10.8.0)
    #[arg(long = "scan-segment", value_delimiter = ',')]
    scan_segments: Vec<String>,

    /// Do not scan the network; only manually declared machines are known
    #[arg(long)]
    manual_only: bool,

    /// Maximum concurrent probes
    #[arg(long, default_value = "100")]
    max_workers: usize,
}

#[derive(Parser, Debug)]
struct AgentArgs {
    /// Port to listen on
    #[arg(long, env = "BENCH_AGENT_PORT", default_value_t = DEFAULT_AGENT_PORT)]
    port: u16,

    /// Test case directories, searched in order
    #[arg(long = "case-dir", value_delimiter = ',')]
    case_dirs: Vec<PathBuf>,

    /// Program used to run test scripts
    #[arg(long, env = "BENCH_INTERPRETER", default_value = "python3")]
    interpreter: String,

    /// Execute test scripts directly instead of through the interpreter
    #[arg(long)]
    direct: bool,

    /// Directory for stop flag files
    #[arg(long, default_value = "stop_flags")]
    stop_flags_dir: PathBuf,

    /// Wall-clock ceiling per run, in seconds
    #[arg(long, default_value = "300")]
    run_timeout_secs: u64,

    /// Location reported to the center
    #[arg(long, env = "BENCH_LOCATION")]
    location: Option<String>,

    /// Ports always reported, e.g. COM3
    #[arg(long = "static-port", value_delimiter = ',')]
    static_ports: Vec<String>,
}

// =============================================================================
// Client Arguments (shared by machine, lease and run commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Center address
    #[arg(long, short = 'a', env = "BENCH_CENTER", default_value = "http://127.0.0.1:5002")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum MachineCommands {
    /// List known machines with their lease status
    List,
    /// Show one machine
    Show { address: String },
    /// Declare a machine manually
    Add {
        address: String,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value = "")]
        location: String,
    },
    /// Update a manually declared machine
    Update {
        address: String,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value = "")]
        location: String,
    },
    /// Remove a machine (drops a manual declaration first)
    Remove { address: String },
    /// Probe a machine now
    Refresh { address: String },
}

#[derive(clap::Subcommand, Debug)]
enum LeaseCommands {
    /// Acquire (or renew) a machine
    Acquire {
        address: String,
        #[arg(long)]
        holder: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "")]
        test_case: String,
        #[arg(long, default_value = "")]
        port: String,
        /// Manual occupancy, not limited to one machine per holder
        #[arg(long)]
        manual: bool,
    },
    /// Release a held machine
    Release {
        address: String,
        #[arg(long)]
        holder: String,
    },
    /// Refresh a lease heartbeat
    Heartbeat {
        address: String,
        #[arg(long)]
        holder: String,
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Release a machine regardless of holder
    ForceRelease {
        address: String,
        #[arg(long)]
        admin: String,
    },
    /// Lease status of one machine
    Status { address: String },
    /// All active leases
    List,
    /// Leases of one holder
    Sessions { holder: String },
    /// Release every lease of one holder
    ReleaseAll { holder: String },
}

#[derive(clap::Subcommand, Debug)]
enum RunCommands {
    /// Start a run on a machine you hold
    Start {
        address: String,
        test_case: String,
        port: String,
        #[arg(long)]
        holder: String,
        /// Acquire the machine first
        #[arg(long)]
        acquire: bool,
        #[arg(long)]
        name: Option<String>,
    },
    /// Run status
    Status { address: String, run_id: String },
    /// Run log
    Logs {
        address: String,
        run_id: String,
        /// Keep polling until the run ends
        #[arg(short, long)]
        follow: bool,
    },
    /// Stop a run
    Stop {
        address: String,
        run_id: String,
        #[arg(long)]
        holder: String,
    },
}

// =============================================================================
// Center Client
// =============================================================================

struct CenterClient {
    base: String,
    http: reqwest::Client,
}

impl CenterClient {
    fn new(addr: &str) -> Result<Self, BenchError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            base: addr.trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<(T, Option<String>), BenchError> {
        let envelope: Envelope<T> = request.send().await?.json().await?;
        let message = envelope.message.clone();
        Ok((envelope.into_result()?, message))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<(T, Option<String>), BenchError> {
        self.send(self.http.get(format!("{}{}", self.base, path))).await
    }

    async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(T, Option<String>), BenchError> {
        self.send(self.http.post(format!("{}{}", self.base, path)).json(body))
            .await
    }

    async fn put<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(T, Option<String>), BenchError> {
        self.send(self.http.put(format!("{}{}", self.base, path)).json(body))
            .await
    }

    async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<(T, Option<String>), BenchError> {
        self.send(self.http.delete(format!("{}{}", self.base, path))).await
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn fail(err: BenchError) -> ! {
    eprintln!("Error [{}]: {}", err.code(), err);
    std::process::exit(1);
}

fn print_lease(lease: &Lease) {
    println!("Machine:   {}", lease.machine_address);
    println!("Holder:    {} ({})", lease.holder_name, lease.holder_id);
    println!("Mode:      {}", lease.mode);
    println!("Test case: {}", lease.test_case);
    if !lease.port.is_empty() {
        println!("Port:      {}", lease.port);
    }
    println!("Heartbeat: {}", lease.last_heartbeat_at.to_rfc3339());
    if let Some(run_id) = &lease.run_id {
        println!("Run ID:    {}", run_id);
    }
}

fn print_run(run: &RunRecord) {
    println!("Run ID:    {}", run.run_id);
    println!("Test case: {}", run.test_case);
    println!("Port:      {}", run.port);
    println!("State:     {}", run.state);
    println!("Started:   {}", run.started_at.to_rfc3339());
    if let Some(ended) = run.ended_at {
        println!("Ended:     {}", ended.to_rfc3339());
    }
    if let Some(code) = run.exit_code {
        println!("Exit Code: {}", code);
    }
    if let Some(result) = &run.result {
        println!("Result:    {}", result);
    }
}

fn print_machine(machine: &MachineRecord) {
    println!("Address:   {}", machine.address);
    println!("Name:      {}", machine.display_name);
    if !machine.location.is_empty() {
        println!("Location:  {}", machine.location);
    }
    println!("Origin:    {:?}", machine.origin);
    println!("Reachable: {}", machine.reachable);
    if let Some(seen) = machine.last_seen_at {
        println!("Last Seen: {}", seen.to_rfc3339());
    }
    if !machine.capabilities.ports.is_empty() {
        println!("Ports:");
        for port in &machine.capabilities.ports {
            println!("  {:<20} {}", port.device, port.description);
        }
    }
    if !machine.capabilities.test_cases.is_empty() {
        println!("Test cases:");
        for case in &machine.capabilities.test_cases {
            println!("  {:<32} {}", case.name, case.display_name);
        }
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_center(args: CenterArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let discovery = if args.manual_only {
        DiscoveryConfig::manual_only(Some(args.manual_hosts))
    } else {
        let mut discovery = DiscoveryConfig {
            manual_hosts_file: Some(args.manual_hosts),
            ..DiscoveryConfig::default()
        };
        for segment in args.scan_segments {
            if !discovery.scan_segments.contains(&segment) {
                discovery.scan_segments.push(segment);
            }
        }
        discovery
    };

    let config = CenterConfig {
        listen_addr: SocketAddr::from(([0, 0, 0, 0], args.port)),
        lease: LeaseConfig {
            lease_timeout_ms: args.lease_timeout_secs * 1000,
            sweep_interval_ms: args.sweep_interval_secs * 1000,
            state_file: Some(args.state_file),
        },
        discovery: DiscoveryConfig {
            agent_port: args.agent_port,
            discovery_interval_ms: args.discovery_interval_secs * 1000,
            health_check_interval_ms: args.health_check_interval_secs * 1000,
            max_workers: args.max_workers,
            ..discovery
        },
        ..CenterConfig::default()
    };

    let shutdown = install_shutdown_handler()?;
    let node = CenterNode::new(config)?;
    node.run(shutdown).await?;
    Ok(())
}

async fn run_agent(args: AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let defaults = ExecutionConfig::default();
    let execution = ExecutionConfig {
        case_dirs: if args.case_dirs.is_empty() {
            defaults.case_dirs.clone()
        } else {
            args.case_dirs
        },
        interpreter: (!args.direct).then_some(args.interpreter),
        stop_flags_dir: args.stop_flags_dir,
        run_timeout_ms: args.run_timeout_secs * 1000,
        static_ports: args.static_ports,
        ..defaults
    };
    let config = AgentConfig {
        listen_addr: SocketAddr::from(([0, 0, 0, 0], args.port)),
        location: args.location,
        execution,
    };

    let shutdown = install_shutdown_handler()?;
    AgentNode::new(config).run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_machine(
    client: &CenterClient,
    command: MachineCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        MachineCommands::List => {
            let (machines, _) = client
                .get::<Vec<FleetMachineStatus>>("/api/machines")
                .await
                .unwrap_or_else(|e| fail(e));
            match output {
                OutputFormat::Json => print_json(&machines)?,
                OutputFormat::Table => {
                    if machines.is_empty() {
                        println!("No machines known.");
                        return Ok(());
                    }
                    println!("{:<16} {:<20} {:<10} {:<8} HOLDER", "ADDRESS", "NAME", "ORIGIN", "ONLINE");
                    println!("{}", "-".repeat(72));
                    for entry in &machines {
                        let (name, origin, online) = match &entry.machine {
                            Some(m) => (
                                m.display_name.clone(),
                                format!("{:?}", m.origin).to_lowercase(),
                                if m.reachable { "[+]" } else { "[-]" },
                            ),
                            None => ("-".to_string(), "-".to_string(), "?"),
                        };
                        let holder = entry
                            .lease
                            .lease
                            .as_ref()
                            .map(|l| format!("{} ({})", l.holder_name, l.test_case))
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "{:<16} {:<20} {:<10} {:<8} {}",
                            entry.address, name, origin, online, holder
                        );
                    }
                }
            }
        }
        MachineCommands::Show { address } => {
            let (detail, _) = client
                .get::<MachineDetail>(&format!("/api/machines/{}", address))
                .await
                .unwrap_or_else(|e| fail(e));
            match output {
                OutputFormat::Json => print_json(&detail)?,
                OutputFormat::Table => {
                    print_machine(&detail.machine);
                    println!("Lease:     {}", detail.lease.message);
                }
            }
        }
        MachineCommands::Add {
            address,
            name,
            location,
        } => {
            let body = ManualMachineRequest {
                address,
                name,
                location,
            };
            let (machine, message) = client
                .post::<MachineRecord, _>("/api/machines", &body)
                .await
                .unwrap_or_else(|e| fail(e));
            match output {
                OutputFormat::Json => print_json(&machine)?,
                OutputFormat::Table => {
                    println!("{}", message.unwrap_or_default());
                    print_machine(&machine);
                }
            }
        }
        MachineCommands::Update {
            address,
            name,
            location,
        } => {
            let body = ManualMachineRequest {
                address: address.clone(),
                name,
                location,
            };
            let (machine, _) = client
                .put::<MachineRecord, _>(&format!("/api/machines/{}", address), &body)
                .await
                .unwrap_or_else(|e| fail(e));
            match output {
                OutputFormat::Json => print_json(&machine)?,
                OutputFormat::Table => print_machine(&machine),
            }
        }
        MachineCommands::Remove { address } => {
            let (removed, message) = client
                .delete::<String>(&format!("/api/machines/{}", address))
                .await
                .unwrap_or_else(|e| fail(e));
            match output {
                OutputFormat::Json => print_json(&removed)?,
                OutputFormat::Table => println!("{}", message.unwrap_or(removed)),
            }
        }
        MachineCommands::Refresh { address } => {
            let (machine, _) = client
                .post::<MachineRecord, _>(&format!("/api/machines/{}/refresh", address), &())
                .await
                .unwrap_or_else(|e| fail(e));
            match output {
                OutputFormat::Json => print_json(&machine)?,
                OutputFormat::Table => print_machine(&machine),
            }
        }
    }
    Ok(())
}

async fn handle_lease(
    client: &CenterClient,
    command: LeaseCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let ack_result = match command {
        LeaseCommands::Acquire {
            address,
            holder,
            name,
            test_case,
            port,
            manual,
        } => {
            let name = name.unwrap_or_else(|| holder.clone());
            let mut req = AcquireRequest::new(address, holder, name)
                .test_case(test_case)
                .port(port);
            if manual {
                req = req.manual();
            }
            client.post::<LeaseAck, _>("/api/leases/acquire", &req).await
        }
        LeaseCommands::Release { address, holder } => {
            let body = ReleaseRequest {
                address,
                holder_id: holder,
            };
            client.post::<LeaseAck, _>("/api/leases/release", &body).await
        }
        LeaseCommands::Heartbeat {
            address,
            holder,
            run_id,
        } => {
            let body = HeartbeatRequest {
                address,
                holder_id: holder,
                run_id,
            };
            client.post::<LeaseAck, _>("/api/leases/heartbeat", &body).await
        }
        LeaseCommands::ForceRelease { address, admin } => {
            let body = ForceReleaseRequest { address, admin };
            client
                .post::<LeaseAck, _>("/api/leases/force_release", &body)
                .await
        }
        LeaseCommands::Status { address } => {
            let (status, _) = client
                .get::<MachineLeaseStatus>(&format!("/api/leases/{}", address))
                .await
                .unwrap_or_else(|e| fail(e));
            match output {
                OutputFormat::Json => print_json(&status)?,
                OutputFormat::Table => {
                    println!("{}: {}", status.address, status.message);
                    if let Some(lease) = &status.lease {
                        print_lease(lease);
                    }
                }
            }
            return Ok(());
        }
        LeaseCommands::List => {
            let (statuses, _) = client
                .get::<Vec<MachineLeaseStatus>>("/api/leases")
                .await
                .unwrap_or_else(|e| fail(e));
            match output {
                OutputFormat::Json => print_json(&statuses)?,
                OutputFormat::Table => {
                    if statuses.is_empty() {
                        println!("No active leases.");
                        return Ok(());
                    }
                    println!("{:<16} {:<20} {:<10} TEST CASE", "ADDRESS", "HOLDER", "MODE");
                    println!("{}", "-".repeat(64));
                    for lease in statuses.iter().filter_map(|s| s.lease.as_ref()) {
                        println!(
                            "{:<16} {:<20} {:<10} {}",
                            lease.machine_address, lease.holder_name, lease.mode, lease.test_case
                        );
                    }
                }
            }
            return Ok(());
        }
        LeaseCommands::Sessions { holder } => {
            let (leases, _) = client
                .get::<Vec<Lease>>(&format!("/api/holders/{}/sessions", holder))
                .await
                .unwrap_or_else(|e| fail(e));
            match output {
                OutputFormat::Json => print_json(&leases)?,
                OutputFormat::Table => {
                    if leases.is_empty() {
                        println!("{} holds no machines.", holder);
                    }
                    for lease in &leases {
                        print_lease(lease);
                        println!();
                    }
                }
            }
            return Ok(());
        }
        LeaseCommands::ReleaseAll { holder } => {
            let (released, message) = client
                .post::<Vec<String>, _>(&format!("/api/holders/{}/release_all", holder), &())
                .await
                .unwrap_or_else(|e| fail(e));
            match output {
                OutputFormat::Json => print_json(&released)?,
                OutputFormat::Table => {
                    println!("{}", message.unwrap_or_default());
                    for address in &released {
                        println!("  {}", address);
                    }
                }
            }
            return Ok(());
        }
    };

    let (ack, _) = ack_result.unwrap_or_else(|e| fail(e));
    match output {
        OutputFormat::Json => print_json(&ack)?,
        OutputFormat::Table => {
            println!("{}", ack.message);
            print_lease(&ack.lease);
        }
    }
    Ok(())
}

async fn handle_run(
    client: &CenterClient,
    command: RunCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        RunCommands::Start {
            address,
            test_case,
            port,
            holder,
            acquire,
            name,
        } => {
            let body = RunRequest {
                holder_name: name.unwrap_or_else(|| holder.clone()),
                holder_id: holder,
                test_case,
                port,
            };
            if acquire {
                let (started, _) = client
                    .post::<StartedRun, _>(&format!("/api/machines/{}/acquire_and_run", address), &body)
                    .await
                    .unwrap_or_else(|e| fail(e));
                match output {
                    OutputFormat::Json => print_json(&started)?,
                    OutputFormat::Table => {
                        print_lease(&started.lease);
                        println!();
                        print_run(&started.run);
                    }
                }
            } else {
                let (run, _) = client
                    .post::<RunRecord, _>(&format!("/api/machines/{}/runs", address), &body)
                    .await
                    .unwrap_or_else(|e| fail(e));
                match output {
                    OutputFormat::Json => print_json(&run)?,
                    OutputFormat::Table => print_run(&run),
                }
            }
        }
        RunCommands::Status { address, run_id } => {
            let (run, _) = client
                .get::<RunRecord>(&format!("/api/machines/{}/runs/{}", address, run_id))
                .await
                .unwrap_or_else(|e| fail(e));
            match output {
                OutputFormat::Json => print_json(&run)?,
                OutputFormat::Table => print_run(&run),
            }
        }
        RunCommands::Logs {
            address,
            run_id,
            follow,
        } => {
            let mut cursor = 0u64;
            loop {
                let (chunk, _) = client
                    .get::<LogChunk>(&format!(
                        "/api/machines/{}/runs/{}/logs?after={}",
                        address, run_id, cursor
                    ))
                    .await
                    .unwrap_or_else(|e| fail(e));
                cursor = chunk.next_cursor;
                match output {
                    OutputFormat::Json => {
                        for line in &chunk.lines {
                            println!("{}", serde_json::to_string(line)?);
                        }
                    }
                    OutputFormat::Table => {
                        for line in &chunk.lines {
                            println!("{:>6} [{:?}] {}", line.seq, line.stream, line.text);
                        }
                    }
                }
                if !follow {
                    break;
                }
                if chunk.lines.is_empty() {
                    let (run, _) = client
                        .get::<RunRecord>(&format!("/api/machines/{}/runs/{}", address, run_id))
                        .await
                        .unwrap_or_else(|e| fail(e));
                    if run.state.is_terminal() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        RunCommands::Stop {
            address,
            run_id,
            holder,
        } => {
            let body = StopRequest { holder_id: holder };
            let (ack, _) = client
                .post::<StopAck, _>(&format!("/api/machines/{}/runs/{}/stop", address, run_id), &body)
                .await
                .unwrap_or_else(|e| fail(e));
            match output {
                OutputFormat::Json => print_json(&ack)?,
                OutputFormat::Table => println!("{} ({})", ack.message, ack.state),
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Center(center_args) => run_center(center_args).await?,
        Commands::Agent(agent_args) => run_agent(agent_args).await?,
        Commands::Machine { client, command } => {
            let center = CenterClient::new(&client.addr)?;
            handle_machine(&center, command, &client.output).await?;
        }
        Commands::Lease { client, command } => {
            let center = CenterClient::new(&client.addr)?;
            handle_lease(&center, command, &client.output).await?;
        }
        Commands::Run { client, command } => {
            let center = CenterClient::new(&client.addr)?;
            handle_run(&center, command, &client.output).await?;
        }
    }

    Ok(())
}
