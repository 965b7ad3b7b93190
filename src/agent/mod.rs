//! Machine-local run supervision and inventory.
//!
//! The agent runs on every test machine. It resolves test programs by name,
//! launches them as child processes in their own process group, captures
//! stdout/stderr line by line into a bounded log and derives a terminal
//! state from the exit status and the JSON payload the program prints.
//!
//! Stopping is two-phase: a `<run_id>.stop` flag file the program can poll
//! between hardware steps, then SIGTERM and finally SIGKILL to the group.

pub mod coordinator;
pub mod inventory;
pub mod log;
pub mod resolver;
pub mod run;
pub mod stop;

pub use coordinator::{ExecutionCoordinator, StopAck};
pub use log::{LogBuffer, LogChunk, LogLine, LogStream};
pub use resolver::CaseResolver;
pub use run::{RunRecord, RunState};
pub use stop::StopFlags;
