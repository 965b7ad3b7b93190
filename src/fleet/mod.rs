//! Live view of which test machines exist, whether they answer, and what
//! they can run.
//!
//! Two independent background loops feed the [`FleetRegistry`]:
//!
//! - **discovery** reads the manual machine list and scans candidate
//!   addresses that are not known yet; it only ever adds machines
//! - **health check** probes every known machine, records reachability
//!   transitions and refreshes capabilities when a machine comes back
//!
//! Probes go through the [`NetworkProbe`] trait, bounded by timeouts and
//! fanned out over a capped worker pool so one dead address never holds up
//! the rest of a sweep.

pub mod candidates;
pub mod machine;
pub mod manual;
pub mod probe;
pub mod registry;

pub use machine::{
    AgentDescriptor, Capabilities, MachineOrigin, MachineRecord, PortDescriptor,
    TestCaseDescriptor,
};
pub use manual::{ManualMachine, ManualMachineStore};
pub use probe::{AgentProbe, NetworkProbe};
pub use registry::FleetRegistry;
