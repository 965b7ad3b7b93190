//! Exclusive, heartbeat-renewed occupancy of test machines.
//!
//! A machine is identified by its network address. At most one [`Lease`]
//! exists per address; a lease whose last heartbeat is older than the
//! configured timeout is treated as absent everywhere and purged lazily on
//! access or by the background sweep.
//!
//! # Components
//!
//! - [`Lease`]: one occupancy record, automatic or manual
//! - [`LeaseStore`]: lease map plus the holder → addresses index, and the
//!   JSON snapshot format
//! - [`MachineLeaseManager`]: acquire / release / heartbeat / force-release
//!   policy behind a single critical section
//!
//! # Policy
//!
//! Automatic acquisitions are limited to one machine per holder; manual
//! acquisitions bypass that check so an operator can keep a console session
//! open next to scripted flows.

pub mod manager;
pub mod record;
pub mod store;

pub use manager::{
    AcquireRequest, FleetMachineStatus, LeaseAck, MachineLeaseManager, MachineLeaseStatus,
    Occupancy,
};
pub use record::{Lease, LeaseMode};
pub use store::{LeaseSnapshot, LeaseStore};
