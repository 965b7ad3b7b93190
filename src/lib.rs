pub mod agent;
pub mod api;
pub mod config;
pub mod error;
pub mod fleet;
pub mod lease;
pub mod node;
pub mod orchestrator;
pub mod shutdown;
