//! cuo - cluster update orchestrator.
//!
//! Builds a phased update plan for a multi-node cluster from a snapshot of
//! its topology and package metadata, and executes the plan phase by phase:
//! masters one at a time under leader election control, workers in parallel,
//! followed by an optional etcd data migration.

pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod notify;
pub mod output;
pub mod package;
pub mod plan;
pub mod snapshot;
pub mod store;
pub mod telemetry;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");
