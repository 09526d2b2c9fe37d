#![warn(missing_docs)]

//! NoteBook replication subsystem: orchestrates `_replicator` tasks between a
//! primary document store and its replicas.

pub mod config;
pub mod error;
pub mod failover;
pub mod health;
pub mod memory;
pub mod node;
pub mod orchestrator;
pub mod status;
pub mod store;
pub mod sync;
pub mod task;
pub mod topology;

pub use config::ReplicationConfig;
pub use error::{ReplError, Result};
pub use failover::FailoverReport;
pub use health::{HealthRecord, HealthStatus};
pub use node::{Credentials, NodeUrl};
pub use orchestrator::ReplicationOrchestrator;
pub use status::StatusRecord;
pub use topology::{DatabaseHandle, NodeResults};
