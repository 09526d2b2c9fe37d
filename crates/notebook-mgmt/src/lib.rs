#![warn(missing_docs)]

//! NoteBook management subsystem: replication control-plane API, service
//! configuration, cluster monitor CLI

pub mod api;
pub mod cli;
pub mod config;
pub mod monitor;
pub mod security;

pub use api::ReplicationApi;
pub use config::ServiceConfig;
