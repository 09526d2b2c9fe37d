#![warn(missing_docs)]

//! `nb-mgmt` binary entry point.

use anyhow::Result;
use clap::Parser;
use notebook_mgmt::cli::{Cli, Command};
use notebook_mgmt::{ReplicationApi, ServiceConfig};
use notebook_repl::ReplicationOrchestrator;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Serve { config } => serve(config.clone()).await,
        _ => cli.run().await,
    }
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting NoteBook replication service");

    let config = ServiceConfig::load(config_path.as_deref())?;
    let orchestrator = Arc::new(ReplicationOrchestrator::connect(config.replication_config()?)?);
    orchestrator.initialize(&config.core_databases).await;

    let api = ReplicationApi::new(orchestrator, Arc::new(config));
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.serve().await {
            tracing::error!("API serve error: {}", e);
        }
    });

    tokio::select! {
        _ = api_handle => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}
