use crate::monitor::{
    render_database_report, render_report, render_sync, MonitorClient, UnhealthyTracker,
};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "nb-mgmt")]
#[command(about = "NoteBook replication control plane and cluster monitor", long_about = None)]
pub struct Cli {
    #[arg(short, long, default_value = "http://localhost:5000")]
    pub server: String,

    #[arg(short, long, env = "NB_ADMIN_TOKEN")]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the replication API service.
    Serve {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print one cluster health report.
    Report,
    /// Print a report every interval until interrupted.
    Watch {
        #[arg(short, long, default_value = "30")]
        interval: u64,
        /// Fail a replica over after this many consecutive unhealthy polls.
        #[arg(long)]
        auto_failover: Option<u32>,
        /// Databases whose tasks are stopped on auto-failover.
        #[arg(short, long, default_values = ["pdfs", "categories", "analytics"])]
        database: Vec<String>,
    },
    /// Show replication tasks for one database.
    Database {
        name: String,
    },
    /// Force a one-shot sync of a database to every replica.
    Sync {
        database: String,
        #[arg(short, long)]
        wait: bool,
    },
    /// Create replication tasks for a database.
    Setup {
        database: String,
        #[arg(long)]
        one_way: bool,
    },
    /// Remove a failed replica and stop its tasks for a database.
    Failover {
        node: String,
        database: String,
    },
    /// Delete a single replication task.
    Stop {
        task_id: String,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let client = MonitorClient::new(&self.server, self.token.clone());
        match self.command {
            Command::Serve { .. } => anyhow::bail!("serve is handled by the binary entry point"),
            Command::Report => {
                print!("{}", render_report(&client.snapshot().await));
                Ok(())
            }
            Command::Watch {
                interval,
                auto_failover,
                ref database,
            } => watch(&client, interval, auto_failover, database).await,
            Command::Database { ref name } => {
                let status = client.replication_status(Some(name)).await?;
                print!("{}", render_database_report(name, &status));
                Ok(())
            }
            Command::Sync { ref database, wait } => {
                println!("Forcing sync for database: {}", database);
                if wait {
                    println!("Waiting for completion...");
                }
                let result = client.sync(database, wait).await?;
                print!("{}", render_sync(&result, wait));
                if result.results.values().any(|ok| !*ok) {
                    anyhow::bail!("Sync of {} did not succeed on every node", database);
                }
                Ok(())
            }
            Command::Setup {
                ref database,
                one_way,
            } => {
                let result = client.setup(database, !one_way).await?;
                println!(
                    "Replication setup for {} ({}):",
                    result.database,
                    if result.bidirectional { "bidirectional" } else { "one-way" }
                );
                for (node, ok) in &result.results {
                    println!("   {} {}", if *ok { "[OK]  " } else { "[FAIL]" }, node);
                }
                Ok(())
            }
            Command::Failover {
                ref node,
                ref database,
            } => {
                let result = client.failover(node, database).await?;
                println!("Failover of {} for {}:", result.node, result.database);
                println!("   Removed from active replicas: {}", result.removed);
                for (task_id, stopped) in &result.stopped {
                    println!("   Stopped {}: {}", task_id, stopped);
                }
                if !result.success {
                    anyhow::bail!("Failover of {} did not complete", node);
                }
                Ok(())
            }
            Command::Stop { ref task_id } => {
                let result = client.stop_task(task_id).await?;
                if result.stopped {
                    println!("Stopped replication task {}", result.task_id);
                } else {
                    println!("Replication task {} does not exist", result.task_id);
                }
                Ok(())
            }
        }
    }
}

async fn watch(
    client: &MonitorClient,
    interval: u64,
    auto_failover: Option<u32>,
    databases: &[String],
) -> Result<()> {
    println!("Starting continuous monitoring (interval: {}s)", interval);
    println!("Press Ctrl+C to stop...");

    let mut unhealthy = auto_failover.map(UnhealthyTracker::new);
    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nMonitoring stopped by user");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        let snapshot = client.snapshot().await;
        print!("{}", render_report(&snapshot));

        let (Some(tracker), Ok(health)) = (unhealthy.as_mut(), &snapshot.nodes) else {
            continue;
        };
        let primary = snapshot.info.as_ref().ok().map(|i| i.info.primary_url.as_str());
        for node in tracker.observe(&health.nodes, primary) {
            tracing::warn!("Node {} stayed unhealthy, triggering failover", node);
            for database in databases {
                match client.failover(&node, database).await {
                    Ok(result) => println!(
                        "Failover of {} for {}: removed={}, stopped {} task(s)",
                        node,
                        database,
                        result.removed,
                        result.stopped.len()
                    ),
                    Err(e) => {
                        tracing::error!("Failover of {} for {} failed: {}", node, database, e)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["nb-mgmt", "report"]);
        assert_eq!(cli.server, "http://localhost:5000");
        assert!(matches!(cli.command, Command::Report));
    }

    #[test]
    fn test_cli_with_server_and_token() {
        let cli = Cli::parse_from([
            "nb-mgmt", "--server", "http://api:8080", "--token", "s3cret", "report",
        ]);
        assert_eq!(cli.server, "http://api:8080");
        assert_eq!(cli.token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_cli_watch_defaults() {
        let cli = Cli::parse_from(["nb-mgmt", "watch"]);
        match cli.command {
            Command::Watch {
                interval,
                auto_failover,
                database,
            } => {
                assert_eq!(interval, 30);
                assert_eq!(auto_failover, None);
                assert_eq!(database, vec!["pdfs", "categories", "analytics"]);
            }
            _ => panic!("Expected Watch command"),
        }
    }

    #[test]
    fn test_cli_watch_auto_failover() {
        let cli = Cli::parse_from([
            "nb-mgmt", "watch", "--interval", "5", "--auto-failover", "3", "--database", "orders",
        ]);
        match cli.command {
            Command::Watch {
                interval,
                auto_failover,
                database,
            } => {
                assert_eq!(interval, 5);
                assert_eq!(auto_failover, Some(3));
                assert_eq!(database, vec!["orders"]);
            }
            _ => panic!("Expected Watch command"),
        }
    }

    #[test]
    fn test_cli_sync_wait() {
        let cli = Cli::parse_from(["nb-mgmt", "sync", "orders", "--wait"]);
        match cli.command {
            Command::Sync { database, wait } => {
                assert_eq!(database, "orders");
                assert!(wait);
            }
            _ => panic!("Expected Sync command"),
        }
    }

    #[test]
    fn test_cli_setup_one_way() {
        let cli = Cli::parse_from(["nb-mgmt", "setup", "pdfs", "--one-way"]);
        assert!(matches!(cli.command, Command::Setup { one_way: true, .. }));
    }

    #[test]
    fn test_cli_failover_and_stop() {
        let cli = Cli::parse_from(["nb-mgmt", "failover", "http://r1:5984/", "pdfs"]);
        match cli.command {
            Command::Failover { node, database } => {
                assert_eq!(node, "http://r1:5984/");
                assert_eq!(database, "pdfs");
            }
            _ => panic!("Expected Failover command"),
        }

        let cli = Cli::parse_from(["nb-mgmt", "stop", "primary_to_r1_pdfs"]);
        assert!(matches!(
            cli.command,
            Command::Stop { ref task_id } if task_id == "primary_to_r1_pdfs"
        ));
    }

    #[test]
    fn test_cli_serve_config() {
        let cli = Cli::parse_from(["nb-mgmt", "serve", "--config", "/etc/notebook/mgmt.toml"]);
        match cli.command {
            Command::Serve { config } => {
                assert_eq!(config, Some(PathBuf::from("/etc/notebook/mgmt.toml")));
            }
            _ => panic!("Expected Serve command"),
        }
    }
}
