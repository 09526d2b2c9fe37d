//! Composition of the replication components behind one handle.

use crate::config::ReplicationConfig;
use crate::error::Result;
use crate::failover::{FailoverCoordinator, FailoverReport};
use crate::health::{HealthChecker, HealthRecord};
use crate::node::NodeUrl;
use crate::status::{StatusAggregator, StatusRecord};
use crate::store::{CouchClient, DocumentStore};
use crate::sync::SyncTrigger;
use crate::task::TaskWriter;
use crate::topology::{DatabaseHandle, NodeResults, TopologyManager};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Public entry point of the orchestrator.
///
/// Built once by the service from an explicit [`ReplicationConfig`] and shared
/// behind an `Arc`; all operations take `&self`.
pub struct ReplicationOrchestrator {
    config: ReplicationConfig,
    writer: Arc<TaskWriter>,
    status: Arc<StatusAggregator>,
    topology: Arc<TopologyManager>,
    health: HealthChecker,
    failover: FailoverCoordinator,
    sync: SyncTrigger,
}

impl ReplicationOrchestrator {
    /// Wire every component to `store`.
    pub fn new(config: ReplicationConfig, store: Arc<dyn DocumentStore>) -> Self {
        let writer = Arc::new(TaskWriter::new(
            store.clone(),
            config.primary.clone(),
            config.control_database.clone(),
            config.credentials.clone(),
            config.filter.clone(),
        ));
        let status = Arc::new(StatusAggregator::new(
            store.clone(),
            config.primary.clone(),
            config.control_database.clone(),
        ));
        let topology = Arc::new(TopologyManager::new(
            store.clone(),
            writer.clone(),
            config.primary.clone(),
            config.replicas.clone(),
            config.continuous,
            config.max_concurrency,
        ));
        let health = HealthChecker::new(store, config.health_timeout, config.max_concurrency);
        let failover = FailoverCoordinator::new(status.clone(), writer.clone(), topology.clone());
        let sync = SyncTrigger::new(
            writer.clone(),
            status.clone(),
            topology.clone(),
            config.sync_poll_interval,
            config.max_concurrency,
        );

        Self {
            config,
            writer,
            status,
            topology,
            health,
            failover,
            sync,
        }
    }

    /// Build an orchestrator talking to real nodes over HTTP.
    pub fn connect(config: ReplicationConfig) -> Result<Self> {
        let request_timeout = config.health_timeout.max(Duration::from_secs(30));
        let client = CouchClient::new(config.credentials.clone(), request_timeout)?;
        Ok(Self::new(config, Arc::new(client)))
    }

    /// The configuration this orchestrator was built with.
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// True when replicas were configured at startup.
    pub fn replication_enabled(&self) -> bool {
        self.config.replication_enabled()
    }

    /// Replicas still taking part in replication.
    pub async fn active_replicas(&self) -> Vec<NodeUrl> {
        self.topology.active_replicas().await
    }

    /// See [`TopologyManager::ensure_database`].
    pub async fn ensure_database(&self, db_name: &str) -> Result<DatabaseHandle> {
        self.topology.ensure_database(db_name).await
    }

    /// See [`TopologyManager::setup_replication`].
    pub async fn setup_replication(&self, db_name: &str, bidirectional: bool) -> NodeResults {
        self.topology.setup_replication(db_name, bidirectional).await
    }

    /// See [`StatusAggregator::get_status`].
    pub async fn get_status(
        &self,
        db_name: Option<&str>,
    ) -> Result<BTreeMap<String, StatusRecord>> {
        self.status.get_status(db_name).await
    }

    /// Health of a single node.
    pub async fn check_health(&self, node: &NodeUrl) -> HealthRecord {
        self.health.check_health(node).await
    }

    /// Health of the primary and every active replica.
    pub async fn check_all_nodes(&self) -> BTreeMap<String, HealthRecord> {
        let mut nodes = vec![self.config.primary.clone()];
        nodes.extend(self.topology.active_replicas().await);
        self.health.check_nodes(&nodes).await
    }

    /// See [`FailoverCoordinator::failover`].
    pub async fn failover(&self, failed: &NodeUrl, db_name: &str) -> FailoverReport {
        self.failover.failover(failed, db_name).await
    }

    /// See [`SyncTrigger::sync_now`].
    pub async fn sync_now(
        &self,
        db_name: &str,
        wait: bool,
        cancel: &CancellationToken,
    ) -> NodeResults {
        self.sync.sync_now(db_name, wait, cancel).await
    }

    /// Delete one task; `false` when it did not exist.
    pub async fn stop_task(&self, task_id: &str) -> Result<bool> {
        self.writer.stop_task(task_id).await
    }

    /// Stop every task, or every task whose id contains `db_name`.
    pub async fn stop_all(&self, db_name: Option<&str>) -> Result<BTreeMap<String, bool>> {
        let status = self.status.get_status(db_name).await?;
        let mut results = BTreeMap::new();
        for task_id in status.into_keys() {
            let stopped = match self.writer.stop_task(&task_id).await {
                Ok(stopped) => stopped,
                Err(e) => {
                    error!("Failed to stop replication {}: {}", task_id, e);
                    false
                }
            };
            results.insert(task_id, stopped);
        }
        Ok(results)
    }

    /// Set replication up for each of `databases`, as done at service startup.
    /// Failures are logged and never abort the remaining databases.
    pub async fn initialize(&self, databases: &[String]) {
        if !self.replication_enabled() {
            info!("Running in single-node mode (no replication nodes configured)");
            return;
        }
        info!(
            "Replication enabled with {} nodes",
            self.config.replicas.len()
        );
        for db_name in databases {
            let results = self.setup_replication(db_name, true).await;
            if results.all_succeeded() {
                info!("Replication setup completed for database: {}", db_name);
            } else {
                error!(
                    "Replication setup for {} incomplete: {:?}",
                    db_name,
                    results.to_bool_map()
                );
            }
        }
    }
}
