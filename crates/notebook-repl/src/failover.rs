//! Failover bookkeeping for a replica pronounced dead.
//!
//! Whether a node is dead is decided outside the orchestrator; this module only
//! cleans up after that decision. Cleanup is best-effort: task stops that fail
//! are logged and reported, and never stop the node from leaving the topology.

use crate::node::NodeUrl;
use crate::status::StatusAggregator;
use crate::task::TaskWriter;
use crate::topology::TopologyManager;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// What a failover run did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailoverReport {
    /// The node that was failed over.
    pub node: String,
    /// The removal step finished; the node is no longer an active replica.
    pub completed: bool,
    /// The node was in the active replica set before this run.
    pub was_active: bool,
    /// Task id to whether stopping it succeeded.
    pub stopped: BTreeMap<String, bool>,
    /// Status could not be read, so no tasks were stopped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_error: Option<String>,
}

/// Stops tasks touching a failed node and drops it from the replica set.
pub struct FailoverCoordinator {
    status: Arc<StatusAggregator>,
    writer: Arc<TaskWriter>,
    topology: Arc<TopologyManager>,
}

impl FailoverCoordinator {
    /// Create a coordinator.
    pub fn new(
        status: Arc<StatusAggregator>,
        writer: Arc<TaskWriter>,
        topology: Arc<TopologyManager>,
    ) -> Self {
        Self {
            status,
            writer,
            topology,
        }
    }

    /// Fail `failed` over for `db_name`.
    ///
    /// Does not set replication up again for the remaining replicas.
    pub async fn failover(&self, failed: &NodeUrl, db_name: &str) -> FailoverReport {
        warn!("Performing failover for failed node: {}", failed);

        let mut report = FailoverReport {
            node: failed.to_string(),
            completed: false,
            was_active: false,
            stopped: BTreeMap::new(),
            status_error: None,
        };

        match self.status.get_status(Some(db_name)).await {
            Ok(tasks) => {
                for (task_id, record) in tasks.iter().filter(|(_, r)| r.references(failed)) {
                    let stopped = match self.writer.stop_task(task_id).await {
                        Ok(stopped) => {
                            info!("Stopped replication involving failed node: {}", task_id);
                            stopped
                        }
                        Err(e) => {
                            error!(
                                "Failed to stop replication {} ({} -> {}): {}",
                                task_id, record.source, record.target, e
                            );
                            false
                        }
                    };
                    report.stopped.insert(task_id.clone(), stopped);
                }
            }
            Err(e) => {
                error!("Failover for {} could not read replication status: {}", failed, e);
                report.status_error = Some(e.to_string());
            }
        }

        if failed == self.topology.primary() {
            error!("Failed node {} is the primary and cannot be removed", failed);
            return report;
        }

        report.was_active = self.topology.remove_replica(failed).await;
        report.completed = true;
        if report.was_active {
            info!("Removed failed node from active servers: {}", failed);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryStore, StoreCall};
    use crate::node::Credentials;
    use serde_json::json;

    fn primary() -> NodeUrl {
        NodeUrl::parse("http://primary:5984/").unwrap()
    }

    fn replica(n: u32) -> NodeUrl {
        NodeUrl::parse(&format!("http://replica{}:5984/", n)).unwrap()
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        topology: Arc<TopologyManager>,
        coordinator: FailoverCoordinator,
    }

    fn fixture(replicas: Vec<NodeUrl>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let writer = Arc::new(TaskWriter::new(
            store.clone(),
            primary(),
            "_replicator".to_string(),
            Credentials::new("admin", "password"),
            None,
        ));
        let status = Arc::new(StatusAggregator::new(
            store.clone(),
            primary(),
            "_replicator".to_string(),
        ));
        let topology = Arc::new(TopologyManager::new(
            store.clone(),
            writer.clone(),
            primary(),
            replicas,
            true,
            4,
        ));
        let coordinator = FailoverCoordinator::new(status, writer, topology.clone());
        Fixture {
            store,
            topology,
            coordinator,
        }
    }

    #[tokio::test]
    async fn test_failover_stops_tasks_and_removes_node() {
        let f = fixture(vec![replica(1), replica(2)]);
        f.topology.setup_replication("orders", true).await;
        assert_eq!(f.store.document_ids(&primary(), "_replicator").len(), 4);

        let report = f.coordinator.failover(&replica(1), "orders").await;
        assert!(report.completed);
        assert!(report.was_active);
        assert_eq!(report.stopped.len(), 2);
        assert!(report.stopped.values().all(|ok| *ok));

        let remaining = f.store.document_ids(&primary(), "_replicator");
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|id| id.contains(&replica(2).slug())));
        assert_eq!(f.topology.active_replicas().await, vec![replica(2)]);
    }

    #[tokio::test]
    async fn test_failed_stops_do_not_block_removal() {
        let f = fixture(vec![replica(1), replica(2)]);
        f.topology.setup_replication("orders", true).await;
        f.store.fail_deletes(true);

        let report = f.coordinator.failover(&replica(1), "orders").await;
        assert!(report.completed);
        assert!(report.stopped.values().all(|ok| !*ok));

        f.store.clear_calls();
        f.topology.setup_replication("orders", true).await;
        assert!(f.store.calls_to(&replica(1)).is_empty());
        assert!(!f.store.calls_to(&replica(2)).is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_status_still_removes_node() {
        let f = fixture(vec![replica(1)]);
        f.store.set_down(&primary(), true);

        let report = f.coordinator.failover(&replica(1), "orders").await;
        assert!(report.completed);
        assert!(report.status_error.is_some());
        assert!(f.topology.active_replicas().await.is_empty());
    }

    #[tokio::test]
    async fn test_only_matching_database_tasks_stopped() {
        let f = fixture(vec![replica(1)]);
        f.topology.setup_replication("orders", true).await;
        f.topology.setup_replication("pdfs", true).await;

        let report = f.coordinator.failover(&replica(1), "orders").await;
        assert_eq!(report.stopped.len(), 2);
        let remaining = f.store.document_ids(&primary(), "_replicator");
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|id| id.ends_with("pdfs")));
    }

    #[tokio::test]
    async fn test_unrelated_tasks_untouched() {
        let f = fixture(vec![replica(1)]);
        f.store.seed_document(
            &primary(),
            "_replicator",
            "manual_orders",
            json!({
                "source": {"url": "http://other:5984/orders"},
                "target": {"url": "http://primary:5984/orders"}
            }),
        );

        let report = f.coordinator.failover(&replica(1), "orders").await;
        assert!(report.stopped.is_empty());
        assert!(!f
            .store
            .calls()
            .iter()
            .any(|c| matches!(c, StoreCall::DeleteDocument(..))));
    }

    #[tokio::test]
    async fn test_primary_is_never_removed() {
        let f = fixture(vec![replica(1)]);
        let report = f.coordinator.failover(&primary(), "orders").await;
        assert!(!report.completed);
        assert_eq!(f.topology.active_replicas().await, vec![replica(1)]);
    }

    #[tokio::test]
    async fn test_unknown_node_completes_without_change() {
        let f = fixture(vec![replica(1)]);
        let report = f.coordinator.failover(&replica(9), "orders").await;
        assert!(report.completed);
        assert!(!report.was_active);
        assert_eq!(f.topology.active_replicas().await, vec![replica(1)]);
    }
}
