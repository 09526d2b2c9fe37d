//! Primary/replica topology and per-database replication setup.

use crate::error::{ReplError, Result};
use crate::node::NodeUrl;
use crate::store::DocumentStore;
use crate::task::{task_id, TaskPurpose, TaskWriter};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// A logical database resolved to its physical location on the primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseHandle {
    /// Logical database name.
    pub name: String,
    /// Node holding the database.
    pub node: NodeUrl,
    /// Full database URL.
    pub url: String,
    /// True when this call created the database.
    pub created: bool,
}

/// Outcome of a fan-out operation, one entry per node in configured order.
///
/// Failures stay attached to their node instead of collapsing into a single
/// pass/fail, so callers decide whether partial success is acceptable.
#[derive(Debug, Default)]
pub struct NodeResults {
    entries: Vec<(NodeUrl, Result<()>)>,
}

impl NodeResults {
    /// Record the outcome for `node`.
    pub fn push(&mut self, node: NodeUrl, outcome: Result<()>) {
        self.entries.push((node, outcome));
    }

    /// Outcome for `node`, if it was processed.
    pub fn get(&self, node: &NodeUrl) -> Option<&Result<()>> {
        self.entries.iter().find(|(n, _)| n == node).map(|(_, r)| r)
    }

    /// Whether `node` was processed and succeeded.
    pub fn succeeded(&self, node: &NodeUrl) -> bool {
        matches!(self.get(node), Some(Ok(())))
    }

    /// All entries in processing order.
    pub fn iter(&self) -> impl Iterator<Item = &(NodeUrl, Result<()>)> {
        self.entries.iter()
    }

    /// Number of nodes processed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no node was processed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when every processed node succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.entries.iter().all(|(_, r)| r.is_ok())
    }

    /// The wire form: node URL to success flag.
    pub fn to_bool_map(&self) -> BTreeMap<String, bool> {
        self.entries
            .iter()
            .map(|(n, r)| (n.to_string(), r.is_ok()))
            .collect()
    }
}

impl Extend<(NodeUrl, Result<()>)> for NodeResults {
    fn extend<I: IntoIterator<Item = (NodeUrl, Result<()>)>>(&mut self, iter: I) {
        self.entries.extend(iter);
    }
}

impl FromIterator<(NodeUrl, Result<()>)> for NodeResults {
    fn from_iter<I: IntoIterator<Item = (NodeUrl, Result<()>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Owns the primary, the active replica set, and per-database task layout.
pub struct TopologyManager {
    store: Arc<dyn DocumentStore>,
    writer: Arc<TaskWriter>,
    primary: NodeUrl,
    replicas: RwLock<Vec<NodeUrl>>,
    continuous: bool,
    max_concurrency: usize,
}

impl TopologyManager {
    /// Create a manager over an already normalized replica list.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        writer: Arc<TaskWriter>,
        primary: NodeUrl,
        replicas: Vec<NodeUrl>,
        continuous: bool,
        max_concurrency: usize,
    ) -> Self {
        Self {
            store,
            writer,
            primary,
            replicas: RwLock::new(replicas),
            continuous,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// The primary node.
    pub fn primary(&self) -> &NodeUrl {
        &self.primary
    }

    /// Snapshot of the active replicas in configured order.
    pub async fn active_replicas(&self) -> Vec<NodeUrl> {
        self.replicas.read().await.clone()
    }

    /// Drop `node` from the active replica set. Returns whether it was present.
    pub async fn remove_replica(&self, node: &NodeUrl) -> bool {
        let mut replicas = self.replicas.write().await;
        let before = replicas.len();
        replicas.retain(|n| n != node);
        before != replicas.len()
    }

    /// Resolve `db_name` on the primary, creating it when absent.
    ///
    /// The first time a database is created while replicas are configured,
    /// bidirectional replication is set up before returning. Setup failures are
    /// logged per node and never keep the caller from its handle.
    pub async fn ensure_database(&self, db_name: &str) -> Result<DatabaseHandle> {
        if db_name.trim().is_empty() {
            return Err(ReplError::Configuration("database name is required".to_string()));
        }

        let existed = self.store.database_exists(&self.primary, db_name).await?;
        if !existed {
            self.store.create_database(&self.primary, db_name).await?;
            info!("Created database '{}' on primary {}", db_name, self.primary);
        }

        let handle = DatabaseHandle {
            name: db_name.to_string(),
            node: self.primary.clone(),
            url: self.primary.database_url(db_name),
            created: !existed,
        };

        if existed || self.replicas.read().await.is_empty() {
            return Ok(handle);
        }

        info!("Setting up replication for new database: {}", db_name);
        let results = self.setup_replication(db_name, true).await;
        for (node, outcome) in results.iter() {
            if let Err(e) = outcome {
                warn!(
                    "Replication setup for new database '{}' failed on {}: {}",
                    db_name, node, e
                );
            }
        }
        Ok(handle)
    }

    /// Create the database on every active replica and upsert the continuous
    /// tasks linking it to the primary.
    ///
    /// A replica whose database cannot be created gets no tasks. Every replica
    /// is processed regardless of the others.
    pub async fn setup_replication(&self, db_name: &str, bidirectional: bool) -> NodeResults {
        let replicas = self.active_replicas().await;
        if replicas.is_empty() {
            warn!("Replication not configured - no replication nodes specified");
            return NodeResults::default();
        }

        stream::iter(replicas)
            .map(|node| async move {
                let outcome = self.setup_node(&node, db_name, bidirectional).await;
                match &outcome {
                    Ok(()) => info!(
                        "Replication setup complete for '{}' with node: {}",
                        db_name, node
                    ),
                    Err(e) => warn!(
                        "Failed to setup replication for '{}' with {}: {}",
                        db_name, node, e
                    ),
                }
                (node, outcome)
            })
            .buffered(self.max_concurrency)
            .collect()
            .await
    }

    async fn setup_node(&self, node: &NodeUrl, db_name: &str, bidirectional: bool) -> Result<()> {
        if !self.store.database_exists(node, db_name).await? {
            self.store.create_database(node, db_name).await?;
            info!("Created database '{}' on node: {}", db_name, node);
        }

        self.writer
            .upsert_task(
                &self.primary,
                node,
                db_name,
                &task_id(TaskPurpose::PrimaryToReplica, node, db_name),
                self.continuous,
            )
            .await?;

        if bidirectional {
            self.writer
                .upsert_task(
                    node,
                    &self.primary,
                    db_name,
                    &task_id(TaskPurpose::ReplicaToPrimary, node, db_name),
                    self.continuous,
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryStore, StoreCall};
    use crate::node::Credentials;

    fn primary() -> NodeUrl {
        NodeUrl::parse("http://primary:5984/").unwrap()
    }

    fn replica(n: u32) -> NodeUrl {
        NodeUrl::parse(&format!("http://replica{}:5984/", n)).unwrap()
    }

    fn manager(store: Arc<MemoryStore>, replicas: Vec<NodeUrl>) -> TopologyManager {
        let writer = Arc::new(TaskWriter::new(
            store.clone(),
            primary(),
            "_replicator".to_string(),
            Credentials::new("admin", "password"),
            None,
        ));
        TopologyManager::new(store, writer, primary(), replicas, true, 4)
    }

    fn puts(store: &MemoryStore) -> usize {
        store
            .calls()
            .iter()
            .filter(|c| matches!(c, StoreCall::PutDocument(..)))
            .count()
    }

    #[tokio::test]
    async fn test_single_node_mode_creates_on_primary_only() {
        let store = Arc::new(MemoryStore::new());
        let topo = manager(store.clone(), vec![]);

        let handle = topo.ensure_database("foo").await.unwrap();
        assert_eq!(handle.node, primary());
        assert_eq!(handle.url, "http://primary:5984/foo");
        assert!(handle.created);
        assert!(store.has_database(&primary(), "foo"));
        assert_eq!(puts(&store), 0);
        assert!(store.calls().iter().all(|c| c.node() == &primary()));
    }

    #[tokio::test]
    async fn test_first_touch_sets_up_replication() {
        let store = Arc::new(MemoryStore::new());
        let topo = manager(store.clone(), vec![replica(1)]);

        let handle = topo.ensure_database("pdfs").await.unwrap();
        assert!(handle.created);
        assert!(store.has_database(&replica(1), "pdfs"));
        assert_eq!(store.document_ids(&primary(), "_replicator").len(), 2);
    }

    #[tokio::test]
    async fn test_existing_database_skips_setup() {
        let store = Arc::new(MemoryStore::new());
        store.seed_database(&primary(), "pdfs");
        let topo = manager(store.clone(), vec![replica(1)]);

        let handle = topo.ensure_database("pdfs").await.unwrap();
        assert!(!handle.created);
        assert_eq!(puts(&store), 0);
        assert!(store.calls_to(&replica(1)).is_empty());
    }

    #[tokio::test]
    async fn test_failed_setup_still_returns_handle() {
        let store = Arc::new(MemoryStore::new());
        store.set_down(&replica(1), true);
        let topo = manager(store.clone(), vec![replica(1)]);

        let handle = topo.ensure_database("pdfs").await.unwrap();
        assert_eq!(handle.name, "pdfs");
        assert!(store.has_database(&primary(), "pdfs"));
    }

    #[tokio::test]
    async fn test_unreachable_primary_fails_ensure() {
        let store = Arc::new(MemoryStore::new());
        store.set_down(&primary(), true);
        let topo = manager(store, vec![]);
        let err = topo.ensure_database("pdfs").await.unwrap_err();
        assert!(matches!(err, ReplError::Connectivity { .. }));
    }

    #[tokio::test]
    async fn test_empty_name_is_configuration_error() {
        let store = Arc::new(MemoryStore::new());
        let topo = manager(store, vec![]);
        assert!(topo.ensure_database("  ").await.unwrap_err().is_configuration());
    }

    #[tokio::test]
    async fn test_two_replicas_bidirectional_four_upserts() {
        let store = Arc::new(MemoryStore::new());
        store.seed_database(&primary(), "orders");
        let topo = manager(store.clone(), vec![replica(1), replica(2)]);

        let results = topo.setup_replication("orders", true).await;
        assert_eq!(puts(&store), 4);
        let map = results.to_bool_map();
        assert_eq!(map.len(), 2);
        assert!(map.values().all(|ok| *ok));
    }

    #[tokio::test]
    async fn test_one_way_creates_only_outbound_tasks() {
        let store = Arc::new(MemoryStore::new());
        let topo = manager(store.clone(), vec![replica(1), replica(2)]);

        let results = topo.setup_replication("orders", false).await;
        assert!(results.all_succeeded());
        let ids = store.document_ids(&primary(), "_replicator");
        assert_eq!(ids.len(), 2);
        assert!(ids.iter().all(|id| id.starts_with("primary_to_")));
    }

    #[tokio::test]
    async fn test_setup_twice_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let topo = manager(store.clone(), vec![replica(1), replica(2)]);

        topo.setup_replication("orders", true).await;
        let first_ids = store.document_ids(&primary(), "_replicator");
        let first_rev =
            store.document(&primary(), "_replicator", &first_ids[0]).unwrap()["_rev"].clone();

        let second = topo.setup_replication("orders", true).await;
        let second_ids = store.document_ids(&primary(), "_replicator");
        let second_rev =
            store.document(&primary(), "_replicator", &second_ids[0]).unwrap()["_rev"].clone();

        assert!(second.all_succeeded());
        assert_eq!(first_ids, second_ids);
        assert_eq!(second_ids.len(), 4);
        assert_ne!(first_rev, second_rev);
    }

    #[tokio::test]
    async fn test_database_creation_failure_skips_node_tasks() {
        let store = Arc::new(MemoryStore::new());
        store.fail_database_creation(&replica(1));
        let topo = manager(store.clone(), vec![replica(1), replica(2)]);

        let results = topo.setup_replication("orders", true).await;
        assert!(!results.succeeded(&replica(1)));
        assert!(results.succeeded(&replica(2)));
        let ids = store.document_ids(&primary(), "_replicator");
        assert_eq!(ids.len(), 2);
        assert!(ids.iter().all(|id| id.contains(&replica(2).slug())));
    }

    #[tokio::test]
    async fn test_results_keep_configured_order() {
        let store = Arc::new(MemoryStore::new());
        store.set_delay(&replica(1), std::time::Duration::from_millis(30));
        let topo = manager(store, vec![replica(1), replica(2), replica(3)]);

        let results = topo.setup_replication("orders", true).await;
        let order: Vec<&NodeUrl> = results.iter().map(|(n, _)| n).collect();
        assert_eq!(order, vec![&replica(1), &replica(2), &replica(3)]);
    }

    #[tokio::test]
    async fn test_remove_replica() {
        let store = Arc::new(MemoryStore::new());
        let topo = manager(store, vec![replica(1), replica(2)]);
        assert!(topo.remove_replica(&replica(1)).await);
        assert!(!topo.remove_replica(&replica(1)).await);
        assert_eq!(topo.active_replicas().await, vec![replica(2)]);
    }

    #[tokio::test]
    async fn test_no_replicas_setup_is_empty() {
        let store = Arc::new(MemoryStore::new());
        let topo = manager(store.clone(), vec![]);
        let results = topo.setup_replication("orders", true).await;
        assert!(results.is_empty());
        assert!(store.calls().is_empty());
    }
}
