//! In-process [`DocumentStore`] used by tests and local development.
//!
//! Mimics the parts of the CouchDB contract the orchestrator relies on:
//! revision-checked writes, idempotent database creation and `_`-prefixed
//! system documents. Nodes can be taken down, slowed, or made to fail
//! specific calls, and every call is recorded.

use crate::error::{ReplError, Result};
use crate::node::NodeUrl;
use crate::store::{DocumentStore, ServerInfo};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A store call as observed by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    /// `server_info(node)`
    ServerInfo(NodeUrl),
    /// `database_exists(node, db)`
    DatabaseExists(NodeUrl, String),
    /// `create_database(node, db)`
    CreateDatabase(NodeUrl, String),
    /// `get_document(node, db, id)`
    GetDocument(NodeUrl, String, String),
    /// `put_document(node, db, id)`
    PutDocument(NodeUrl, String, String),
    /// `delete_document(node, db, id)`
    DeleteDocument(NodeUrl, String, String),
    /// `list_documents(node, db)`
    ListDocuments(NodeUrl, String),
}

impl StoreCall {
    /// The node the call was addressed to.
    pub fn node(&self) -> &NodeUrl {
        match self {
            StoreCall::ServerInfo(n)
            | StoreCall::DatabaseExists(n, _)
            | StoreCall::CreateDatabase(n, _)
            | StoreCall::GetDocument(n, _, _)
            | StoreCall::PutDocument(n, _, _)
            | StoreCall::DeleteDocument(n, _, _)
            | StoreCall::ListDocuments(n, _) => n,
        }
    }
}

#[derive(Default)]
struct StoredDoc {
    body: Value,
    generation: u64,
}

#[derive(Default)]
struct NodeState {
    databases: HashMap<String, BTreeMap<String, StoredDoc>>,
    version: Option<String>,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<NodeUrl, NodeState>,
    down: HashSet<NodeUrl>,
    delays: HashMap<NodeUrl, Duration>,
    failing_creates: HashSet<NodeUrl>,
    failing_deletes: bool,
    raced_reads: HashSet<String>,
    state_scripts: Vec<(String, VecDeque<String>)>,
    calls: Vec<StoreCall>,
}

/// Thread-safe in-memory document store spanning any number of nodes.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// An empty store; nodes come into existence on first use.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every call to `node` fail with a connectivity error.
    pub fn set_down(&self, node: &NodeUrl, down: bool) {
        let mut inner = self.lock();
        if down {
            inner.down.insert(node.clone());
        } else {
            inner.down.remove(node);
        }
    }

    /// Delay every call to `node` by `delay`.
    pub fn set_delay(&self, node: &NodeUrl, delay: Duration) {
        self.lock().delays.insert(node.clone(), delay);
    }

    /// Make database creation on `node` fail.
    pub fn fail_database_creation(&self, node: &NodeUrl) {
        self.lock().failing_creates.insert(node.clone());
    }

    /// Make every document deletion fail with a store error.
    pub fn fail_deletes(&self, fail: bool) {
        self.lock().failing_deletes = fail;
    }

    /// Simulate a concurrent writer: the next read of document `id` returns
    /// its current body, then the stored copy moves on to a new revision.
    pub fn race_next_read(&self, id: &str) {
        self.lock().raced_reads.insert(id.to_string());
    }

    /// Set the version reported by `node`.
    pub fn set_version(&self, node: &NodeUrl, version: &str) {
        self.lock().nodes.entry(node.clone()).or_default().version = Some(version.to_string());
    }

    /// Script the replication state seen by successive reads of any task whose
    /// id starts with `id_prefix`. Each read of an existing matching document
    /// consumes the next state; the last state sticks.
    pub fn script_states(&self, id_prefix: &str, states: &[&str]) {
        let states = states.iter().map(|s| s.to_string()).collect();
        self.lock().state_scripts.push((id_prefix.to_string(), states));
    }

    /// Create a database directly, bypassing call recording.
    pub fn seed_database(&self, node: &NodeUrl, db: &str) {
        self.lock()
            .nodes
            .entry(node.clone())
            .or_default()
            .databases
            .entry(db.to_string())
            .or_default();
    }

    /// Insert a document directly, bypassing revision checks and recording.
    pub fn seed_document(&self, node: &NodeUrl, db: &str, id: &str, mut body: Value) {
        let mut inner = self.lock();
        let docs = inner
            .nodes
            .entry(node.clone())
            .or_default()
            .databases
            .entry(db.to_string())
            .or_default();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("_id".to_string(), Value::String(id.to_string()));
            obj.insert("_rev".to_string(), Value::String(format!("1-{}", id.len())));
        }
        docs.insert(id.to_string(), StoredDoc { body, generation: 1 });
    }

    /// Read a stored document without recording a call.
    pub fn document(&self, node: &NodeUrl, db: &str, id: &str) -> Option<Value> {
        self.lock()
            .nodes
            .get(node)
            .and_then(|n| n.databases.get(db))
            .and_then(|docs| docs.get(id))
            .map(|d| d.body.clone())
    }

    /// Ids of every document in a database, sorted.
    pub fn document_ids(&self, node: &NodeUrl, db: &str) -> Vec<String> {
        self.lock()
            .nodes
            .get(node)
            .and_then(|n| n.databases.get(db))
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a database exists, without recording a call.
    pub fn has_database(&self, node: &NodeUrl, db: &str) -> bool {
        self.lock()
            .nodes
            .get(node)
            .map(|n| n.databases.contains_key(db))
            .unwrap_or(false)
    }

    /// Every call observed so far.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    /// Calls addressed to `node`.
    pub fn calls_to(&self, node: &NodeUrl) -> Vec<StoreCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.node() == node)
            .cloned()
            .collect()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    async fn enter(&self, call: StoreCall) -> Result<()> {
        let node = call.node().clone();
        let delay = {
            let mut inner = self.lock();
            inner.calls.push(call);
            inner.delays.get(&node).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.lock().down.contains(&node) {
            return Err(ReplError::Connectivity {
                node: node.to_string(),
                msg: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

fn revision(generation: u64, id: &str) -> String {
    format!("{}-{:x}", generation, id.len() as u64 * 31 + generation)
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn server_info(&self, node: &NodeUrl) -> Result<ServerInfo> {
        self.enter(StoreCall::ServerInfo(node.clone())).await?;
        let version = self
            .lock()
            .nodes
            .get(node)
            .and_then(|n| n.version.clone())
            .unwrap_or_else(|| "3.3.3".to_string());
        Ok(ServerInfo {
            version,
            banner: Some("Welcome".to_string()),
        })
    }

    async fn database_exists(&self, node: &NodeUrl, db: &str) -> Result<bool> {
        self.enter(StoreCall::DatabaseExists(node.clone(), db.to_string()))
            .await?;
        Ok(self.has_database(node, db))
    }

    async fn create_database(&self, node: &NodeUrl, db: &str) -> Result<()> {
        self.enter(StoreCall::CreateDatabase(node.clone(), db.to_string()))
            .await?;
        let mut inner = self.lock();
        if inner.failing_creates.contains(node) {
            return Err(ReplError::Store {
                status: 500,
                msg: format!("cannot create {}", db),
            });
        }
        inner
            .nodes
            .entry(node.clone())
            .or_default()
            .databases
            .entry(db.to_string())
            .or_default();
        Ok(())
    }

    async fn get_document(&self, node: &NodeUrl, db: &str, id: &str) -> Result<Option<Value>> {
        self.enter(StoreCall::GetDocument(node.clone(), db.to_string(), id.to_string()))
            .await?;
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(doc) = inner
            .nodes
            .get_mut(node)
            .and_then(|n| n.databases.get_mut(db))
            .and_then(|docs| docs.get_mut(id))
        else {
            return Ok(None);
        };
        if let Some((_, states)) = inner
            .state_scripts
            .iter_mut()
            .find(|(prefix, _)| id.starts_with(prefix.as_str()))
        {
            let next = if states.len() > 1 {
                states.pop_front()
            } else {
                states.front().cloned()
            };
            if let (Some(state), Some(obj)) = (next, doc.body.as_object_mut()) {
                obj.insert("_replication_state".to_string(), Value::String(state));
            }
        }
        let body = doc.body.clone();
        if inner.raced_reads.remove(id) {
            doc.generation += 1;
            let rev = revision(doc.generation, id);
            if let Some(obj) = doc.body.as_object_mut() {
                obj.insert("_rev".to_string(), Value::String(rev));
            }
        }
        Ok(Some(body))
    }

    async fn put_document(
        &self,
        node: &NodeUrl,
        db: &str,
        id: &str,
        doc: &Value,
    ) -> Result<String> {
        self.enter(StoreCall::PutDocument(node.clone(), db.to_string(), id.to_string()))
            .await?;
        let mut inner = self.lock();
        let docs = inner
            .nodes
            .get_mut(node)
            .and_then(|n| n.databases.get_mut(db))
            .ok_or_else(|| ReplError::NotFound {
                what: db.to_string(),
            })?;
        let supplied = doc.get("_rev").and_then(Value::as_str);
        let generation = match (docs.get(id), supplied) {
            (Some(existing), Some(rev))
                if existing.body.get("_rev").and_then(Value::as_str) == Some(rev) =>
            {
                existing.generation + 1
            }
            (None, None) => 1,
            _ => {
                return Err(ReplError::WriteConflict {
                    task_id: id.to_string(),
                })
            }
        };
        let rev = revision(generation, id);
        let mut body = doc.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("_id".to_string(), Value::String(id.to_string()));
            obj.insert("_rev".to_string(), Value::String(rev.clone()));
        }
        docs.insert(id.to_string(), StoredDoc { body, generation });
        Ok(rev)
    }

    async fn delete_document(&self, node: &NodeUrl, db: &str, id: &str, rev: &str) -> Result<()> {
        self.enter(StoreCall::DeleteDocument(node.clone(), db.to_string(), id.to_string()))
            .await?;
        let mut inner = self.lock();
        if inner.failing_deletes {
            return Err(ReplError::Store {
                status: 500,
                msg: format!("cannot delete {}", id),
            });
        }
        let docs = inner
            .nodes
            .get_mut(node)
            .and_then(|n| n.databases.get_mut(db))
            .ok_or_else(|| ReplError::NotFound {
                what: db.to_string(),
            })?;
        match docs.get(id) {
            None => Err(ReplError::NotFound {
                what: format!("{}/{}", db, id),
            }),
            Some(existing) if existing.body.get("_rev").and_then(Value::as_str) != Some(rev) => {
                Err(ReplError::WriteConflict {
                    task_id: id.to_string(),
                })
            }
            Some(_) => {
                docs.remove(id);
                Ok(())
            }
        }
    }

    async fn list_documents(&self, node: &NodeUrl, db: &str) -> Result<Vec<Value>> {
        self.enter(StoreCall::ListDocuments(node.clone(), db.to_string()))
            .await?;
        let inner = self.lock();
        let docs = inner
            .nodes
            .get(node)
            .and_then(|n| n.databases.get(db))
            .ok_or_else(|| ReplError::NotFound {
                what: db.to_string(),
            })?;
        Ok(docs.values().map(|d| d.body.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node() -> NodeUrl {
        NodeUrl::parse("http://mem:5984/").unwrap()
    }

    #[tokio::test]
    async fn test_put_requires_matching_revision() {
        let store = MemoryStore::new();
        store.create_database(&node(), "_replicator").await.unwrap();

        let rev1 = store
            .put_document(&node(), "_replicator", "t", &json!({"a": 1}))
            .await
            .unwrap();
        let err = store
            .put_document(&node(), "_replicator", "t", &json!({"a": 2}))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::WriteConflict { .. }));

        let rev2 = store
            .put_document(&node(), "_replicator", "t", &json!({"a": 2, "_rev": rev1}))
            .await
            .unwrap();
        assert!(rev2.starts_with("2-"));
    }

    #[tokio::test]
    async fn test_down_node_is_unreachable() {
        let store = MemoryStore::new();
        store.set_down(&node(), true);
        let err = store.server_info(&node()).await.unwrap_err();
        assert!(matches!(err, ReplError::Connectivity { .. }));
        assert_eq!(store.calls_to(&node()).len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_states_advance_per_read() {
        let store = MemoryStore::new();
        store.seed_document(&node(), "_replicator", "sync_x_1", json!({}));
        store.script_states("sync_", &["pending", "completed"]);

        let first = store.get_document(&node(), "_replicator", "sync_x_1").await.unwrap().unwrap();
        let second = store.get_document(&node(), "_replicator", "sync_x_1").await.unwrap().unwrap();
        let third = store.get_document(&node(), "_replicator", "sync_x_1").await.unwrap().unwrap();
        assert_eq!(first["_replication_state"], "pending");
        assert_eq!(second["_replication_state"], "completed");
        assert_eq!(third["_replication_state"], "completed");
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let store = MemoryStore::new();
        store.seed_database(&node(), "_replicator");
        let err = store
            .delete_document(&node(), "_replicator", "gone", "1-a")
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::NotFound { .. }));
    }
}
