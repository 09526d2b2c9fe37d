//! Status aggregation over the control database.
//!
//! The store's replicator annotates task documents with `_replication_state`,
//! `_replication_state_time` and `_replication_stats`. Those fields are relayed
//! as-is; counters that were never reported stay absent instead of reading
//! as zero.

use crate::error::{ReplError, Result};
use crate::node::NodeUrl;
use crate::store::DocumentStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Placeholder for fields the store has not filled in.
pub const UNKNOWN: &str = "unknown";

/// Normalized view of one replication task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Replicator state, `unknown` when not yet reported.
    pub state: String,
    /// Source database URL.
    pub source: String,
    /// Target database URL.
    pub target: String,
    /// Continuous flag of the task.
    pub continuous: bool,
    /// Time of the last state change as reported by the store.
    pub last_updated: String,
    /// Documents read from the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs_read: Option<u64>,
    /// Documents written to the target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs_written: Option<u64>,
    /// Documents that failed to write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_write_failures: Option<u64>,
    /// Revisions compared against the target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revisions_checked: Option<u64>,
}

impl StatusRecord {
    /// Build a record from a raw task document.
    pub fn from_document(doc: &Value) -> Self {
        let text = |v: Option<&Value>| v.and_then(Value::as_str).unwrap_or(UNKNOWN).to_string();
        let endpoint = |side: &str| {
            let v = doc.get(side);
            // Older task documents store the endpoint as a bare URL string.
            match v {
                Some(Value::String(url)) => url.clone(),
                other => text(other.and_then(|e| e.get("url"))),
            }
        };
        let stats = doc.get("_replication_stats");
        let counter = |name: &str| stats.and_then(|s| s.get(name)).and_then(Value::as_u64);

        Self {
            state: text(doc.get("_replication_state")),
            source: endpoint("source"),
            target: endpoint("target"),
            continuous: doc
                .get("continuous")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            last_updated: text(doc.get("_replication_state_time")),
            docs_read: counter("docs_read"),
            docs_written: counter("docs_written"),
            doc_write_failures: counter("doc_write_failures"),
            revisions_checked: counter("revisions_checked"),
        }
    }

    /// Current state as a typed value.
    pub fn task_state(&self) -> TaskState {
        TaskState::parse(&self.state)
    }

    /// True when `node` is the source or the target of this task.
    pub fn references(&self, node: &NodeUrl) -> bool {
        node.owns_url(&self.source) || node.owns_url(&self.target)
    }
}

/// Replicator states the orchestrator reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Queued, not yet started.
    Pending,
    /// Actively replicating.
    Running,
    /// One-shot task finished.
    Completed,
    /// Task hit an error.
    Error,
    /// Task failed permanently.
    Failed,
    /// Anything else, including not yet reported.
    Other(String),
}

impl TaskState {
    /// Parse the replicator's state string.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "pending" => TaskState::Pending,
            "running" => TaskState::Running,
            "completed" => TaskState::Completed,
            "error" => TaskState::Error,
            "failed" => TaskState::Failed,
            other => TaskState::Other(other.to_string()),
        }
    }

    /// No further transitions are expected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Error | TaskState::Failed)
    }
}

/// Reads task documents and turns them into [`StatusRecord`]s.
pub struct StatusAggregator {
    store: Arc<dyn DocumentStore>,
    primary: NodeUrl,
    control_db: String,
}

impl StatusAggregator {
    /// Create an aggregator over `control_db` on `primary`.
    pub fn new(store: Arc<dyn DocumentStore>, primary: NodeUrl, control_db: String) -> Self {
        Self {
            store,
            primary,
            control_db,
        }
    }

    /// Status of every task, or of tasks whose id contains `db_name`.
    ///
    /// The filter is a substring match on the task id, so `pdf` also matches
    /// tasks of `pdfs_archive`. A missing control database reads as no tasks.
    pub async fn get_status(
        &self,
        db_name: Option<&str>,
    ) -> Result<BTreeMap<String, StatusRecord>> {
        let docs = match self
            .store
            .list_documents(&self.primary, &self.control_db)
            .await
        {
            Ok(docs) => docs,
            Err(ReplError::NotFound { .. }) => {
                debug!("Control database {} does not exist yet", self.control_db);
                return Ok(BTreeMap::new());
            }
            Err(e) => return Err(e),
        };

        let mut status = BTreeMap::new();
        for doc in docs {
            let Some(id) = doc.get("_id").and_then(Value::as_str) else {
                continue;
            };
            if id.starts_with('_') {
                continue;
            }
            if let Some(name) = db_name {
                if !id.contains(name) {
                    continue;
                }
            }
            status.insert(id.to_string(), StatusRecord::from_document(&doc));
        }
        Ok(status)
    }

    /// Status of a single task, `None` when it does not exist.
    pub async fn task_status(&self, task_id: &str) -> Result<Option<StatusRecord>> {
        let doc = self
            .store
            .get_document(&self.primary, &self.control_db, task_id)
            .await?;
        Ok(doc.as_ref().map(StatusRecord::from_document))
    }
}
