//! Replication-task documents and the writer that upserts them into the
//! control database on the primary.

use crate::error::{ReplError, Result};
use crate::node::{Credentials, NodeUrl};
use crate::store::DocumentStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Basic-auth block embedded in a task endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicAuth {
    /// Account name.
    pub username: String,
    /// Account password.
    pub password: String,
}

/// Authentication wrapper, `{"basic": {...}}` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointAuth {
    /// Basic credentials.
    pub basic: BasicAuth,
}

/// One side of a replication relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEndpoint {
    /// Full database URL.
    pub url: String,
    /// Credentials used by the replicator to reach `url`.
    pub auth: EndpointAuth,
}

impl TaskEndpoint {
    /// Endpoint for `db_name` on `node`.
    pub fn new(node: &NodeUrl, db_name: &str, credentials: &Credentials) -> Self {
        Self {
            url: node.database_url(db_name),
            auth: EndpointAuth {
                basic: BasicAuth {
                    username: credentials.username.clone(),
                    password: credentials.password.clone(),
                },
            },
        }
    }
}

/// A replication-task document as written to the control database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationTask {
    /// Deterministic task id.
    #[serde(rename = "_id")]
    pub id: String,
    /// Revision required for updates; absent on create.
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Where documents are read from.
    pub source: TaskEndpoint,
    /// Where documents are written to.
    pub target: TaskEndpoint,
    /// Keep replicating after catching up.
    pub continuous: bool,
    /// Create the target database when missing.
    pub create_target: bool,
    /// Retry transient failures.
    pub retry: bool,
    /// Cluster-wide filter function.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// Why a task exists; part of the id so different purposes never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPurpose {
    /// Continuous primary → replica.
    PrimaryToReplica,
    /// Continuous replica → primary.
    ReplicaToPrimary,
    /// One-shot catch-up. `seq` tells apart syncs started in the same
    /// millisecond.
    Sync {
        /// Unix time in milliseconds.
        started: i64,
        /// Per-process sequence number.
        seq: u64,
    },
}

/// Derive the task id for `replica` and `db_name`.
///
/// Ids never depend on anything but their inputs, so re-running setup for the
/// same pair upserts instead of duplicating.
pub fn task_id(purpose: TaskPurpose, replica: &NodeUrl, db_name: &str) -> String {
    match purpose {
        TaskPurpose::PrimaryToReplica => format!("primary_to_{}_{}", replica.slug(), db_name),
        TaskPurpose::ReplicaToPrimary => format!("{}_to_primary_{}", replica.slug(), db_name),
        TaskPurpose::Sync { started, seq } => {
            format!("sync_{}_{}_{}_{}", db_name, replica.slug(), started, seq)
        }
    }
}

/// Whether a write created a task or updated an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No task with this id existed.
    Created,
    /// An existing task was overwritten at its current revision.
    Updated,
}

/// Writes and deletes task documents in the control database.
pub struct TaskWriter {
    store: Arc<dyn DocumentStore>,
    primary: NodeUrl,
    control_db: String,
    credentials: Credentials,
    filter: Option<String>,
}

impl TaskWriter {
    /// Create a writer targeting `control_db` on `primary`.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        primary: NodeUrl,
        control_db: String,
        credentials: Credentials,
        filter: Option<String>,
    ) -> Self {
        Self {
            store,
            primary,
            control_db,
            credentials,
            filter,
        }
    }

    /// Build the document for a task without writing it.
    pub fn build_task(
        &self,
        task_id: &str,
        source: &NodeUrl,
        target: &NodeUrl,
        db_name: &str,
        continuous: bool,
    ) -> ReplicationTask {
        ReplicationTask {
            id: task_id.to_string(),
            rev: None,
            source: TaskEndpoint::new(source, db_name, &self.credentials),
            target: TaskEndpoint::new(target, db_name, &self.credentials),
            continuous,
            create_target: true,
            retry: true,
            filter: self.filter.clone(),
        }
    }

    async fn ensure_control_database(&self) -> Result<()> {
        if !self
            .store
            .database_exists(&self.primary, &self.control_db)
            .await?
        {
            self.store
                .create_database(&self.primary, &self.control_db)
                .await?;
            info!("Created control database {} on {}", self.control_db, self.primary);
        }
        Ok(())
    }

    /// Create or update a task. An existing document's revision is carried
    /// forward; if another writer moved it on in between, the store's
    /// [`ReplError::WriteConflict`] is returned unchanged.
    pub async fn upsert_task(
        &self,
        source: &NodeUrl,
        target: &NodeUrl,
        db_name: &str,
        task_id: &str,
        continuous: bool,
    ) -> Result<UpsertOutcome> {
        self.ensure_control_database().await?;

        let mut task = self.build_task(task_id, source, target, db_name, continuous);
        let existing = self
            .store
            .get_document(&self.primary, &self.control_db, task_id)
            .await?;
        task.rev = existing
            .as_ref()
            .and_then(|doc| doc.get("_rev"))
            .and_then(|rev| rev.as_str())
            .map(str::to_string);

        let body = serde_json::to_value(&task)?;
        let rev = self
            .store
            .put_document(&self.primary, &self.control_db, task_id, &body)
            .await?;

        if existing.is_some() {
            info!("Updated replication: {} (rev {})", task_id, rev);
            Ok(UpsertOutcome::Updated)
        } else {
            info!("Created replication: {} (rev {})", task_id, rev);
            Ok(UpsertOutcome::Created)
        }
    }

    /// Delete a task. Returns `false` when no such task exists.
    pub async fn stop_task(&self, task_id: &str) -> Result<bool> {
        let existing = match self
            .store
            .get_document(&self.primary, &self.control_db, task_id)
            .await
        {
            Ok(doc) => doc,
            Err(ReplError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        let Some(rev) = existing
            .as_ref()
            .and_then(|doc| doc.get("_rev"))
            .and_then(|rev| rev.as_str())
        else {
            debug!("Replication {} already absent", task_id);
            return Ok(false);
        };

        match self
            .store
            .delete_document(&self.primary, &self.control_db, task_id, rev)
            .await
        {
            Ok(()) => {
                info!("Stopped replication: {}", task_id);
                Ok(true)
            }
            Err(ReplError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
