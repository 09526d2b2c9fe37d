//! One-shot catch-up replication.

use crate::error::{ReplError, Result};
use crate::node::NodeUrl;
use crate::status::{StatusAggregator, TaskState};
use crate::task::{task_id, TaskPurpose, TaskWriter};
use crate::topology::{NodeResults, TopologyManager};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static SYNC_SEQ: AtomicU64 = AtomicU64::new(0);

/// Issues non-continuous primary → replica tasks and optionally waits for them.
pub struct SyncTrigger {
    writer: Arc<TaskWriter>,
    status: Arc<StatusAggregator>,
    topology: Arc<TopologyManager>,
    poll_interval: Duration,
    max_concurrency: usize,
}

impl SyncTrigger {
    /// Create a trigger polling at `poll_interval` while waiting.
    pub fn new(
        writer: Arc<TaskWriter>,
        status: Arc<StatusAggregator>,
        topology: Arc<TopologyManager>,
        poll_interval: Duration,
        max_concurrency: usize,
    ) -> Self {
        Self {
            writer,
            status,
            topology,
            poll_interval,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Start a one-shot sync of `db_name` to every active replica.
    ///
    /// With `wait`, each node's entry is only filled in once its task reaches a
    /// terminal state: `completed` counts as success, `error`/`failed` as
    /// [`ReplError::TaskFailed`]. There is no deadline here; cancelling
    /// `cancel` ends every outstanding wait with [`ReplError::Cancelled`].
    pub async fn sync_now(
        &self,
        db_name: &str,
        wait: bool,
        cancel: &CancellationToken,
    ) -> NodeResults {
        let replicas = self.topology.active_replicas().await;
        if replicas.is_empty() {
            warn!("Replication not configured - cannot sync database");
            return NodeResults::default();
        }

        let purpose = TaskPurpose::Sync {
            started: Utc::now().timestamp_millis(),
            seq: SYNC_SEQ.fetch_add(1, Ordering::Relaxed),
        };
        stream::iter(replicas)
            .map(|node| async move {
                let outcome = self.sync_node(&node, db_name, purpose, wait, cancel).await;
                match &outcome {
                    Ok(()) => info!("Sync initiated for '{}' with node: {}", db_name, node),
                    Err(e) => warn!("Failed to sync '{}' with {}: {}", db_name, node, e),
                }
                (node, outcome)
            })
            .buffered(self.max_concurrency)
            .collect()
            .await
    }

    async fn sync_node(
        &self,
        node: &NodeUrl,
        db_name: &str,
        purpose: TaskPurpose,
        wait: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = task_id(purpose, node, db_name);
        self.writer
            .upsert_task(self.topology.primary(), node, db_name, &id, false)
            .await?;
        if wait {
            self.wait_for_task(&id, cancel).await?;
        }
        Ok(())
    }

    /// Poll a task until it reaches a terminal state.
    pub async fn wait_for_task(&self, task_id: &str, cancel: &CancellationToken) -> Result<()> {
        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => return Err(ReplError::Cancelled),
                polled = self.status.task_status(task_id) => polled,
            };

            match polled {
                Ok(Some(record)) => match record.task_state() {
                    TaskState::Completed => return Ok(()),
                    TaskState::Error | TaskState::Failed => {
                        return Err(ReplError::TaskFailed {
                            task_id: task_id.to_string(),
                            state: record.state,
                        })
                    }
                    _ => debug!("Replication {} is {}", task_id, record.state),
                },
                Ok(None) => debug!("Replication {} not visible yet", task_id),
                Err(e) => debug!("Polling replication {} failed: {}", task_id, e),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ReplError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
