//! Node health checks.

use crate::node::NodeUrl;
use crate::store::DocumentStore;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Health classification of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Answered the info round-trip.
    Healthy,
    /// Did not answer, or answered with garbage.
    Unhealthy,
}

/// Result of one health round-trip. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    /// Classification.
    pub status: HealthStatus,
    /// Server version reported by a healthy node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// When the check finished.
    pub timestamp: DateTime<Utc>,
    /// Why the node is unhealthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthRecord {
    /// A healthy record reporting `version`.
    pub fn healthy(version: String) -> Self {
        Self {
            status: HealthStatus::Healthy,
            version: Some(version),
            timestamp: Utc::now(),
            error: None,
        }
    }

    /// An unhealthy record carrying `error`.
    pub fn unhealthy(error: String) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            version: None,
            timestamp: Utc::now(),
            error: Some(error),
        }
    }

    /// True for [`HealthStatus::Healthy`].
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Pings nodes through the document store with a bounded wait.
pub struct HealthChecker {
    store: Arc<dyn DocumentStore>,
    timeout: Duration,
    max_concurrency: usize,
}

impl HealthChecker {
    /// Create a checker that gives each node at most `timeout`.
    pub fn new(store: Arc<dyn DocumentStore>, timeout: Duration, max_concurrency: usize) -> Self {
        Self {
            store,
            timeout,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Check one node. Every failure mode becomes an unhealthy record.
    pub async fn check_health(&self, node: &NodeUrl) -> HealthRecord {
        match tokio::time::timeout(self.timeout, self.store.server_info(node)).await {
            Ok(Ok(info)) => HealthRecord::healthy(info.version),
            Ok(Err(e)) => {
                warn!("Health check failed for {}: {}", node, e);
                HealthRecord::unhealthy(e.to_string())
            }
            Err(_) => {
                warn!("Health check timed out for {} after {:?}", node, self.timeout);
                HealthRecord::unhealthy(format!("timed out after {:?}", self.timeout))
            }
        }
    }

    /// Check every node concurrently. One node's failure never stops the others.
    pub async fn check_nodes(&self, nodes: &[NodeUrl]) -> BTreeMap<String, HealthRecord> {
        stream::iter(nodes.iter().cloned())
            .map(|node| async move {
                let record = self.check_health(&node).await;
                (node.to_string(), record)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await
    }
}
