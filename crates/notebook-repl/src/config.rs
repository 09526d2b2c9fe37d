//! Cluster configuration handed to the orchestrator by its owner.

use crate::error::{ReplError, Result};
use crate::node::{normalize_replicas, Credentials, NodeUrl};
use std::time::Duration;

/// Name of the control database watched by the store's replicator.
pub const DEFAULT_CONTROL_DATABASE: &str = "_replicator";

/// Validated replication settings. Built once by the service and shared
/// read-only; the only mutable piece of topology (the active replica set)
/// lives in [`crate::topology::TopologyManager`].
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// The authoritative node.
    pub primary: NodeUrl,
    /// Replicas in configuration order, normalized.
    pub replicas: Vec<NodeUrl>,
    /// Credentials used for every node and embedded in task documents.
    pub credentials: Credentials,
    /// Whether setup creates continuous tasks.
    pub continuous: bool,
    /// Cluster-wide filter attached to every task when set.
    pub filter: Option<String>,
    /// Informational retry interval reported by the info endpoint.
    pub retry_seconds: u64,
    /// Control database holding task documents.
    pub control_database: String,
    /// Bound on a single health round-trip.
    pub health_timeout: Duration,
    /// Interval between status polls while waiting for a one-shot task.
    pub sync_poll_interval: Duration,
    /// Maximum number of nodes contacted at once by fan-out operations.
    pub max_concurrency: usize,
}

impl ReplicationConfig {
    /// Build a config from raw settings. The replica list is normalized and
    /// an empty filter is treated as no filter.
    pub fn new<S: AsRef<str>>(
        primary: &str,
        replicas: &[S],
        credentials: Credentials,
    ) -> Result<Self> {
        let primary = NodeUrl::parse(primary)
            .ok_or_else(|| ReplError::Configuration("primary URL is empty".to_string()))?;
        let replicas = normalize_replicas(replicas, &primary);
        Ok(Self {
            primary,
            replicas,
            credentials,
            continuous: true,
            filter: None,
            retry_seconds: 30,
            control_database: DEFAULT_CONTROL_DATABASE.to_string(),
            health_timeout: Duration::from_secs(5),
            sync_poll_interval: Duration::from_secs(1),
            max_concurrency: 4,
        })
    }

    /// Set the continuous flag used by setup.
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Set the cluster-wide filter; blank strings clear it.
    pub fn with_filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter.filter(|f| !f.trim().is_empty());
        self
    }

    /// Set the health check timeout.
    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    /// Set the one-shot poll interval.
    pub fn with_sync_poll_interval(mut self, interval: Duration) -> Self {
        self.sync_poll_interval = interval;
        self
    }

    /// True when at least one replica is configured.
    pub fn replication_enabled(&self) -> bool {
        !self.replicas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ReplicationConfig::new::<&str>(
            "http://localhost:5984",
            &[],
            Credentials::new("admin", "password"),
        )
        .unwrap();
        assert_eq!(cfg.primary.as_str(), "http://localhost:5984/");
        assert!(cfg.replicas.is_empty());
        assert!(cfg.continuous);
        assert!(cfg.filter.is_none());
        assert_eq!(cfg.retry_seconds, 30);
        assert_eq!(cfg.control_database, "_replicator");
        assert!(!cfg.replication_enabled());
    }

    #[test]
    fn test_empty_primary_rejected() {
        let err =
            ReplicationConfig::new::<&str>("  ", &[], Credentials::new("a", "b")).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_blank_filter_cleared() {
        let cfg = ReplicationConfig::new::<&str>("http://p/", &[], Credentials::new("a", "b"))
            .unwrap()
            .with_filter(Some("  ".to_string()));
        assert!(cfg.filter.is_none());

        let cfg = cfg.with_filter(Some("app/replicate".to_string()));
        assert_eq!(cfg.filter.as_deref(), Some("app/replicate"));
    }

    #[test]
    fn test_replicas_normalized() {
        let cfg = ReplicationConfig::new(
            "http://p/",
            &["  http://a/  ", "", "http://b/", "http://p"],
            Credentials::new("a", "b"),
        )
        .unwrap();
        let urls: Vec<&str> = cfg.replicas.iter().map(|n| n.as_str()).collect();
        assert_eq!(urls, vec!["http://a/", "http://b/"]);
        assert!(cfg.replication_enabled());
    }
}
