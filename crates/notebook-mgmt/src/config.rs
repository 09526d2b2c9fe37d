use notebook_repl::node::split_node_list;
use notebook_repl::{Credentials, ReplicationConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub couchdb_url: String,
    pub couchdb_user: String,
    pub couchdb_password: String,
    pub replication_nodes: Vec<String>,
    pub continuous_replication: bool,
    pub replication_filter: Option<String>,
    pub retry_seconds: u64,
    pub secret_key: Option<String>,
    pub control_database: String,
    pub health_timeout_secs: u64,
    pub sync_poll_interval_ms: u64,
    pub sync_wait_timeout_secs: u64,
    pub max_concurrency: usize,
    pub core_databases: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            couchdb_url: String::from("http://localhost:5984/"),
            couchdb_user: String::from("admin"),
            couchdb_password: String::from("password"),
            replication_nodes: Vec::new(),
            continuous_replication: true,
            replication_filter: None,
            retry_seconds: 30,
            secret_key: None,
            control_database: String::from("_replicator"),
            health_timeout_secs: 5,
            sync_poll_interval_ms: 1000,
            sync_wait_timeout_secs: 300,
            max_concurrency: 4,
            core_databases: vec![
                String::from("pdfs"),
                String::from("categories"),
                String::from("analytics"),
            ],
        }
    }
}

impl ServiceConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: ServiceConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: ServiceConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Load the file when one is given and present, then apply the process
    /// environment on top.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                tracing::warn!("Config file not found, using defaults: {}", path.display());
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override settings from environment variables looked up through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("COUCHDB_URL") {
            self.couchdb_url = v;
        }
        if let Some(v) = lookup("COUCHDB_USER") {
            self.couchdb_user = v;
        }
        if let Some(v) = lookup("COUCHDB_PASSWORD") {
            self.couchdb_password = v;
        }
        if let Some(v) = lookup("REPLICATION_NODES") {
            self.replication_nodes = split_node_list(&v);
        }
        if let Some(v) = lookup("CONTINUOUS_REPLICATION") {
            self.continuous_replication = v.trim().eq_ignore_ascii_case("true");
        }
        if let Some(v) = lookup("REPLICATION_FILTER") {
            self.replication_filter = Some(v);
        }
        if let Some(v) = lookup("REPLICATION_RETRY_SECONDS") {
            self.retry_seconds = v
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("REPLICATION_RETRY_SECONDS={}: {}", v, e))?;
        }
        if let Some(v) = lookup("SECRET_KEY") {
            self.secret_key = Some(v);
        }
        self.secret_key = self.secret_key.take().filter(|s| !s.is_empty());
        Ok(())
    }

    pub fn replication_config(&self) -> notebook_repl::Result<ReplicationConfig> {
        let mut config = ReplicationConfig::new(
            &self.couchdb_url,
            &self.replication_nodes,
            Credentials::new(&self.couchdb_user, &self.couchdb_password),
        )?
        .with_continuous(self.continuous_replication)
        .with_filter(self.replication_filter.clone())
        .with_health_timeout(Duration::from_secs(self.health_timeout_secs))
        .with_sync_poll_interval(Duration::from_millis(self.sync_poll_interval_ms));
        config.retry_seconds = self.retry_seconds;
        config.control_database = self.control_database.clone();
        config.max_concurrency = self.max_concurrency;
        Ok(config)
    }

    pub fn sync_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_wait_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio_test::{assert_err, assert_ok};

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = ServiceConfig::default();
        assert_eq!(config.bind_addr, SocketAddr::from(([0, 0, 0, 0], 5000)));
        assert_eq!(config.couchdb_url, "http://localhost:5984/");
        assert!(config.replication_nodes.is_empty());
        assert!(config.continuous_replication);
        assert_eq!(config.retry_seconds, 30);
        assert_eq!(config.control_database, "_replicator");
        assert_eq!(config.core_databases, vec!["pdfs", "categories", "analytics"]);
        assert!(config.secret_key.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ServiceConfig::default();
        assert_ok!(config.apply_env(env(&[
            ("COUCHDB_URL", "http://couch-primary:5984"),
            ("COUCHDB_USER", "Admin"),
            ("COUCHDB_PASSWORD", "password123"),
            ("REPLICATION_NODES", "  http://a/  ,,http://b/"),
            ("CONTINUOUS_REPLICATION", "FALSE"),
            ("REPLICATION_FILTER", "app/public"),
            ("REPLICATION_RETRY_SECONDS", "45"),
            ("SECRET_KEY", "s3cret"),
        ])));

        assert_eq!(config.couchdb_url, "http://couch-primary:5984");
        assert_eq!(config.couchdb_user, "Admin");
        assert!(!config.continuous_replication);
        assert_eq!(config.retry_seconds, 45);
        assert_eq!(config.secret_key.as_deref(), Some("s3cret"));

        let repl = config.replication_config().unwrap();
        let nodes: Vec<&str> = repl.replicas.iter().map(|n| n.as_str()).collect();
        assert_eq!(nodes, vec!["http://a/", "http://b/"]);
        assert_eq!(repl.primary.as_str(), "http://couch-primary:5984/");
        assert_eq!(repl.filter.as_deref(), Some("app/public"));
        assert!(!repl.continuous);
        assert_eq!(repl.retry_seconds, 45);
    }

    #[test]
    fn test_bad_retry_seconds_rejected() {
        let mut config = ServiceConfig::default();
        assert_err!(config.apply_env(env(&[("REPLICATION_RETRY_SECONDS", "soon")])));
    }

    #[test]
    fn test_empty_secret_and_filter_disabled() {
        let mut config = ServiceConfig::default();
        config
            .apply_env(env(&[("SECRET_KEY", ""), ("REPLICATION_FILTER", "")]))
            .unwrap();
        assert!(config.secret_key.is_none());
        assert!(config.replication_config().unwrap().filter.is_none());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
bind_addr = "127.0.0.1:8080"
couchdb_url = "http://p:5984/"
replication_nodes = ["http://r1:5984/", "http://r2:5984/"]
core_databases = ["pdfs"]
sync_wait_timeout_secs = 60
            "#
        )
        .unwrap();

        let config = ServiceConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bind_addr, SocketAddr::from(([127, 0, 0, 1], 8080)));
        assert_eq!(config.replication_nodes.len(), 2);
        assert_eq!(config.core_databases, vec!["pdfs"]);
        assert_eq!(config.sync_wait_timeout(), Duration::from_secs(60));
        assert_eq!(config.retry_seconds, 30);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"couchdb_url": "http://p:5984/", "secret_key": "abc", "max_concurrency": 2}}"#
        )
        .unwrap();

        let config = ServiceConfig::from_file(file.path()).unwrap();
        assert_eq!(config.secret_key.as_deref(), Some("abc"));
        assert_eq!(config.max_concurrency, 2);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(ServiceConfig::from_file(file.path()).is_err());
    }
}
