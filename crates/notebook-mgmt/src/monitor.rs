//! Cluster monitor: an HTTP client for the replication API plus the plain-text
//! reports the CLI prints.

use crate::api::{
    AppHealthResponse, ErrorResponse, FailoverRequest, FailoverResponse, InfoResponse,
    NodesHealthResponse, SetupRequest, SetupResponse, StatusResponse, StopTaskResponse,
    SyncRequest, SyncResponse,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use notebook_repl::{HealthRecord, HealthStatus};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

const RULE: &str = "============================================================";

pub struct MonitorClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl MonitorClient {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self.authorized(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        match response.json::<ErrorResponse>().await {
            Ok(body) => anyhow::bail!("Request failed: {}: {}", status, body.error),
            Err(_) => anyhow::bail!("Request failed: {}", status),
        }
    }

    /// Application health; an unhealthy service still answers with a body.
    pub async fn app_health(&self) -> Result<AppHealthResponse> {
        let response = self
            .authorized(self.client.get(self.url("/health")))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::SERVICE_UNAVAILABLE {
            return Ok(response.json().await?);
        }
        anyhow::bail!("Request failed: {}", status)
    }

    pub async fn replication_info(&self) -> Result<InfoResponse> {
        self.send(self.client.get(self.url("/replication/info"))).await
    }

    pub async fn cluster_health(&self) -> Result<NodesHealthResponse> {
        self.send(self.client.get(self.url("/replication/health"))).await
    }

    pub async fn replication_status(&self, database: Option<&str>) -> Result<StatusResponse> {
        let mut request = self.client.get(self.url("/replication/status"));
        if let Some(database) = database {
            request = request.query(&[("database", database)]);
        }
        self.send(request).await
    }

    pub async fn sync(&self, database: &str, wait: bool) -> Result<SyncResponse> {
        let body = SyncRequest {
            database: Some(database.to_string()),
            wait,
        };
        self.send(self.client.post(self.url("/replication/sync")).json(&body))
            .await
    }

    pub async fn setup(&self, database: &str, bidirectional: bool) -> Result<SetupResponse> {
        let body = SetupRequest {
            database: Some(database.to_string()),
            bidirectional: Some(bidirectional),
        };
        self.send(self.client.post(self.url("/replication/setup")).json(&body))
            .await
    }

    pub async fn failover(&self, node: &str, database: &str) -> Result<FailoverResponse> {
        let body = FailoverRequest {
            node: Some(node.to_string()),
            database: Some(database.to_string()),
        };
        self.send(self.client.post(self.url("/replication/failover")).json(&body))
            .await
    }

    pub async fn stop_task(&self, task_id: &str) -> Result<StopTaskResponse> {
        let mut url = reqwest::Url::parse(&self.url("/replication/tasks"))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Server URL cannot carry a path: {}", self.base_url))?
            .push(task_id);
        self.send(self.client.delete(url)).await
    }

    /// Everything the health report needs, fetched concurrently.
    pub async fn snapshot(&self) -> ClusterSnapshot {
        let (app, info, nodes, status) = tokio::join!(
            self.app_health(),
            self.replication_info(),
            self.cluster_health(),
            self.replication_status(None),
        );
        ClusterSnapshot {
            taken_at: Utc::now(),
            app: app.map_err(|e| e.to_string()),
            info: info.map_err(|e| e.to_string()),
            nodes: nodes.map_err(|e| e.to_string()),
            status: status.map_err(|e| e.to_string()),
        }
    }
}

/// One poll of the service. Each part fails independently.
pub struct ClusterSnapshot {
    pub taken_at: DateTime<Utc>,
    pub app: std::result::Result<AppHealthResponse, String>,
    pub info: std::result::Result<InfoResponse, String>,
    pub nodes: std::result::Result<NodesHealthResponse, String>,
    pub status: std::result::Result<StatusResponse, String>,
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "YES"
    } else {
        "NO"
    }
}

pub fn render_report(snapshot: &ClusterSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(
        out,
        "Cluster Health Report - {}",
        snapshot.taken_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(out, "{}", RULE);

    match &snapshot.app {
        Ok(app) if app.status == HealthStatus::Healthy => {
            let _ = writeln!(out, "[OK]   Application: HEALTHY");
        }
        Ok(_) => {
            let _ = writeln!(out, "[FAIL] Application: UNHEALTHY");
            let _ = writeln!(out, "       Primary database node is not answering");
        }
        Err(e) => {
            let _ = writeln!(out, "[FAIL] Application: UNHEALTHY");
            let _ = writeln!(out, "       Error: {}", e);
        }
    }
    out.push('\n');

    if let Ok(InfoResponse { info, .. }) = &snapshot.info {
        let _ = writeln!(out, "Replication Configuration:");
        let _ = writeln!(out, "   Enabled: {}", yes_no(info.replication_enabled));
        let _ = writeln!(out, "   Primary URL: {}", info.primary_url);
        let _ = writeln!(out, "   Replica Nodes: {}", info.replication_nodes.len());
        for (i, node) in info.replication_nodes.iter().enumerate() {
            let marker = if info.active_nodes.contains(node) {
                ""
            } else {
                " (removed)"
            };
            let _ = writeln!(out, "     {}. {}{}", i + 1, node, marker);
        }
        let _ = writeln!(out, "   Continuous: {}", yes_no(info.continuous_replication));
        let _ = writeln!(out, "   Retry Interval: {}s", info.retry_seconds);
        out.push('\n');
    }

    match &snapshot.nodes {
        Ok(health) => out.push_str(&render_node_health(&health.nodes)),
        Err(e) => {
            let _ = writeln!(out, "[FAIL] Failed to get cluster health: {}", e);
        }
    }
    out.push('\n');

    match &snapshot.status {
        Ok(status) if status.replications.is_empty() => {
            let _ = writeln!(out, "No active replications found");
        }
        Ok(status) => {
            let _ = writeln!(out, "Active Replications:");
            let mut active = 0;
            let mut errors = 0;
            for (task_id, record) in &status.replications {
                let marker = match record.state.as_str() {
                    "running" | "completed" => {
                        active += 1;
                        "[OK]  "
                    }
                    "error" | "failed" => {
                        errors += 1;
                        "[FAIL]"
                    }
                    _ => "[WARN]",
                };
                let _ = writeln!(out, "   {} {}", marker, task_id);
                let _ = writeln!(out, "       State: {}", record.state);
                let _ = writeln!(out, "       Source: {}", record.source);
                let _ = writeln!(out, "       Target: {}", record.target);
                if let (Some(read), Some(written)) = (record.docs_read, record.docs_written) {
                    let _ = writeln!(out, "       Docs Read: {}", read);
                    let _ = writeln!(out, "       Docs Written: {}", written);
                }
                if let Some(failures) = record.doc_write_failures.filter(|f| *f > 0) {
                    let _ = writeln!(out, "       Write Failures: {}", failures);
                }
            }
            let _ = writeln!(out, "   Summary: {} active, {} errors", active, errors);
        }
        Err(e) => {
            let _ = writeln!(out, "[FAIL] Failed to get replication status: {}", e);
        }
    }

    let _ = writeln!(out, "{}", RULE);
    out
}

pub fn render_node_health(nodes: &BTreeMap<String, HealthRecord>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Cluster Node Health:");
    let mut healthy = 0;
    for (url, record) in nodes {
        if record.is_healthy() {
            healthy += 1;
            let version = record.version.as_deref().unwrap_or("unknown");
            let _ = writeln!(out, "   [OK]   {} - v{}", url, version);
        } else {
            let error = record.error.as_deref().unwrap_or("unknown error");
            let _ = writeln!(out, "   [FAIL] {} - {}", url, error);
        }
    }
    let _ = writeln!(out, "   Summary: {}/{} nodes healthy", healthy, nodes.len());
    out
}

pub fn render_database_report(database: &str, status: &StatusResponse) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Checking replication for database: {}", database);
    let _ = writeln!(out, "{}", "-".repeat(50));

    if status.replications.is_empty() {
        let _ = writeln!(out, "No replications found for database: {}", database);
        return out;
    }

    for (task_id, record) in &status.replications {
        let _ = writeln!(out, "Replication: {}", task_id);
        let _ = writeln!(out, "  State: {}", record.state);
        let _ = writeln!(out, "  Continuous: {}", record.continuous);
        let _ = writeln!(out, "  Last Updated: {}", record.last_updated);
        if let Some(read) = record.docs_read {
            let _ = writeln!(out, "  Documents Read: {}", read);
        }
        if let Some(written) = record.docs_written {
            let _ = writeln!(out, "  Documents Written: {}", written);
        }
        if let Some(checked) = record.revisions_checked {
            let _ = writeln!(out, "  Revisions Checked: {}", checked);
        }
        if let Some(failures) = record.doc_write_failures.filter(|f| *f > 0) {
            let _ = writeln!(out, "  Write Failures: {}", failures);
        }
        out.push('\n');
    }
    out
}

pub fn render_sync(result: &SyncResponse, wait: bool) -> String {
    let mut out = String::new();
    let failed: Vec<&String> = result
        .results
        .iter()
        .filter(|(_, ok)| !**ok)
        .map(|(node, _)| node)
        .collect();

    if result.results.is_empty() {
        let _ = writeln!(out, "No replicas to sync with (single-node mode)");
    } else if failed.is_empty() {
        let verb = if wait { "completed" } else { "initiated" };
        let _ = writeln!(out, "Sync {} for {} node(s)", verb, result.results.len());
    } else {
        let _ = writeln!(
            out,
            "Sync failed for {} of {} node(s)",
            failed.len(),
            result.results.len()
        );
    }
    for (node, ok) in &result.results {
        let _ = writeln!(out, "   {} {}", if *ok { "[OK]  " } else { "[FAIL]" }, node);
    }
    out
}

/// Counts consecutive unhealthy polls per node and names the nodes that
/// crossed the threshold.
pub struct UnhealthyTracker {
    threshold: u32,
    streaks: HashMap<String, u32>,
}

impl UnhealthyTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            streaks: HashMap::new(),
        }
    }

    /// Feed one health poll. A node is returned once per full streak; the
    /// primary is never returned.
    pub fn observe(
        &mut self,
        nodes: &BTreeMap<String, HealthRecord>,
        primary: Option<&str>,
    ) -> Vec<String> {
        self.streaks.retain(|url, _| nodes.contains_key(url));

        let mut due = Vec::new();
        for (url, record) in nodes {
            if Some(url.as_str()) == primary {
                continue;
            }
            if record.is_healthy() {
                self.streaks.remove(url);
                continue;
            }
            let streak = self.streaks.entry(url.clone()).or_insert(0);
            *streak += 1;
            if *streak >= self.threshold {
                *streak = 0;
                due.push(url.clone());
            }
        }
        due
    }

    pub fn streak(&self, url: &str) -> u32 {
        self.streaks.get(url).copied().unwrap_or(0)
    }
}
