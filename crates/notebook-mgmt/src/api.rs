use crate::config::ServiceConfig;
use crate::security::{
    bearer_token, constant_time_eq, security_headers_middleware, AuthRateLimiter,
};
use axum::{
    body::{Body, Bytes},
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use notebook_repl::{
    HealthRecord, HealthStatus, NodeUrl, ReplError, ReplicationOrchestrator, StatusRecord,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub success: bool,
    pub replications: BTreeMap<String, StatusRecord>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesHealthResponse {
    pub success: bool,
    pub nodes: BTreeMap<String, HealthRecord>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncRequest {
    pub database: Option<String>,
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub success: bool,
    pub database: String,
    pub results: BTreeMap<String, bool>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetupRequest {
    pub database: Option<String>,
    pub bidirectional: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupResponse {
    pub success: bool,
    pub database: String,
    pub bidirectional: bool,
    pub results: BTreeMap<String, bool>,
    pub timestamp: DateTime<Utc>,
}

/// Static view of the replication settings plus the replicas still active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationInfo {
    pub replication_enabled: bool,
    pub primary_url: String,
    pub replication_nodes: Vec<String>,
    #[serde(default)]
    pub active_nodes: Vec<String>,
    pub continuous_replication: bool,
    pub retry_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResponse {
    pub success: bool,
    pub info: ReplicationInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClusterHealth {
    SingleNode { single_node: bool },
    Nodes(BTreeMap<String, HealthRecord>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppHealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub replication_enabled: bool,
    pub database_cluster: ClusterHealth,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailoverRequest {
    pub node: Option<String>,
    pub database: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverResponse {
    pub success: bool,
    pub node: String,
    pub database: String,
    pub removed: bool,
    pub was_active: bool,
    pub stopped: BTreeMap<String, bool>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopTaskResponse {
    pub success: bool,
    pub task_id: String,
    pub stopped: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopRequest {
    pub database: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopAllResponse {
    pub success: bool,
    pub results: BTreeMap<String, bool>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl From<ReplError> for ApiError {
    fn from(e: ReplError) -> Self {
        if e.is_configuration() {
            ApiError::BadRequest(e.to_string())
        } else {
            ApiError::Internal(e.to_string())
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!("Request failed ({}): {}", status, self);
        let body = ErrorResponse {
            success: false,
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn required(value: Option<String>, message: &str) -> Result<String, ApiError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest(message.to_string()))
}

#[derive(Clone)]
pub struct ReplicationApi {
    orchestrator: Arc<ReplicationOrchestrator>,
    config: Arc<ServiceConfig>,
    rate_limiter: Arc<AuthRateLimiter>,
}

impl ReplicationApi {
    pub fn new(orchestrator: Arc<ReplicationOrchestrator>, config: Arc<ServiceConfig>) -> Self {
        Self {
            orchestrator,
            config,
            rate_limiter: Arc::new(AuthRateLimiter::new()),
        }
    }

    pub fn router(self: Arc<Self>) -> Router {
        let protected = Router::new()
            .route("/replication/status", get(status_handler))
            .route("/replication/health", get(nodes_health_handler))
            .route("/replication/sync", post(sync_handler))
            .route("/replication/setup", post(setup_handler))
            .route("/replication/info", get(info_handler))
            .route("/replication/failover", post(failover_handler))
            .route("/replication/stop", post(stop_all_handler))
            .route("/replication/tasks/:task_id", delete(stop_task_handler))
            .layer(middleware::from_fn_with_state(self.clone(), auth_middleware));

        let public = Router::new().route("/health", get(app_health_handler));

        Router::new()
            .merge(protected)
            .merge(public)
            .layer(middleware::from_fn(security_headers_middleware))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = self.config.bind_addr;
        if self.config.secret_key.is_none() {
            tracing::warn!("[SECURITY WARNING] replication API is unauthenticated, set SECRET_KEY");
        }

        let limiter = self.rate_limiter.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                limiter.prune();
            }
        });

        let router = Arc::new(self).router();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Replication API listening on {}", addr);

        axum::serve(listener, router.into_make_service()).await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    database: Option<String>,
}

async fn status_handler(
    State(state): State<Arc<ReplicationApi>>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    let database = query.database.filter(|d| !d.trim().is_empty());
    let replications = state.orchestrator.get_status(database.as_deref()).await?;
    Ok(Json(StatusResponse {
        success: true,
        replications,
        timestamp: Utc::now(),
    }))
}

async fn nodes_health_handler(
    State(state): State<Arc<ReplicationApi>>,
) -> Json<NodesHealthResponse> {
    Json(NodesHealthResponse {
        success: true,
        nodes: state.orchestrator.check_all_nodes().await,
        timestamp: Utc::now(),
    })
}

async fn sync_handler(
    State(state): State<Arc<ReplicationApi>>,
    payload: Result<Json<SyncRequest>, JsonRejection>,
) -> Result<Json<SyncResponse>, ApiError> {
    let Json(request) = payload?;
    let database = required(request.database, "Database name is required")?;

    let cancel = CancellationToken::new();
    let wait_timeout = state.config.sync_wait_timeout();
    let results = {
        let sync = state.orchestrator.sync_now(&database, request.wait, &cancel);
        tokio::pin!(sync);
        tokio::select! {
            results = &mut sync => results,
            _ = tokio::time::sleep(wait_timeout), if request.wait => {
                tracing::warn!(
                    "Sync of {} still running after {:?}, giving up",
                    database,
                    wait_timeout
                );
                cancel.cancel();
                sync.await
            }
        }
    };

    Ok(Json(SyncResponse {
        success: true,
        database,
        results: results.to_bool_map(),
        timestamp: Utc::now(),
    }))
}

async fn setup_handler(
    State(state): State<Arc<ReplicationApi>>,
    payload: Result<Json<SetupRequest>, JsonRejection>,
) -> Result<Json<SetupResponse>, ApiError> {
    let Json(request) = payload?;
    let database = required(request.database, "Database name is required")?;
    let bidirectional = request.bidirectional.unwrap_or(true);

    let results = state
        .orchestrator
        .setup_replication(&database, bidirectional)
        .await;

    Ok(Json(SetupResponse {
        success: true,
        database,
        bidirectional,
        results: results.to_bool_map(),
        timestamp: Utc::now(),
    }))
}

async fn info_handler(State(state): State<Arc<ReplicationApi>>) -> Json<InfoResponse> {
    let config = state.orchestrator.config();
    let active_nodes = state
        .orchestrator
        .active_replicas()
        .await
        .into_iter()
        .map(|n| n.to_string())
        .collect();

    Json(InfoResponse {
        success: true,
        info: ReplicationInfo {
            replication_enabled: state.orchestrator.replication_enabled(),
            primary_url: config.primary.to_string(),
            replication_nodes: config.replicas.iter().map(|n| n.to_string()).collect(),
            active_nodes,
            continuous_replication: config.continuous,
            retry_seconds: config.retry_seconds,
            timestamp: Utc::now(),
        },
    })
}

async fn app_health_handler(State(state): State<Arc<ReplicationApi>>) -> Response {
    let orchestrator = &state.orchestrator;
    let primary = orchestrator.config().primary.clone();

    let (primary_healthy, database_cluster) = if orchestrator.replication_enabled() {
        let nodes = orchestrator.check_all_nodes().await;
        let healthy = nodes
            .get(primary.as_str())
            .map(HealthRecord::is_healthy)
            .unwrap_or(false);
        (healthy, ClusterHealth::Nodes(nodes))
    } else {
        let healthy = orchestrator.check_health(&primary).await.is_healthy();
        (healthy, ClusterHealth::SingleNode { single_node: true })
    };

    let (code, status) = if primary_healthy {
        (StatusCode::OK, HealthStatus::Healthy)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, HealthStatus::Unhealthy)
    };

    let body = AppHealthResponse {
        status,
        timestamp: Utc::now(),
        replication_enabled: orchestrator.replication_enabled(),
        database_cluster,
    };
    (code, Json(body)).into_response()
}

async fn failover_handler(
    State(state): State<Arc<ReplicationApi>>,
    payload: Result<Json<FailoverRequest>, JsonRejection>,
) -> Result<Json<FailoverResponse>, ApiError> {
    let Json(request) = payload?;
    let raw_node = required(request.node, "Node URL is required")?;
    let database = required(request.database, "Database name is required")?;
    let node = NodeUrl::parse(&raw_node)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid node URL: {}", raw_node)))?;

    let report = state.orchestrator.failover(&node, &database).await;
    Ok(Json(FailoverResponse {
        success: report.completed,
        node: report.node,
        database,
        removed: report.completed && report.was_active,
        was_active: report.was_active,
        stopped: report.stopped,
        timestamp: Utc::now(),
    }))
}

async fn stop_task_handler(
    State(state): State<Arc<ReplicationApi>>,
    Path(task_id): Path<String>,
) -> Result<Json<StopTaskResponse>, ApiError> {
    let stopped = state.orchestrator.stop_task(&task_id).await?;
    Ok(Json(StopTaskResponse {
        success: true,
        task_id,
        stopped,
        timestamp: Utc::now(),
    }))
}

/// Only an empty body means "every database"; anything else must be a valid
/// JSON `StopRequest`.
fn stop_request(headers: &HeaderMap, body: &Bytes) -> Result<StopRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(StopRequest::default());
    }
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.trim_start().to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false);
    if !is_json {
        return Err(ApiError::BadRequest(
            "Expected request with `Content-Type: application/json`".to_string(),
        ));
    }
    let Json(request) = Json::<StopRequest>::from_bytes(body)?;
    Ok(request)
}

async fn stop_all_handler(
    State(state): State<Arc<ReplicationApi>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<StopAllResponse>, ApiError> {
    let database = stop_request(&headers, &body)?
        .database
        .filter(|d| !d.trim().is_empty());
    let results = state.orchestrator.stop_all(database.as_deref()).await?;
    Ok(Json(StopAllResponse {
        success: true,
        results,
        timestamp: Utc::now(),
    }))
}

async fn auth_middleware(
    State(state): State<Arc<ReplicationApi>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(secret) = state.config.secret_key.as_deref() else {
        return next.run(request).await;
    };

    let client = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if state.rate_limiter.is_rate_limited(&client) {
        return auth_error(StatusCode::TOO_MANY_REQUESTS, "Too many failed authentication attempts");
    }

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);

    match provided {
        Some(token) if constant_time_eq(token, secret) => next.run(request).await,
        _ => {
            state.rate_limiter.record_failure(&client);
            let mut response = auth_error(StatusCode::UNAUTHORIZED, "Unauthorized");
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                header::HeaderValue::from_static(r#"Bearer realm="nb-mgmt""#),
            );
            response
        }
    }
}

fn auth_error(status: StatusCode, message: &str) -> Response {
    let body = ErrorResponse {
        success: false,
        error: message.to_string(),
    };
    (status, Json(body)).into_response()
}
