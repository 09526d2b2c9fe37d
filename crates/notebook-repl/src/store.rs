//! Document-store access: the [`DocumentStore`] seam and its CouchDB HTTP client.

use crate::error::{ReplError, Result};
use crate::node::{Credentials, NodeUrl};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// Server identification returned by a node's root endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerInfo {
    /// Reported server version.
    pub version: String,
    /// Welcome banner, when present.
    #[serde(default, rename = "couchdb")]
    pub banner: Option<String>,
}

/// Operations the orchestrator needs from a document-store node.
///
/// Documents cross this boundary as raw JSON; typed records are built on top.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Lightweight round-trip returning the server version.
    async fn server_info(&self, node: &NodeUrl) -> Result<ServerInfo>;

    /// Whether a database exists on the node.
    async fn database_exists(&self, node: &NodeUrl, db: &str) -> Result<bool>;

    /// Create a database. Creating an existing database is not an error.
    async fn create_database(&self, node: &NodeUrl, db: &str) -> Result<()>;

    /// Fetch a document by id, `None` when absent.
    async fn get_document(&self, node: &NodeUrl, db: &str, id: &str) -> Result<Option<Value>>;

    /// Write a document. The body's `_rev` must match the stored revision when
    /// the document exists; otherwise [`ReplError::WriteConflict`]. Returns the
    /// new revision.
    async fn put_document(&self, node: &NodeUrl, db: &str, id: &str, doc: &Value) -> Result<String>;

    /// Delete a document at a given revision. Missing documents yield
    /// [`ReplError::NotFound`].
    async fn delete_document(&self, node: &NodeUrl, db: &str, id: &str, rev: &str) -> Result<()>;

    /// Every document of a database, bodies included.
    async fn list_documents(&self, node: &NodeUrl, db: &str) -> Result<Vec<Value>>;
}

/// [`DocumentStore`] over the CouchDB HTTP API.
pub struct CouchClient {
    client: Client,
    credentials: Credentials,
}

#[derive(Deserialize)]
struct WriteResponse {
    rev: String,
}

#[derive(Deserialize)]
struct AllDocsRow {
    doc: Option<Value>,
}

#[derive(Deserialize)]
struct AllDocsResponse {
    rows: Vec<AllDocsRow>,
}

impl CouchClient {
    /// Build a client authenticating with `credentials`; every request is
    /// bounded by `timeout`.
    pub fn new(credentials: Credentials, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReplError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            credentials,
        })
    }

    fn url(node: &NodeUrl, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(node.as_str())
            .map_err(|e| ReplError::Configuration(format!("invalid node URL {}: {}", node, e)))?;
        if segments.is_empty() {
            return Ok(url);
        }
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                ReplError::Configuration(format!("node URL cannot be a base: {}", node))
            })?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    async fn send(
        &self,
        node: &NodeUrl,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .request(method, url)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password));
        if let Some(body) = body {
            request = request.json(body);
        }
        request.send().await.map_err(|e| connectivity(node, e))
    }
}

fn connectivity(node: &NodeUrl, e: reqwest::Error) -> ReplError {
    let msg = if e.is_timeout() {
        format!("timed out: {}", e)
    } else if e.is_connect() {
        format!("connection failed: {}", e)
    } else {
        e.to_string()
    };
    ReplError::Connectivity {
        node: node.to_string(),
        msg,
    }
}

async fn unexpected(response: reqwest::Response) -> ReplError {
    let status = response.status().as_u16();
    let msg = response
        .text()
        .await
        .unwrap_or_else(|e| format!("unreadable body: {}", e));
    ReplError::Store { status, msg }
}

async fn decode<T: serde::de::DeserializeOwned>(
    node: &NodeUrl,
    response: reqwest::Response,
) -> Result<T> {
    let bytes = response.bytes().await.map_err(|e| connectivity(node, e))?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl DocumentStore for CouchClient {
    async fn server_info(&self, node: &NodeUrl) -> Result<ServerInfo> {
        let url = Self::url(node, &[])?;
        let response = self.send(node, Method::GET, url, None).await?;
        if !response.status().is_success() {
            return Err(unexpected(response).await);
        }
        decode(node, response).await
    }

    async fn database_exists(&self, node: &NodeUrl, db: &str) -> Result<bool> {
        let url = Self::url(node, &[db])?;
        let response = self.send(node, Method::HEAD, url, None).await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(unexpected(response).await),
        }
    }

    async fn create_database(&self, node: &NodeUrl, db: &str) -> Result<()> {
        let url = Self::url(node, &[db])?;
        let response = self.send(node, Method::PUT, url, None).await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::PRECONDITION_FAILED => Ok(()),
            _ => Err(unexpected(response).await),
        }
    }

    async fn get_document(&self, node: &NodeUrl, db: &str, id: &str) -> Result<Option<Value>> {
        let url = Self::url(node, &[db, id])?;
        let response = self.send(node, Method::GET, url, None).await?;
        match response.status() {
            s if s.is_success() => Ok(Some(decode(node, response).await?)),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(unexpected(response).await),
        }
    }

    async fn put_document(
        &self,
        node: &NodeUrl,
        db: &str,
        id: &str,
        doc: &Value,
    ) -> Result<String> {
        let url = Self::url(node, &[db, id])?;
        let response = self.send(node, Method::PUT, url, Some(doc)).await?;
        match response.status() {
            s if s.is_success() => {
                let written: WriteResponse = decode(node, response).await?;
                Ok(written.rev)
            }
            StatusCode::CONFLICT => Err(ReplError::WriteConflict {
                task_id: id.to_string(),
            }),
            _ => Err(unexpected(response).await),
        }
    }

    async fn delete_document(&self, node: &NodeUrl, db: &str, id: &str, rev: &str) -> Result<()> {
        let mut url = Self::url(node, &[db, id])?;
        url.query_pairs_mut().append_pair("rev", rev);
        let response = self.send(node, Method::DELETE, url, None).await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ReplError::NotFound {
                what: format!("{}/{}", db, id),
            }),
            StatusCode::CONFLICT => Err(ReplError::WriteConflict {
                task_id: id.to_string(),
            }),
            _ => Err(unexpected(response).await),
        }
    }

    async fn list_documents(&self, node: &NodeUrl, db: &str) -> Result<Vec<Value>> {
        let mut url = Self::url(node, &[db, "_all_docs"])?;
        url.query_pairs_mut().append_pair("include_docs", "true");
        let response = self.send(node, Method::GET, url, None).await?;
        match response.status() {
            s if s.is_success() => {
                let all: AllDocsResponse = decode(node, response).await?;
                Ok(all.rows.into_iter().filter_map(|row| row.doc).collect())
            }
            StatusCode::NOT_FOUND => Err(ReplError::NotFound {
                what: db.to_string(),
            }),
            _ => Err(unexpected(response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, Query},
        http::{HeaderMap, StatusCode as AxumStatus},
        routing::get,
        Json, Router,
    };
    use serde_json::json;
    use std::collections::HashMap;

    async fn spawn_fake_couch() -> NodeUrl {
        async fn root(headers: HeaderMap) -> (AxumStatus, Json<Value>) {
            if headers.get("authorization").is_none() {
                return (AxumStatus::UNAUTHORIZED, Json(json!({"error": "unauthorized"})));
            }
            (AxumStatus::OK, Json(json!({"couchdb": "Welcome", "version": "3.3.3"})))
        }

        async fn head_db(Path(db): Path<String>) -> AxumStatus {
            if db == "pdfs" {
                AxumStatus::OK
            } else {
                AxumStatus::NOT_FOUND
            }
        }

        async fn put_db(Path(db): Path<String>) -> (AxumStatus, Json<Value>) {
            if db == "pdfs" {
                (AxumStatus::PRECONDITION_FAILED, Json(json!({"error": "file_exists"})))
            } else {
                (AxumStatus::CREATED, Json(json!({"ok": true})))
            }
        }

        async fn get_doc(Path((_db, id)): Path<(String, String)>) -> (AxumStatus, Json<Value>) {
            match id.as_str() {
                "_all_docs" => (
                    AxumStatus::OK,
                    Json(json!({"rows": [
                        {"id": "a", "doc": {"_id": "a", "_rev": "1-x"}},
                        {"id": "b", "doc": {"_id": "b", "_rev": "1-y"}}
                    ]})),
                ),
                "primary_to_http_r:5984__pdfs" => (
                    AxumStatus::OK,
                    Json(json!({"_id": id, "_rev": "2-abc"})),
                ),
                _ => (AxumStatus::NOT_FOUND, Json(json!({"error": "not_found"}))),
            }
        }

        async fn put_doc(
            Path((_db, id)): Path<(String, String)>,
            Json(body): Json<Value>,
        ) -> (AxumStatus, Json<Value>) {
            if body.get("_rev").and_then(|r| r.as_str()) == Some("stale") {
                return (AxumStatus::CONFLICT, Json(json!({"error": "conflict"})));
            }
            (AxumStatus::CREATED, Json(json!({"ok": true, "id": id, "rev": "1-new"})))
        }

        async fn delete_doc(
            Path((_db, id)): Path<(String, String)>,
            Query(q): Query<HashMap<String, String>>,
        ) -> (AxumStatus, Json<Value>) {
            if id == "missing" {
                return (AxumStatus::NOT_FOUND, Json(json!({"error": "not_found"})));
            }
            assert_eq!(q.get("rev").map(String::as_str), Some("2-abc"));
            (AxumStatus::OK, Json(json!({"ok": true})))
        }

        let router = Router::new()
            .route("/", get(root))
            .route("/:db", get(head_db).put(put_db))
            .route("/:db/:id", get(get_doc).put(put_doc).delete(delete_doc));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router.into_make_service()).await.unwrap();
        });
        NodeUrl::parse(&format!("http://{}", addr)).unwrap()
    }

    fn client() -> CouchClient {
        CouchClient::new(Credentials::new("admin", "password"), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_server_info() {
        let node = spawn_fake_couch().await;
        let info = client().server_info(&node).await.unwrap();
        assert_eq!(info.version, "3.3.3");
        assert_eq!(info.banner.as_deref(), Some("Welcome"));
    }

    #[tokio::test]
    async fn test_database_exists_and_create() {
        let node = spawn_fake_couch().await;
        let c = client();
        assert!(c.database_exists(&node, "pdfs").await.unwrap());
        assert!(!c.database_exists(&node, "orders").await.unwrap());
        c.create_database(&node, "orders").await.unwrap();
        c.create_database(&node, "pdfs").await.unwrap();
    }

    #[tokio::test]
    async fn test_get_document_present_and_absent() {
        let node = spawn_fake_couch().await;
        let c = client();
        let doc = c
            .get_document(&node, "_replicator", "primary_to_http_r:5984__pdfs")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["_rev"], "2-abc");
        assert!(c.get_document(&node, "_replicator", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_document_conflict() {
        let node = spawn_fake_couch().await;
        let c = client();
        let rev = c
            .put_document(&node, "_replicator", "t1", &json!({"source": "x"}))
            .await
            .unwrap();
        assert_eq!(rev, "1-new");

        let err = c
            .put_document(&node, "_replicator", "t1", &json!({"_rev": "stale"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::WriteConflict { ref task_id } if task_id == "t1"));
    }

    #[tokio::test]
    async fn test_delete_document() {
        let node = spawn_fake_couch().await;
        let c = client();
        c.delete_document(&node, "_replicator", "t1", "2-abc").await.unwrap();
        let err = c
            .delete_document(&node, "_replicator", "missing", "1-a")
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_documents() {
        let node = spawn_fake_couch().await;
        let docs = client().list_documents(&node, "_replicator").await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["_id"], "a");
    }

    #[tokio::test]
    async fn test_unreachable_node_is_connectivity_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let node = NodeUrl::parse(&format!("http://{}", addr)).unwrap();
        let err = client().server_info(&node).await.unwrap_err();
        assert!(matches!(err, ReplError::Connectivity { .. }));
    }

    #[test]
    fn test_url_encodes_segments() {
        let node = NodeUrl::parse("http://couch:5984/").unwrap();
        let url = CouchClient::url(&node, &["_replicator", "a/b"]).unwrap();
        assert_eq!(url.as_str(), "http://couch:5984/_replicator/a%2Fb");
    }
}
