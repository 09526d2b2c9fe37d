//! Document-store node identity and credentials.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical base URL of a document-store node, always ending in `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeUrl(String);

impl NodeUrl {
    /// Parse a configured node address. Surrounding whitespace is trimmed and a
    /// trailing slash appended when missing; blank input yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.ends_with('/') {
            Some(Self(trimmed.to_string()))
        } else {
            Some(Self(format!("{}/", trimmed)))
        }
    }

    /// The canonical URL as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// URL of a named database on this node.
    pub fn database_url(&self, db_name: &str) -> String {
        format!("{}{}", self.0, db_name)
    }

    /// Identifier-safe form of the URL used inside task ids.
    pub fn slug(&self) -> String {
        self.0.replace("://", "_").replace('/', "_")
    }

    /// True when `url` points at this node: the bare node URL, or anything
    /// beneath it such as one of its databases.
    pub fn owns_url(&self, url: &str) -> bool {
        url == self.0.trim_end_matches('/') || url.starts_with(&self.0)
    }
}

impl fmt::Display for NodeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Basic-auth credential pair shared by every node in the cluster.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Account name.
    pub username: String,
    /// Account password.
    pub password: String,
}

impl Credentials {
    /// Build a credential pair.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Normalize a configured replica list: trim entries, drop blanks, canonicalize
/// trailing slashes, drop duplicates (first occurrence wins) and drop the
/// primary itself. Configuration order is preserved.
pub fn normalize_replicas<S: AsRef<str>>(raw: &[S], primary: &NodeUrl) -> Vec<NodeUrl> {
    let mut out: Vec<NodeUrl> = Vec::new();
    for entry in raw {
        if let Some(node) = NodeUrl::parse(entry.as_ref()) {
            if &node != primary && !out.contains(&node) {
                out.push(node);
            }
        }
    }
    out
}

/// Split a comma-separated node list as found in the environment.
pub fn split_node_list(raw: &str) -> Vec<String> {
    raw.split(',').map(|s| s.to_string()).collect()
}
