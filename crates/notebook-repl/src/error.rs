//! Error types for the replication orchestrator.

use thiserror::Error;

/// Errors that can occur while driving replication against the document store.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Node unreachable, refused the connection, or timed out.
    #[error("connectivity error on {node}: {msg}")]
    Connectivity {
        /// Base URL of the node that could not be reached.
        node: String,
        /// Error message describing the issue.
        msg: String,
    },

    /// The control database rejected a task write because its revision was stale.
    #[error("write conflict on replication task {task_id}")]
    WriteConflict {
        /// Id of the task document that was raced.
        task_id: String,
    },

    /// A document or database does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing resource.
        what: String,
    },

    /// Missing or invalid configuration or request parameter.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The store answered with a status the orchestrator does not expect.
    #[error("document store returned {status}: {msg}")]
    Store {
        /// HTTP status code.
        status: u16,
        /// Body or reason returned by the store.
        msg: String,
    },

    /// A one-shot task reached a failing terminal state.
    #[error("replication task {task_id} ended in state {state}")]
    TaskFailed {
        /// Id of the one-shot task.
        task_id: String,
        /// Terminal state reported by the store.
        state: String,
    },

    /// The caller cancelled a blocking wait.
    #[error("operation cancelled")]
    Cancelled,

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),
}

impl ReplError {
    /// True for errors that map to a client mistake rather than a server fault.
    pub fn is_configuration(&self) -> bool {
        matches!(self, ReplError::Configuration(_))
    }
}

/// Result alias used across the orchestrator.
pub type Result<T> = std::result::Result<T, ReplError>;
