//! The taxonomic error kinds every operation in this crate can fail with.
//!
//! Variant names match the error *kinds* callers are expected to branch on
//! (not the message text), so a tool-surface handler can match on
//! `SupervisorError::NotFound { .. }` regardless of which component raised it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("session not found: {id}")]
    NotFound { id: String },

    #[error("owner {caller} does not have access to session {id}")]
    AccessDenied { id: String, caller: String },

    #[error("cwd not allowed: {path}")]
    CwdDenied { path: String },

    #[error("admission denied: {reason}")]
    AdmissionDenied { reason: String },

    #[error("unknown provider: {name}")]
    UnknownProvider { name: String },

    #[error("session {id} is not ready yet")]
    NotReady { id: String },

    #[error("input queue has already ended")]
    QueueEnded,

    #[error("session {id} is busy")]
    Busy { id: String },

    #[error("invalid state for {id}: expected {expected}, found {found}")]
    InvalidState {
        id: String,
        expected: String,
        found: String,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("rpc error: {0}")]
    RpcError(String),

    #[error("process exited: {0}")]
    ProcessExit(String),

    #[error("permission request {id} timed out")]
    PermissionTimeout { id: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
