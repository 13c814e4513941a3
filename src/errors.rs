//! Error types for the capmesh registry, proxy, and wire client.
//!
//! Library code returns these typed errors; the axum layer converts
//! [`RegistryError`] into the wire error envelope
//! `{"status": "error", "kind": ..., "message": ...}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors raised by registry protocol operations.
///
/// Absence of a matching provider for a requirement is NOT an error; it is
/// an unresolved (`null`) entry in the resolution map.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A registration payload failed validation. The store is unchanged.
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// Heartbeat (or fast heartbeat) for an agent the registry does not
    /// know, typically one evicted after missing its heartbeats. The
    /// caller must re-register with its full tool set.
    #[error("Unknown agent: {agent_id}")]
    UnknownAgent { agent_id: String },

    /// State snapshot persistence failed. Serving continues; durability
    /// is degraded until a snapshot succeeds again.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

impl RegistryError {
    /// Shorthand for a validation failure on a named field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        RegistryError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Wire `kind` discriminator for the error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::Validation { .. } => "ValidationError",
            RegistryError::UnknownAgent { .. } => "UnknownAgent",
            RegistryError::Snapshot(_) => "SnapshotError",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::Validation { .. } => StatusCode::BAD_REQUEST,
            RegistryError::UnknownAgent { .. } => StatusCode::GONE,
            RegistryError::Snapshot(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "status": "error",
            "kind": self.kind(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// Errors from the snapshot persistence layer.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// SQLite open/exec failure.
    #[error("Snapshot storage error: {message}")]
    Storage { message: String },

    /// Snapshot payload could not be encoded or decoded.
    #[error("Snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for SnapshotError {
    fn from(err: rusqlite::Error) -> Self {
        SnapshotError::Storage {
            message: err.to_string(),
        }
    }
}

/// Errors raised by the stateless invocation proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The provider endpoint could not be reached (connect failure, DNS,
    /// reset, or a transport the proxy does not speak). The caller should
    /// re-resolve and retry at most once.
    #[error("Provider unreachable at {endpoint}: {reason}")]
    ProviderUnreachable { endpoint: String, reason: String },

    /// The caller-supplied deadline elapsed before the provider answered.
    #[error("Invocation of {tool_name} timed out after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    /// The provider answered but the response was not a valid call
    /// envelope, or it carried an error result.
    #[error("Provider protocol error: {message}")]
    Protocol { message: String },

    /// The provider reported a tool-level failure (`is_error` result).
    #[error("Tool call failed: {message}")]
    Call { message: String },

    /// Request or response body could not be serialized.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the typed registry wire client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network-level failure talking to the registry.
    #[error(transparent)]
    Network(#[from] reqwest::Error),

    /// Response body could not be decoded.
    #[error(transparent)]
    Decode(#[from] serde_json::Error),

    /// The registry answered with an error envelope.
    #[error("Registry error ({status}): {message}")]
    Registry { status: u16, message: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
