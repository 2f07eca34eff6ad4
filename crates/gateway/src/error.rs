//! Error taxonomy for the gateway core.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors surfaced by the gateway core.
///
/// Registry-level failures map to client errors at the HTTP layer; backend
/// and transport failures map to server errors. Per-backend failures during a
/// broadcast are logged and skipped rather than surfaced.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("backend '{0}' is already running")]
    AlreadyRunning(String),

    #[error("backend '{0}' is not a command backend")]
    WrongKind(String),

    #[error("failed to spawn backend '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("port pool exhausted")]
    PortExhausted,

    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("session not ready")]
    NotReady,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("session closed")]
    SessionClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}
