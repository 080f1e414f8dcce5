use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Errors produced by the session client and its request mappers.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Credentials were rejected, the session expired, or no session is held.
    #[error("authentication failed: {message}")]
    Authentication {
        message: String,
        status: Option<StatusCode>,
        data: Option<Value>,
    },

    /// Remote rejected a request and described the failure in its error body.
    #[error("remote error ({status}): {message}")]
    Remote {
        message: String,
        status: StatusCode,
        data: Option<Value>,
    },

    /// Non-success response whose body could not be interpreted.
    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    /// HTTP transport failure.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Websocket transport failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// TLS connector could not be built.
    #[error("tls error: {0}")]
    Tls(#[from] native_tls::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Remote answered in a way the session contract does not allow.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// `connect` was called while a session is live or being established.
    #[error("client is already connected")]
    AlreadyConnected,

    /// A pending connect was superseded by `disconnect`.
    #[error("connect cancelled by disconnect")]
    Cancelled,
}

impl SessionError {
    /// Canonical error for missing or rejected sessions.
    pub fn unauthorized() -> Self {
        Self::Authentication {
            message: "unauthorized".to_string(),
            status: Some(StatusCode::UNAUTHORIZED),
            data: None,
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// HTTP status attached to the error, when there is one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Authentication { status, .. } => *status,
            Self::Remote { status, .. } | Self::HttpStatus { status, .. } => Some(*status),
            Self::Transport(err) => err.status(),
            _ => None,
        }
    }
}
