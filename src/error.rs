use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Every port in `[base_port, max_port]` already has a lease.
    #[error("port pool exhausted ({base}..={max})")]
    PoolExhausted { base: u16, max: u16 },

    #[error("media server instance failed to start for station {station}: {reason}")]
    InstanceStartFailed { station: String, reason: String },

    #[error("unauthorized source on mount {mount}")]
    Unauthorized { mount: String },

    #[error("station {station} has no playable tracks")]
    NoPlayableTracks { station: String },

    #[error("origin registry unreachable: {0}")]
    OriginUnreachable(String),

    /// The persisted status already equals the requested one.
    #[error("station {station} is already {status}")]
    DuplicateTransition { station: String, status: String },

    #[error("station not found: {0}")]
    StationNotFound(String),

    #[error("auto dj is disabled for station {0}")]
    AutoDjDisabled(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("database error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential hashing error: {0}")]
    Credential(#[from] bcrypt::BcryptError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::Internal(format!("blocking task failed: {err}"))
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::PoolExhausted { .. } => StatusCode::CONFLICT,
            EngineError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            EngineError::StationNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::NoPlayableTracks { .. } | EngineError::AutoDjDisabled(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EngineError::DuplicateTransition { .. } => StatusCode::CONFLICT,
            EngineError::InstanceStartFailed { .. } | EngineError::OriginUnreachable(_) => {
                tracing::warn!("{self}");
                StatusCode::SERVICE_UNAVAILABLE
            }
            EngineError::Store(e) => {
                tracing::error!("database error: {e:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            EngineError::Io(e) => {
                tracing::error!("IO error: {e:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            EngineError::Credential(e) => {
                tracing::error!("credential hashing error: {e:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            EngineError::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        // Never echo database/IO internals back to the caller.
        let message = match status {
            StatusCode::INTERNAL_SERVER_ERROR => "internal error".to_string(),
            _ => self.to_string(),
        };

        (status, Json(json!({ "ok": false, "error": message }))).into_response()
    }
}
