//! Unified gateway error taxonomy with structured HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use agentdeck_runner::RunnerError;

/// Gateway error type. Every fallible core operation returns this; the
/// HTTP layer converts it to a status code and the WebSocket layer to an
/// `error` frame.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("failed to spawn agent: {0}")]
    SpawnFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::SpawnFailed(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(e.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(e.to_string()),
            _ => Self::Internal(e.to_string()),
        }
    }
}

impl From<RunnerError> for GatewayError {
    fn from(e: RunnerError) -> Self {
        match e {
            RunnerError::SpawnFailed(msg) => Self::SpawnFailed(msg),
            RunnerError::BinaryNotFound => Self::SpawnFailed(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(
                component = "http",
                event = "http.error",
                status = status.as_u16(),
                error = %self,
                "Request failed"
            );
        } else {
            warn!(
                component = "http",
                event = "http.client_error",
                status = status.as_u16(),
                error = %self,
                "Request rejected"
            );
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_the_taxonomy() {
        assert_eq!(
            GatewayError::invalid("x").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::not_found("x").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::PermissionDenied("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(GatewayError::conflict("x").status(), StatusCode::CONFLICT);
        assert_eq!(
            GatewayError::internal("x").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn io_errors_map_by_kind() {
        let nf = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(GatewayError::from(nf), GatewayError::NotFound(_)));

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert!(matches!(
            GatewayError::from(denied),
            GatewayError::PermissionDenied(_)
        ));
    }
}
