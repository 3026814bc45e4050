use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Error type shared by the search, index and harvest layers
#[derive(Debug, Error)]
pub enum SearchEngineError {
    /// Field name outside the known field set
    #[error("Invalid field: {0}")]
    InvalidField(String),

    /// Missing or malformed request parameter
    #[error("Invalid argument: {0}")]
    ArgumentError(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The engine answered with an error status or an unexpected body
    #[error("Search engine error: {0}")]
    EngineError(String),

    /// Engine-side or client-side timeout
    #[error("Search engine timed out: {0}")]
    Timeout(String),

    /// HTTP transport errors
    #[error("Transport error: {0}")]
    TransportError(#[from] reqwest::Error),

    /// Relational source errors
    #[error("Source database error: {0}")]
    SourceError(#[from] sqlx::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Harvest orchestration errors
    #[error("Harvest error: {0}")]
    HarvestError(String),
}

impl SearchEngineError {
    pub fn invalid_field(field: impl Into<String>) -> Self {
        SearchEngineError::InvalidField(field.into())
    }

    pub fn argument(msg: impl Into<String>) -> Self {
        SearchEngineError::ArgumentError(msg.into())
    }

    pub fn engine(msg: impl Into<String>) -> Self {
        SearchEngineError::EngineError(msg.into())
    }

    /// Errors caused by the caller's input, raised before any engine call.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            SearchEngineError::InvalidField(_) | SearchEngineError::ArgumentError(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            SearchEngineError::Timeout(_) => true,
            SearchEngineError::TransportError(e) => e.is_timeout(),
            _ => false,
        }
    }
}

impl SearchEngineError {
    /// HTTP status the API boundary answers with
    pub fn status_code(&self) -> StatusCode {
        if self.is_caller_error() {
            StatusCode::BAD_REQUEST
        } else if self.is_timeout() {
            StatusCode::GATEWAY_TIMEOUT
        } else {
            match self {
                SearchEngineError::EngineError(_) | SearchEngineError::TransportError(_) => {
                    StatusCode::BAD_GATEWAY
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            }
        }
    }
}

impl IntoResponse for SearchEngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), message = %message, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), message = %message, "Rejected request");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, SearchEngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_errors() {
        assert!(SearchEngineError::invalid_field("composer").is_caller_error());
        assert!(SearchEngineError::argument("missing page").is_caller_error());
        assert!(!SearchEngineError::engine("boom").is_caller_error());
        assert!(!SearchEngineError::ConfigError("no url".into()).is_caller_error());
    }

    #[test]
    fn test_display() {
        let err = SearchEngineError::invalid_field("composer");
        assert_eq!(err.to_string(), "Invalid field: composer");
        assert!(SearchEngineError::Timeout("10s".into()).is_timeout());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            SearchEngineError::invalid_field("composer").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            SearchEngineError::Timeout("10s".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(SearchEngineError::engine("boom").status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            SearchEngineError::HarvestError("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
