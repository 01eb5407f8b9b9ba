use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::io;
use std::path::PathBuf;

/// Errors raised while bootstrapping the listener
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Deployment script not found: {}", .0.display())]
    MissingExecutable(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// Helper type for Results that use ListenerError
pub type Result<T> = std::result::Result<T, ListenerError>;

/// Request-level failures. Every variant maps to exactly one HTTP response.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Not Found")]
    NotFound,

    #[error("No content")]
    EmptyBody,

    #[error("Invalid JSON")]
    InvalidPayload,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Internal(String),
}

impl WebhookError {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::EmptyBody | Self::InvalidPayload => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            // Operators read these, the endpoint is not a public API
            Self::Internal(message) => (
                status,
                Json(json!({
                    "status": "error",
                    "message": message,
                })),
            )
                .into_response(),
            other => (status, other.to_string()).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_taxonomy_to_status_codes() {
        assert_eq!(WebhookError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(WebhookError::EmptyBody.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            WebhookError::InvalidPayload.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            WebhookError::Unauthorized.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            WebhookError::Internal("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn missing_executable_message_names_the_path() {
        let err = ListenerError::MissingExecutable(PathBuf::from("/opt/deploy.sh"));
        assert_eq!(err.to_string(), "Deployment script not found: /opt/deploy.sh");
    }
}
