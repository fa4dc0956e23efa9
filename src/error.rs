use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Core error kinds. Handlers convert these into `{code, message}` JSON
/// bodies; internal detail stays in the logs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("precision mismatch: {ours} vs {theirs}")]
    PrecisionMismatch { ours: u8, theirs: u8 },

    /// Corrupt sketch bytes, wrong lengths, unknown schema versions.
    #[error("format error: {0}")]
    Format(String),

    #[error("backend error: {0}")]
    Backend(#[from] clickhouse::error::Error),

    #[error("operation canceled")]
    Canceled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Machine-readable code carried in API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::InvalidInput(_) => "invalid_input",
            Error::PrecisionMismatch { .. } => "precision_mismatch",
            Error::Format(_) => "format_error",
            Error::Backend(_) => "backend_error",
            Error::Canceled => "canceled",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Canceled => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // Backend details never leak to clients.
            Error::Backend(e) => {
                tracing::error!("backend error: {e}");
                "storage backend unavailable".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "code": self.code(), "message": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::NotFound("metric".into()).code(), "not_found");
        assert_eq!(Error::InvalidInput("bad".into()).code(), "invalid_input");
        assert_eq!(
            Error::PrecisionMismatch { ours: 14, theirs: 12 }.code(),
            "precision_mismatch"
        );
    }

    #[test]
    fn not_found_maps_to_404() {
        assert_eq!(Error::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::InvalidInput("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
