//! HTTP error handling for the transfer API.
//!
//! Core errors become JSON bodies carrying the stable error code, so clients
//! can rebuild the original variant and decide whether to retry.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// API error response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code (e.g., "E001" for an unknown task)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human-readable error message
    pub message: String,
    /// Additional details about the error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    /// Create a new API error with a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            details: None,
        }
    }

    /// Create a new API error with code and message.
    #[must_use]
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
            details: None,
        }
    }

    /// Add details to the error.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Create an internal server error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(message)
    }

    /// Get the HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self.code.as_deref() {
            Some("E001" | "E010") => StatusCode::NOT_FOUND,
            Some("E002") => StatusCode::RANGE_NOT_SATISFIABLE,
            Some("E003") => StatusCode::UNPROCESSABLE_ENTITY,
            Some("E004" | "E007") => StatusCode::CONFLICT,
            Some("E005") => StatusCode::INSUFFICIENT_STORAGE,
            Some("E006") => StatusCode::PAYLOAD_TOO_LARGE,
            Some("E008") => StatusCode::TOO_MANY_REQUESTS,
            Some("E009") => StatusCode::LOCKED,
            Some("E011") => StatusCode::BAD_REQUEST,
            Some("E012") => StatusCode::SERVICE_UNAVAILABLE,
            Some("E014") => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(code = ?self.code, message = %self.message, "Request failed");
        }
        (status, Json(self)).into_response()
    }
}

impl From<crate::error::Error> for ApiError {
    fn from(err: crate::error::Error) -> Self {
        Self {
            code: err.code().map(String::from),
            message: err.to_string(),
            details: err.suggestion().map(String::from),
        }
    }
}

/// Result type for web handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_status_code_mapping() {
        let cases = [
            ("E001", StatusCode::NOT_FOUND),
            ("E002", StatusCode::RANGE_NOT_SATISFIABLE),
            ("E003", StatusCode::UNPROCESSABLE_ENTITY),
            ("E004", StatusCode::CONFLICT),
            ("E005", StatusCode::INSUFFICIENT_STORAGE),
            ("E006", StatusCode::PAYLOAD_TOO_LARGE),
            ("E007", StatusCode::CONFLICT),
            ("E008", StatusCode::TOO_MANY_REQUESTS),
            ("E009", StatusCode::LOCKED),
            ("E010", StatusCode::NOT_FOUND),
            ("E011", StatusCode::BAD_REQUEST),
            ("E012", StatusCode::SERVICE_UNAVAILABLE),
            ("E013", StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (code, status) in cases {
            assert_eq!(ApiError::with_code(code, "").status_code(), status, "{code}");
        }
        assert_eq!(
            ApiError::new("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_from_core_error() {
        let api_err: ApiError = Error::TaskPaused("abc".into()).into();
        assert_eq!(api_err.code.as_deref(), Some("E009"));
        assert!(api_err.message.contains("abc"));
        assert!(api_err.details.is_some());
    }

    #[test]
    fn test_serialization() {
        let err = ApiError::with_code("E001", "Task not found");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"code\":\"E001\""));
        assert!(!json.contains("details"));

        let with_details = ApiError::new("x").with_details("more");
        let back: ApiError =
            serde_json::from_str(&serde_json::to_string(&with_details).unwrap()).unwrap();
        assert_eq!(back, with_details);
    }
}
