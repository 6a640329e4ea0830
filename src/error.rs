//! Centralized error handling module
//!
//! Provides unified error types and HTTP response mapping for the entire application.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum AppError {
    /// No reading has ever been cached and the upstream fetch failed
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Threshold ordering or color bands are malformed
    #[error("Invalid policy configuration: {0}")]
    InvalidPolicyConfiguration(String),
}

/// Standardized error response format
#[derive(Serialize)]
pub struct ErrorResponse {
    /// Unique correlation ID for tracing
    pub correlation_id: String,
    /// Error type classification
    pub error_type: String,
    /// Human-readable error message (safe for clients)
    pub message: String,
    /// HTTP status code
    pub status_code: u16,
    /// Timestamp of the error
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error_type: &str, message: &str, status_code: StatusCode) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            error_type: error_type.to_string(),
            message: message.to_string(),
            status_code: status_code.as_u16(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::UpstreamUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "NO_DATA", msg.as_str())
            }
            AppError::InvalidPolicyConfiguration(msg) => {
                // Rejected at startup; reaching a handler means a wiring bug
                error!(error = %msg, "Policy error surfaced at request time");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred",
                )
            }
        };

        let error_response = ErrorResponse::new(error_type, message, status);

        error!(
            correlation_id = %error_response.correlation_id,
            error_type = %error_type,
            status_code = %status.as_u16(),
            "Error response generated"
        );

        HttpResponse::build(status).json(error_response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InvalidPolicyConfiguration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_unavailable_status() {
        let error = AppError::UpstreamUnavailable("timed out".to_string());
        assert_eq!(error.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_policy_error_status() {
        let error = AppError::InvalidPolicyConfiguration("rapid <= stable".to_string());
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_error_response_format() {
        let response =
            ErrorResponse::new("NO_DATA", "No glucose reading available", StatusCode::SERVICE_UNAVAILABLE);
        assert!(!response.correlation_id.is_empty());
        assert_eq!(response.error_type, "NO_DATA");
        assert_eq!(response.message, "No glucose reading available");
        assert_eq!(response.status_code, 503);
    }
}
