//! Standardized error handling patterns for registry responses

use crate::error::TransferError;
use reqwest::StatusCode;

/// Standard error handler for HTTP responses
pub struct HttpErrorHandler;

impl HttpErrorHandler {
    /// Turn an unexpected registry status into a [`TransferError::Status`]
    pub fn status_error(status: StatusCode, error_text: &str, context: &str) -> TransferError {
        let message = match status.as_u16() {
            401 => format!("authentication rejected: {}", error_text),
            403 => format!("permission denied: {}", error_text),
            404 => format!("repository or blob not found: {}", error_text),
            408 | 504 => format!("registry timeout: {}", error_text),
            413 => format!("blob too large for registry: {}", error_text),
            416 => format!("requested range not satisfiable: {}", error_text),
            429 => format!("rate limited: {}", error_text),
            500 => format!("registry server error: {}", error_text),
            502 | 503 => format!("registry unavailable: {}", error_text),
            507 => format!("registry out of storage: {}", error_text),
            _ => error_text.to_string(),
        };

        TransferError::Status {
            status: status.as_u16(),
            context: context.to_string(),
            message: message.trim_end_matches(": ").to_string(),
        }
    }

    /// Read the response body (best effort) and build a status error from it
    pub async fn from_response(response: reqwest::Response, context: &str) -> TransferError {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "failed to read error response".to_string());
        Self::status_error(status, error_text.trim(), context)
    }
}

/// Network error categorization and handling
pub struct NetworkErrorHandler;

impl NetworkErrorHandler {
    /// Categorize and format network errors with helpful context
    pub fn handle_network_error(error: &reqwest::Error, context: &str) -> TransferError {
        if error.is_timeout() {
            TransferError::Timeout(format!("{} timeout: {}", context, error))
        } else if error.is_connect() {
            TransferError::Network(format!("connection error during {}: {}", context, error))
        } else if error.is_body() || error.is_decode() {
            TransferError::Network(format!("body error during {}: {}", context, error))
        } else if error.is_builder() {
            TransferError::Validation(format!("invalid {} request: {}", context, error))
        } else {
            TransferError::Network(format!("{} network error: {}", context, error))
        }
    }
}
