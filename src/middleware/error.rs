//! Error response formatting
//!
//! Every [`AppError`] leaves the service as the same JSON shape with its
//! status code, machine-readable code and a user-facing message.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppErrorKind, ErrorCode, ValidationError};

/// Standardized error response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code
    pub error: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Request ID for debugging and support
    pub request_id: Option<String>,

    /// RFC 3339 timestamp of the error
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Whether the client should retry the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl ErrorResponse {
    pub fn from_app_error(error: &AppError) -> Self {
        Self {
            error: error.error_code(),
            message: error.user_message(),
            request_id: error.request_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
            details: details_for(error),
            retryable: Some(error.is_retryable()),
        }
    }
}

fn details_for(error: &AppError) -> Option<serde_json::Value> {
    match &error.kind {
        AppErrorKind::Validation(ValidationError::MissingField { field })
        | AppErrorKind::Validation(ValidationError::InvalidField { field, .. }) => {
            Some(serde_json::json!({ "field": field }))
        }
        AppErrorKind::Validation(ValidationError::AmountExceedsLimit {
            field,
            requested,
            limit,
        }) => Some(serde_json::json!({
            "field": field,
            "requested": requested,
            "limit": limit,
        })),
        _ => None,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status_code =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status_code.is_server_error() {
            tracing::error!(
                error = %self,
                request_id = ?self.request_id,
                status = %status_code.as_u16(),
                "Server error occurred"
            );
        } else {
            tracing::warn!(
                error = %self,
                request_id = ?self.request_id,
                status = %status_code.as_u16(),
                "Client error occurred"
            );
        }

        let error_response = ErrorResponse::from_app_error(&self);
        (status_code, Json(error_response)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DomainError, ExternalError};

    #[test]
    fn test_error_response_from_app_error() {
        let error = AppError::new(AppErrorKind::Domain(DomainError::TransactionNotFound {
            transaction_id: "tx-1".to_string(),
        }))
        .with_request_id("req-1");

        let response = ErrorResponse::from_app_error(&error);
        assert_eq!(response.error, ErrorCode::TransactionNotFound);
        assert_eq!(response.request_id.as_deref(), Some("req-1"));
        assert_eq!(response.retryable, Some(false));
        assert!(response.details.is_none());
    }

    #[test]
    fn test_amount_limit_carries_details() {
        let error = AppError::validation(ValidationError::AmountExceedsLimit {
            field: "amount".to_string(),
            requested: 6000,
            limit: 5000,
        });
        let details = ErrorResponse::from_app_error(&error).details.unwrap();
        assert_eq!(details["limit"], 5000);
    }

    #[test]
    fn test_into_response_uses_status_code() {
        let response = AppError::new(AppErrorKind::External(ExternalError::CircuitOpen {
            dependency: "adyen".to_string(),
            retry_after_secs: 10,
        }))
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
