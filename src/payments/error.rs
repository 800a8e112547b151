use thiserror::Error;

use crate::error::{AppError, AppErrorKind, ExternalError, ValidationError};

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Request declined: {message}")]
    Declined {
        message: String,
        provider_code: Option<String>,
    },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Gateway timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Rate limit exceeded: {message}")]
    RateLimited {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("Provider error: provider={provider}, message={message}")]
    Provider {
        provider: String,
        message: String,
        provider_code: Option<String>,
        retryable: bool,
    },

    #[error("Circuit open for {dependency}, retry in {retry_after_secs}s")]
    CircuitOpen {
        dependency: String,
        retry_after_secs: u64,
    },
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Validation { .. } => false,
            GatewayError::Declined { .. } => false,
            GatewayError::Network { .. } => true,
            GatewayError::Timeout { .. } => true,
            GatewayError::RateLimited { .. } => true,
            GatewayError::Provider { retryable, .. } => *retryable,
            GatewayError::CircuitOpen { .. } => true,
        }
    }

    /// The request may or may not have reached the gateway; only a webhook
    /// or reconciliation can tell what happened.
    pub fn is_ambiguous(&self) -> bool {
        match self {
            GatewayError::Network { .. } | GatewayError::Timeout { .. } => true,
            GatewayError::Provider { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Whether this outcome says the dependency itself is unhealthy.
    /// Rejections of a well-formed call (validation, decline) do not.
    pub fn counts_as_dependency_failure(&self) -> bool {
        match self {
            GatewayError::Network { .. }
            | GatewayError::Timeout { .. }
            | GatewayError::RateLimited { .. } => true,
            GatewayError::Provider { retryable, .. } => *retryable,
            GatewayError::Validation { .. }
            | GatewayError::Declined { .. }
            | GatewayError::CircuitOpen { .. } => false,
        }
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            GatewayError::Validation { .. } => 400,
            GatewayError::Declined { .. } => 502,
            GatewayError::Network { .. } => 502,
            GatewayError::Timeout { .. } => 504,
            GatewayError::RateLimited { .. } => 502,
            GatewayError::Provider { .. } => 502,
            GatewayError::CircuitOpen { .. } => 503,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            GatewayError::Validation { message, .. } => message.clone(),
            GatewayError::Declined { .. } => "The payment gateway declined the request".to_string(),
            GatewayError::Network { .. } => {
                "Payment gateway is temporarily unavailable".to_string()
            }
            GatewayError::Timeout { .. } => "Payment gateway did not respond in time".to_string(),
            GatewayError::RateLimited { .. } => {
                "Too many requests to payment gateway. Please retry shortly".to_string()
            }
            GatewayError::Provider { .. } => "Payment gateway returned an error".to_string(),
            GatewayError::CircuitOpen { .. } => {
                "Payment gateway is temporarily disabled after repeated failures".to_string()
            }
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        let kind = match err {
            GatewayError::Validation { message, field } => {
                AppErrorKind::Validation(ValidationError::InvalidField {
                    field: field.unwrap_or_else(|| "request".to_string()),
                    reason: message,
                })
            }
            GatewayError::CircuitOpen {
                dependency,
                retry_after_secs,
            } => AppErrorKind::External(ExternalError::CircuitOpen {
                dependency,
                retry_after_secs,
            }),
            GatewayError::Timeout { timeout_secs } => AppErrorKind::External(ExternalError::Timeout {
                service: "payment gateway".to_string(),
                timeout_secs,
            }),
            other => AppErrorKind::External(ExternalError::Gateway {
                provider: "adyen".to_string(),
                is_retryable: other.is_retryable(),
                message: other.to_string(),
            }),
        };
        AppError::new(kind)
    }
}
