//! Unified error handling for the payments backend
//!
//! Every layer (gateway, cache, ledger, orchestrator, webhooks) has its own error
//! enum and converts into [`AppError`], which carries the HTTP status mapping,
//! a machine-readable [`ErrorCode`] and a user-facing message.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for programmatic handling by API clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Validation errors (400)
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
    #[serde(rename = "INVALID_AMOUNT")]
    InvalidAmount,
    #[serde(rename = "INVALID_CURRENCY")]
    InvalidCurrency,
    #[serde(rename = "AMOUNT_EXCEEDS_LIMIT")]
    AmountExceedsLimit,

    // Access errors (401, 403)
    #[serde(rename = "AUTHENTICATION_REQUIRED")]
    AuthenticationRequired,
    #[serde(rename = "INVALID_SIGNATURE")]
    InvalidSignature,
    #[serde(rename = "FORBIDDEN")]
    Forbidden,

    // Domain errors (404, 409)
    #[serde(rename = "TRANSACTION_NOT_FOUND")]
    TransactionNotFound,
    #[serde(rename = "REFUND_NOT_FOUND")]
    RefundNotFound,
    #[serde(rename = "JOB_NOT_FOUND")]
    JobNotFound,
    #[serde(rename = "INVALID_STATE_TRANSITION")]
    InvalidStateTransition,
    #[serde(rename = "CONCURRENT_MODIFICATION")]
    ConcurrentModification,
    #[serde(rename = "IDEMPOTENCY_CONFLICT")]
    IdempotencyConflict,

    // External errors (502, 503, 504)
    #[serde(rename = "PAYMENT_GATEWAY_ERROR")]
    PaymentGatewayError,
    #[serde(rename = "CIRCUIT_OPEN")]
    CircuitOpen,
    #[serde(rename = "EXTERNAL_SERVICE_TIMEOUT")]
    ExternalServiceTimeout,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CACHE_ERROR")]
    CacheError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
}

/// Malformed or out-of-range input, rejected before any mutation
#[derive(Debug, Clone)]
pub enum ValidationError {
    /// Amount is not a positive integer in minor units
    InvalidAmount { amount: String, reason: String },
    /// Currency is not a supported ISO-4217 code
    InvalidCurrency { currency: String, reason: String },
    /// Required field missing
    MissingField { field: String },
    /// Field present but malformed
    InvalidField { field: String, reason: String },
    /// Requested amount is above what the transaction allows
    AmountExceedsLimit {
        field: String,
        requested: i64,
        limit: i64,
    },
}

/// Authentication / authorization failures
#[derive(Debug, Clone)]
pub enum AccessError {
    /// No usable identity on the request
    Unauthenticated { reason: String },
    /// Webhook signature did not verify
    InvalidSignature { reason: String },
    /// Identity is known but not allowed to perform the action
    Forbidden { reason: String },
}

/// Business rule violations on existing resources
#[derive(Debug, Clone)]
pub enum DomainError {
    TransactionNotFound { transaction_id: String },
    RefundNotFound { refund_id: String },
    /// No waiting job with this id (it may already be running or finished)
    JobNotFound { job_id: String },
    /// Operation not permitted from the transaction's current status
    InvalidStateTransition {
        transaction_id: String,
        current: String,
        action: String,
    },
    /// Optimistic concurrency check failed
    ConcurrentModification { transaction_id: String },
    /// Another request currently holds the idempotency key
    IdempotencyInFlight { key: String },
}

/// Infrastructure-level errors (database, cache, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
    Cache { message: String },
    Configuration { message: String },
    Internal { message: String },
}

/// External service errors
#[derive(Debug, Clone)]
pub enum ExternalError {
    /// Payment gateway returned an error or could not be reached
    Gateway {
        provider: String,
        message: String,
        is_retryable: bool,
    },
    /// Circuit breaker is open; the dependency was not contacted
    CircuitOpen {
        dependency: String,
        retry_after_secs: u64,
    },
    /// External service timeout
    Timeout { service: String, timeout_secs: u64 },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Validation(ValidationError),
    Access(AccessError),
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn validation(error: ValidationError) -> Self {
        Self::new(AppErrorKind::Validation(error))
    }

    pub fn unauthenticated(reason: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Access(AccessError::Unauthenticated {
            reason: reason.into(),
        }))
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Access(AccessError::Forbidden {
            reason: reason.into(),
        }))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Infrastructure(InfrastructureError::Internal {
            message: message.into(),
        }))
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Validation(_) => 400,
            AppErrorKind::Access(err) => match err {
                AccessError::Unauthenticated { .. } => 401,
                AccessError::InvalidSignature { .. } => 401,
                AccessError::Forbidden { .. } => 403,
            },
            AppErrorKind::Domain(err) => match err {
                DomainError::TransactionNotFound { .. } => 404,
                DomainError::RefundNotFound { .. } => 404,
                DomainError::JobNotFound { .. } => 404,
                DomainError::InvalidStateTransition { .. } => 409,
                DomainError::ConcurrentModification { .. } => 409,
                DomainError::IdempotencyInFlight { .. } => 409,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::Gateway { .. } => 502,
                ExternalError::CircuitOpen { .. } => 503,
                ExternalError::Timeout { .. } => 504,
            },
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidAmount { .. } => ErrorCode::InvalidAmount,
                ValidationError::InvalidCurrency { .. } => ErrorCode::InvalidCurrency,
                ValidationError::AmountExceedsLimit { .. } => ErrorCode::AmountExceedsLimit,
                ValidationError::MissingField { .. } | ValidationError::InvalidField { .. } => {
                    ErrorCode::ValidationError
                }
            },
            AppErrorKind::Access(err) => match err {
                AccessError::Unauthenticated { .. } => ErrorCode::AuthenticationRequired,
                AccessError::InvalidSignature { .. } => ErrorCode::InvalidSignature,
                AccessError::Forbidden { .. } => ErrorCode::Forbidden,
            },
            AppErrorKind::Domain(err) => match err {
                DomainError::TransactionNotFound { .. } => ErrorCode::TransactionNotFound,
                DomainError::RefundNotFound { .. } => ErrorCode::RefundNotFound,
                DomainError::JobNotFound { .. } => ErrorCode::JobNotFound,
                DomainError::InvalidStateTransition { .. } => ErrorCode::InvalidStateTransition,
                DomainError::ConcurrentModification { .. } => ErrorCode::ConcurrentModification,
                DomainError::IdempotencyInFlight { .. } => ErrorCode::IdempotencyConflict,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Cache { .. } => ErrorCode::CacheError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
                InfrastructureError::Internal { .. } => ErrorCode::InternalError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::Gateway { .. } => ErrorCode::PaymentGatewayError,
                ExternalError::CircuitOpen { .. } => ErrorCode::CircuitOpen,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
                ValidationError::InvalidCurrency { currency, reason } => {
                    format!("Invalid currency '{}': {}", currency, reason)
                }
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
                ValidationError::InvalidField { field, reason } => {
                    format!("Invalid value for '{}': {}", field, reason)
                }
                ValidationError::AmountExceedsLimit {
                    field,
                    requested,
                    limit,
                } => format!(
                    "Field '{}' requests {} but at most {} is available",
                    field, requested, limit
                ),
            },
            AppErrorKind::Access(err) => match err {
                AccessError::Unauthenticated { reason } => {
                    format!("Authentication required: {}", reason)
                }
                AccessError::InvalidSignature { .. } => "Invalid signature".to_string(),
                AccessError::Forbidden { reason } => format!("Access denied: {}", reason),
            },
            AppErrorKind::Domain(err) => match err {
                DomainError::TransactionNotFound { transaction_id } => {
                    format!("Transaction '{}' not found", transaction_id)
                }
                DomainError::RefundNotFound { refund_id } => {
                    format!("Refund '{}' not found", refund_id)
                }
                DomainError::JobNotFound { job_id } => {
                    format!("No waiting job '{}'", job_id)
                }
                DomainError::InvalidStateTransition {
                    transaction_id,
                    current,
                    action,
                } => format!(
                    "Cannot {} transaction '{}' while it is {}",
                    action, transaction_id, current
                ),
                DomainError::ConcurrentModification { transaction_id } => format!(
                    "Transaction '{}' was modified concurrently. Please retry",
                    transaction_id
                ),
                DomainError::IdempotencyInFlight { .. } => {
                    "A request with this idempotency key is already being processed".to_string()
                }
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::Gateway {
                    provider,
                    is_retryable,
                    ..
                } => {
                    if *is_retryable {
                        format!(
                            "Payment gateway ({}) is temporarily unavailable. Please try again",
                            provider
                        )
                    } else {
                        "Payment processing failed. Please contact support".to_string()
                    }
                }
                ExternalError::CircuitOpen {
                    dependency,
                    retry_after_secs,
                } => format!(
                    "{} is currently unavailable. Please try again in {} seconds",
                    dependency, retry_after_secs
                ),
                ExternalError::Timeout {
                    service,
                    timeout_secs,
                } => format!(
                    "{} request timed out after {} seconds. Please try again",
                    service, timeout_secs
                ),
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Validation(_) | AppErrorKind::Access(_) => false,
            AppErrorKind::Domain(err) => matches!(
                err,
                DomainError::ConcurrentModification { .. } | DomainError::IdempotencyInFlight { .. }
            ),
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Cache { .. } => true,
                InfrastructureError::Configuration { .. } => false,
                InfrastructureError::Internal { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::Gateway { is_retryable, .. } => *is_retryable,
                ExternalError::CircuitOpen { .. } => true,
                ExternalError::Timeout { .. } => true,
            },
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(context) => write!(f, "{} ({})", self.user_message(), context),
            None => write!(f, "{}", self.user_message()),
        }
    }
}

impl std::error::Error for AppError {}

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;
