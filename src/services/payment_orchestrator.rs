//! Payment Orchestrator Service
//!
//! Owns the transaction state machine:
//!
//! ```text
//! pending -> authorized -> captured -> partially_refunded -> refunded
//!    |           |
//!    +-----------+--> failed | cancelled
//! ```
//!
//! Client operations (create, capture, cancel, refund) call the gateway through the
//! circuit breaker; webhook-driven operations apply confirmed gateway outcomes.
//! Every mutation of a transaction happens under its per-id lock and is persisted
//! with an optimistic version check. Only confirmed outcomes change status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::database::error::DatabaseError;
use crate::database::refund_repository::{Refund, RefundReason, RefundRepository, RefundStatus};
use crate::database::transaction_repository::{
    Page, Transaction, TransactionFilter, TransactionMetadata, TransactionRepository,
    TransactionStatus, MAX_METADATA_ENTRIES,
};
use crate::error::{
    AppError, AppErrorKind, DomainError, InfrastructureError, ValidationError,
};
use crate::payments::error::GatewayError;
use crate::payments::provider::PaymentGateway;
use crate::payments::providers::adyen::NotificationRequestItem;
use crate::payments::types::{
    format_major_units, is_valid_currency_code, Amount, CancelRequest, CaptureRequest,
    PaymentMethodInfo, PaymentMethodsQuery, RefundRequest, SessionRequest,
};
use crate::services::audit::{actions, AuditEvent, AuditRecorder};
use crate::services::locks::TransactionLocks;
use crate::services::notification::{NotificationEvent, NotificationType, Notifier};
use crate::workers::jobs::{JobOptions, JobPayload, JobScheduler, QueueName};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Capture immediately after a successful authorisation
    pub auto_capture: bool,
    /// How long a pending session may wait for authorisation
    pub session_expiry: Duration,
    /// When to check on a refund still awaiting confirmation
    pub refund_check_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            auto_capture: false,
            session_expiry: Duration::from_secs(3600),
            refund_check_delay: Duration::from_secs(6 * 3600),
        }
    }
}

// ============================================================================
// Actors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    User,
    Admin,
    System,
}

impl ActorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorRole::User => "user",
            ActorRole::Admin => "admin",
            ActorRole::System => "system",
        }
    }
}

/// Who is asking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub role: ActorRole,
}

impl Actor {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: ActorRole::User,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: ActorRole::Admin,
        }
    }

    pub fn system() -> Self {
        Self {
            id: crate::services::audit::SYSTEM_ACTOR.to_string(),
            role: ActorRole::System,
        }
    }

    pub fn is_privileged(&self) -> bool {
        matches!(self.role, ActorRole::Admin | ActorRole::System)
    }

    pub fn can_access(&self, tx: &Transaction) -> bool {
        self.is_privileged() || tx.owner_id == self.id
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    #[error("invalid amount {amount}: {reason}")]
    InvalidAmount { amount: i64, reason: String },

    #[error("invalid currency '{0}'")]
    InvalidCurrency(String),

    #[error("{field} {requested} exceeds the available {limit}")]
    AmountExceedsLimit {
        field: &'static str,
        requested: i64,
        limit: i64,
    },

    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("refund not found: {0}")]
    RefundNotFound(String),

    #[error("cannot {action} transaction {transaction_id} while it is {current}")]
    InvalidState {
        transaction_id: Uuid,
        current: TransactionStatus,
        action: &'static str,
    },

    #[error("access denied: {0}")]
    Forbidden(String),

    #[error("ledger inconsistency: {0}")]
    Inconsistent(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl OrchestratorError {
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::Gateway(e) => e.is_retryable(),
            OrchestratorError::Database(e) => {
                e.is_retryable() || matches!(e, DatabaseError::VersionConflict { .. })
            }
            _ => false,
        }
    }

    /// The entity a notification refers to is missing or not yet in the
    /// expected state; a later delivery may succeed.
    pub fn is_out_of_order(&self) -> bool {
        matches!(
            self,
            OrchestratorError::TransactionNotFound(_)
                | OrchestratorError::RefundNotFound(_)
                | OrchestratorError::InvalidState { .. }
        )
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::InvalidInput { field, reason } => {
                AppError::validation(ValidationError::InvalidField {
                    field: field.to_string(),
                    reason,
                })
            }
            OrchestratorError::InvalidAmount { amount, reason } => {
                AppError::validation(ValidationError::InvalidAmount {
                    amount: amount.to_string(),
                    reason,
                })
            }
            OrchestratorError::InvalidCurrency(currency) => {
                AppError::validation(ValidationError::InvalidCurrency {
                    currency,
                    reason: "expected a three-letter ISO 4217 code".to_string(),
                })
            }
            OrchestratorError::AmountExceedsLimit {
                field,
                requested,
                limit,
            } => AppError::validation(ValidationError::AmountExceedsLimit {
                field: field.to_string(),
                requested,
                limit,
            }),
            OrchestratorError::TransactionNotFound(id) => {
                AppError::new(AppErrorKind::Domain(DomainError::TransactionNotFound {
                    transaction_id: id,
                }))
            }
            OrchestratorError::RefundNotFound(id) => {
                AppError::new(AppErrorKind::Domain(DomainError::RefundNotFound {
                    refund_id: id,
                }))
            }
            OrchestratorError::InvalidState {
                transaction_id,
                current,
                action,
            } => AppError::new(AppErrorKind::Domain(DomainError::InvalidStateTransition {
                transaction_id: transaction_id.to_string(),
                current: current.to_string(),
                action: action.to_string(),
            })),
            OrchestratorError::Forbidden(reason) => AppError::forbidden(reason),
            OrchestratorError::Inconsistent(message) => AppError::new(
                AppErrorKind::Infrastructure(InfrastructureError::Internal { message }),
            ),
            OrchestratorError::Gateway(e) => e.into(),
            OrchestratorError::Database(e) => e.into(),
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

// ============================================================================
// Requests and projections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentRequest {
    pub amount: i64,
    pub currency: String,
    pub resource_type: String,
    pub resource_id: String,
    pub return_url: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentResponse {
    pub payment_id: Uuid,
    pub session_id: String,
    pub session_data: String,
    pub transaction_reference: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturePaymentRequest {
    #[serde(default)]
    pub amount: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundPaymentRequest {
    #[serde(default)]
    pub amount: Option<i64>,
    pub reason: RefundReason,
    #[serde(default)]
    pub reason_details: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundView {
    pub refund_id: Uuid,
    pub reference: String,
    pub transaction_id: Uuid,
    pub amount: i64,
    pub amount_decimal: String,
    pub currency: String,
    pub reason: RefundReason,
    pub reason_details: Option<String>,
    pub status: RefundStatus,
    pub gateway_reference: Option<String>,
    pub initiated_by: String,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Refund> for RefundView {
    fn from(refund: &Refund) -> Self {
        Self {
            refund_id: refund.id,
            reference: refund.reference.clone(),
            transaction_id: refund.transaction_id,
            amount: refund.amount,
            amount_decimal: format_major_units(refund.amount, &refund.currency),
            currency: refund.currency.clone(),
            reason: refund.reason,
            reason_details: refund.reason_details.clone(),
            status: refund.status,
            gateway_reference: refund.gateway_reference.clone(),
            initiated_by: refund.initiated_by.clone(),
            failure_reason: refund.failure_reason.clone(),
            created_at: refund.created_at,
            completed_at: refund.completed_at,
        }
    }
}

/// Read-only projection of a transaction; amounts in minor units plus major-unit decimals
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusView {
    pub payment_id: Uuid,
    pub reference: String,
    pub gateway_reference: Option<String>,
    pub status: TransactionStatus,
    pub currency: String,
    pub amount: i64,
    pub amount_decimal: String,
    pub authorized_amount: i64,
    pub authorized_amount_decimal: String,
    pub captured_amount: i64,
    pub captured_amount_decimal: String,
    pub refunded_amount: i64,
    pub refunded_amount_decimal: String,
    pub refundable_amount: i64,
    pub payment_method: Option<String>,
    pub resource_type: String,
    pub resource_id: String,
    pub failure_reason: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub authorized_at: Option<DateTime<Utc>>,
    pub captured_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refunds: Option<Vec<RefundView>>,
}

impl PaymentStatusView {
    pub fn project(tx: &Transaction, refunds: Option<&[Refund]>) -> Self {
        let in_flight: i64 = refunds
            .map(|r| {
                r.iter()
                    .filter(|r| r.status.is_in_flight())
                    .map(|r| r.amount)
                    .sum()
            })
            .unwrap_or(0);
        let major = |minor: i64| format_major_units(minor, &tx.currency);
        Self {
            payment_id: tx.id,
            reference: tx.reference.clone(),
            gateway_reference: tx.gateway_reference.clone(),
            status: tx.status,
            currency: tx.currency.clone(),
            amount: tx.amount,
            amount_decimal: major(tx.amount),
            authorized_amount: tx.authorized_amount,
            authorized_amount_decimal: major(tx.authorized_amount),
            captured_amount: tx.captured_amount,
            captured_amount_decimal: major(tx.captured_amount),
            refunded_amount: tx.refunded_amount,
            refunded_amount_decimal: major(tx.refunded_amount),
            refundable_amount: (tx.remaining_refundable() - in_flight).max(0),
            payment_method: tx.payment_method.clone(),
            resource_type: tx.resource_type.clone(),
            resource_id: tx.resource_id.clone(),
            failure_reason: tx
                .metadata
                .failure_reason
                .clone()
                .or_else(|| tx.metadata.refusal_reason.clone()),
            metadata: tx.metadata.extra.clone(),
            created_at: tx.created_at,
            updated_at: tx.updated_at,
            authorized_at: tx.authorized_at,
            captured_at: tx.captured_at,
            refunded_at: tx.refunded_at,
            failed_at: tx.failed_at,
            cancelled_at: tx.cancelled_at,
            refunds: refunds.map(|r| r.iter().map(RefundView::from).collect()),
        }
    }
}

/// What a webhook-driven operation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEffect {
    Applied,
    /// The transition had already happened
    AlreadyApplied,
    /// Nothing to change, e.g. a failed capture notification
    Ignored,
}

pub const SESSION_EXPIRED_REASON: &str = "session_expired";

// ============================================================================
// Orchestrator
// ============================================================================

pub struct PaymentOrchestrator {
    transactions: Arc<dyn TransactionRepository>,
    refunds: Arc<dyn RefundRepository>,
    gateway: Arc<dyn PaymentGateway>,
    scheduler: Arc<dyn JobScheduler>,
    notifier: Notifier,
    audit: AuditRecorder,
    locks: TransactionLocks,
    config: OrchestratorConfig,
}

impl PaymentOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transactions: Arc<dyn TransactionRepository>,
        refunds: Arc<dyn RefundRepository>,
        gateway: Arc<dyn PaymentGateway>,
        scheduler: Arc<dyn JobScheduler>,
        notifier: Notifier,
        audit: AuditRecorder,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            transactions,
            refunds,
            gateway,
            scheduler,
            notifier,
            audit,
            locks: TransactionLocks::new(),
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn load(&self, id: Uuid) -> OrchestratorResult<Transaction> {
        self.transactions
            .find_by_id(id)
            .await?
            .ok_or_else(|| OrchestratorError::TransactionNotFound(id.to_string()))
    }

    async fn load_refund(&self, id: Uuid) -> OrchestratorResult<Refund> {
        self.refunds
            .find_by_id(id)
            .await?
            .ok_or_else(|| OrchestratorError::RefundNotFound(id.to_string()))
    }

    fn transition(
        tx: &mut Transaction,
        next: TransactionStatus,
        action: &'static str,
    ) -> OrchestratorResult<()> {
        if tx.transition_to(next) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidState {
                transaction_id: tx.id,
                current: tx.status,
                action,
            })
        }
    }

    async fn save(&self, tx: &Transaction) -> OrchestratorResult<Transaction> {
        if !tx.amounts_consistent() {
            return Err(OrchestratorError::Inconsistent(format!(
                "transaction {} amounts out of bounds (authorized={}, captured={}, refunded={})",
                tx.id, tx.authorized_amount, tx.captured_amount, tx.refunded_amount
            )));
        }
        let mut row = tx.clone();
        row.updated_at = Utc::now();
        Ok(self.transactions.update(&row).await?)
    }

    async fn save_refund(&self, refund: &mut Refund) -> OrchestratorResult<Refund> {
        refund.updated_at = Utc::now();
        Ok(self.refunds.update(refund).await?)
    }

    fn notify_tx(&self, kind: NotificationType, tx: &Transaction) {
        self.notifier
            .publish(NotificationEvent::for_transaction(kind, tx));
    }

    fn notify_refund(&self, kind: NotificationType, tx: &Transaction, refund: &Refund) {
        self.notifier
            .publish(NotificationEvent::for_refund(kind, tx, refund));
    }

    fn audit_webhook(
        &self,
        action: &str,
        tx: &Transaction,
        item: &NotificationRequestItem,
        correlation_id: &str,
        error: Option<&str>,
    ) {
        let mut event = AuditEvent::new(action, "transaction", tx.id.to_string())
            .actor("gateway", None)
            .correlation(correlation_id)
            .request(serde_json::to_value(item).unwrap_or_default())
            .response(serde_json::json!({
                "status": tx.status,
                "capturedAmount": tx.captured_amount,
                "refundedAmount": tx.refunded_amount,
            }));
        if let Some(error) = error {
            event = event.failed(error);
        }
        self.audit.record(event);
    }

    fn audit_system(&self, action: &str, resource_type: &str, resource_id: Uuid, detail: serde_json::Value) {
        self.audit.record(
            AuditEvent::new(action, resource_type, resource_id.to_string()).response(detail),
        );
    }

    fn schedule(&self, queue: QueueName, payload: JobPayload, options: JobOptions) {
        let kind = payload.kind();
        if let Err(e) = self.scheduler.enqueue(queue, payload, options) {
            warn!(queue = %queue, kind, error = %e, "failed to schedule follow-up job");
        }
    }

    /// Transaction named by a notification: merchant reference first, then PSP references
    async fn find_for_item(
        &self,
        item: &NotificationRequestItem,
    ) -> OrchestratorResult<Transaction> {
        if !item.merchant_reference.is_empty() {
            if let Some(tx) = self
                .transactions
                .find_by_reference(&item.merchant_reference)
                .await?
            {
                return Ok(tx);
            }
        }
        for psp in [item.original_reference.as_deref(), Some(item.psp_reference.as_str())]
            .into_iter()
            .flatten()
        {
            if let Some(tx) = self.transactions.find_by_gateway_reference(psp).await? {
                return Ok(tx);
            }
        }
        Err(OrchestratorError::TransactionNotFound(
            item.merchant_reference.clone(),
        ))
    }

    fn validate_create(request: &CreatePaymentRequest) -> OrchestratorResult<String> {
        if request.amount <= 0 {
            return Err(OrchestratorError::InvalidAmount {
                amount: request.amount,
                reason: "must be a positive integer in minor units".to_string(),
            });
        }
        let currency = request.currency.trim().to_uppercase();
        if !is_valid_currency_code(&currency) {
            return Err(OrchestratorError::InvalidCurrency(request.currency.clone()));
        }
        for (field, value) in [
            ("resourceType", &request.resource_type),
            ("resourceId", &request.resource_id),
        ] {
            if value.trim().is_empty() {
                return Err(OrchestratorError::InvalidInput {
                    field,
                    reason: "must not be empty".to_string(),
                });
            }
        }
        match reqwest::Url::parse(&request.return_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => {
                return Err(OrchestratorError::InvalidInput {
                    field: "returnUrl",
                    reason: "must be an absolute http(s) URL".to_string(),
                })
            }
        }
        if request.metadata.len() > MAX_METADATA_ENTRIES {
            return Err(OrchestratorError::InvalidInput {
                field: "metadata",
                reason: format!("at most {} entries allowed", MAX_METADATA_ENTRIES),
            });
        }
        Ok(currency)
    }

    // =========================================================================
    // Client operations
    // =========================================================================

    /// Persist a pending transaction and open a gateway session for it.
    /// A gateway failure leaves the transaction `failed` and surfaces the error.
    pub async fn create_payment(
        &self,
        actor: &Actor,
        request: CreatePaymentRequest,
    ) -> OrchestratorResult<CreatePaymentResponse> {
        let currency = Self::validate_create(&request)?;

        let tx = Transaction::new_pending(
            actor.id.clone(),
            request.amount,
            currency.clone(),
            request.resource_type.trim(),
            request.resource_id.trim(),
            request.return_url.clone(),
            TransactionMetadata::with_extra(request.metadata),
        );
        let mut tx = self.transactions.insert(&tx).await?;
        let _guard = self.locks.lock(tx.id).await;

        info!(
            transaction_id = %tx.id,
            reference = %tx.reference,
            amount = tx.amount,
            currency = %tx.currency,
            "payment created"
        );

        let session = self
            .gateway
            .create_session(SessionRequest {
                reference: tx.reference.clone(),
                amount: Amount::new(tx.amount, currency),
                return_url: tx.return_url.clone(),
                shopper_reference: Some(actor.id.clone()),
                expires_at: chrono::Duration::from_std(self.config.session_expiry)
                    .ok()
                    .map(|d| Utc::now() + d),
                metadata: BTreeMap::from([("transactionId".to_string(), tx.id.to_string())]),
            })
            .await;

        match session {
            Ok(session) => {
                tx.metadata.session_id = Some(session.session_id.clone());
                let tx = self.save(&tx).await?;
                self.notify_tx(NotificationType::PaymentCreated, &tx);
                self.schedule(
                    QueueName::Payments,
                    JobPayload::StatusCheck {
                        transaction_id: tx.id,
                    },
                    JobOptions::delayed(self.config.session_expiry),
                );
                Ok(CreatePaymentResponse {
                    payment_id: tx.id,
                    session_id: session.session_id,
                    session_data: session.session_data,
                    transaction_reference: tx.reference,
                })
            }
            Err(e) => {
                warn!(transaction_id = %tx.id, error = %e, "session creation failed");
                tx.metadata.failure_reason = Some(e.to_string());
                Self::transition(&mut tx, TransactionStatus::Failed, "fail")?;
                match self.save(&tx).await {
                    Ok(saved) => self.notify_tx(NotificationType::PaymentFailed, &saved),
                    Err(save_err) => warn!(
                        transaction_id = %tx.id,
                        error = %save_err,
                        "failed to record session failure"
                    ),
                }
                Err(e.into())
            }
        }
    }

    /// Capture an authorized transaction, in full by default. Privileged.
    pub async fn capture_payment(
        &self,
        actor: &Actor,
        transaction_id: Uuid,
        amount: Option<i64>,
    ) -> OrchestratorResult<Transaction> {
        if !actor.is_privileged() {
            return Err(OrchestratorError::Forbidden(
                "capture requires an elevated role".to_string(),
            ));
        }
        let _guard = self.locks.lock(transaction_id).await;
        let mut tx = self.load(transaction_id).await?;

        if tx.status != TransactionStatus::Authorized {
            return Err(OrchestratorError::InvalidState {
                transaction_id,
                current: tx.status,
                action: "capture",
            });
        }
        let amount = amount.unwrap_or(tx.authorized_amount);
        if amount <= 0 {
            return Err(OrchestratorError::InvalidAmount {
                amount,
                reason: "must be greater than zero".to_string(),
            });
        }
        if amount > tx.authorized_amount {
            return Err(OrchestratorError::AmountExceedsLimit {
                field: "amount",
                requested: amount,
                limit: tx.authorized_amount,
            });
        }
        let gateway_reference = tx.gateway_reference.clone().ok_or_else(|| {
            OrchestratorError::Inconsistent(format!(
                "authorized transaction {} has no gateway reference",
                tx.id
            ))
        })?;

        let response = self
            .gateway
            .capture(CaptureRequest {
                gateway_reference,
                amount: Amount::new(amount, tx.currency.clone()),
                reference: tx.reference.clone(),
            })
            .await?;

        tx.captured_amount = amount;
        Self::transition(&mut tx, TransactionStatus::Captured, "capture")?;
        let tx = self.save(&tx).await?;

        info!(
            transaction_id = %tx.id,
            captured_amount = tx.captured_amount,
            psp_reference = %response.psp_reference,
            actor = %actor.id,
            "payment captured"
        );
        self.notify_tx(NotificationType::PaymentCaptured, &tx);
        Ok(tx)
    }

    /// Void an authorization. Owner or privileged.
    pub async fn cancel_payment(
        &self,
        actor: &Actor,
        transaction_id: Uuid,
    ) -> OrchestratorResult<Transaction> {
        let _guard = self.locks.lock(transaction_id).await;
        let mut tx = self.load(transaction_id).await?;
        if !actor.can_access(&tx) {
            return Err(OrchestratorError::Forbidden(
                "not the owner of this payment".to_string(),
            ));
        }
        if tx.status != TransactionStatus::Authorized {
            return Err(OrchestratorError::InvalidState {
                transaction_id,
                current: tx.status,
                action: "cancel",
            });
        }
        let gateway_reference = tx.gateway_reference.clone().ok_or_else(|| {
            OrchestratorError::Inconsistent(format!(
                "authorized transaction {} has no gateway reference",
                tx.id
            ))
        })?;

        self.gateway
            .cancel(CancelRequest {
                gateway_reference,
                reference: tx.reference.clone(),
            })
            .await?;

        Self::transition(&mut tx, TransactionStatus::Cancelled, "cancel")?;
        let tx = self.save(&tx).await?;
        info!(transaction_id = %tx.id, actor = %actor.id, "payment cancelled");
        self.notify_tx(NotificationType::PaymentCancelled, &tx);
        Ok(tx)
    }

    /// Request a refund of captured funds. The refund completes on the REFUND webhook.
    pub async fn refund_payment(
        &self,
        actor: &Actor,
        transaction_id: Uuid,
        request: RefundPaymentRequest,
    ) -> OrchestratorResult<RefundView> {
        let _guard = self.locks.lock(transaction_id).await;
        let tx = self.load(transaction_id).await?;
        if !actor.can_access(&tx) {
            return Err(OrchestratorError::Forbidden(
                "not the owner of this payment".to_string(),
            ));
        }
        if !tx.status.is_refundable() {
            return Err(OrchestratorError::InvalidState {
                transaction_id,
                current: tx.status,
                action: "refund",
            });
        }

        let in_flight: i64 = self
            .refunds
            .list_for_transaction(tx.id)
            .await?
            .iter()
            .filter(|r| r.status.is_in_flight())
            .map(|r| r.amount)
            .sum();
        let available = tx.remaining_refundable() - in_flight;
        let amount = request.amount.unwrap_or(available);
        if request.amount.is_some() && amount <= 0 {
            return Err(OrchestratorError::InvalidAmount {
                amount,
                reason: "must be greater than zero".to_string(),
            });
        }
        if amount <= 0 || amount > available {
            return Err(OrchestratorError::AmountExceedsLimit {
                field: "amount",
                requested: amount,
                limit: available.max(0),
            });
        }
        let gateway_reference = tx.gateway_reference.clone().ok_or_else(|| {
            OrchestratorError::Inconsistent(format!(
                "captured transaction {} has no gateway reference",
                tx.id
            ))
        })?;

        let refund = Refund::new_pending(
            tx.id,
            amount,
            tx.currency.clone(),
            request.reason,
            request.reason_details,
            actor.id.clone(),
        );
        let mut refund = self.refunds.insert(&refund).await?;

        let result = self
            .gateway
            .refund(RefundRequest {
                gateway_reference,
                amount: Amount::new(amount, tx.currency.clone()),
                reference: refund.reference.clone(),
            })
            .await;

        match result {
            Ok(response) => {
                refund.status = RefundStatus::Processing;
                refund.gateway_reference = Some(response.psp_reference);
                let refund = self.save_refund(&mut refund).await?;
                info!(
                    transaction_id = %tx.id,
                    refund_id = %refund.id,
                    amount = refund.amount,
                    "refund submitted"
                );
                self.notify_refund(NotificationType::RefundRequested, &tx, &refund);
                self.schedule(
                    QueueName::Refunds,
                    JobPayload::RefundStatusCheck {
                        refund_id: refund.id,
                    },
                    JobOptions::delayed(self.config.refund_check_delay),
                );
                Ok(RefundView::from(&refund))
            }
            Err(e) if e.is_ambiguous() => {
                warn!(
                    transaction_id = %tx.id,
                    refund_id = %refund.id,
                    error = %e,
                    "refund outcome unknown, leaving pending for reconciliation"
                );
                self.schedule(
                    QueueName::Refunds,
                    JobPayload::RefundStatusCheck {
                        refund_id: refund.id,
                    },
                    JobOptions::delayed(self.config.refund_check_delay),
                );
                Err(e.into())
            }
            Err(e) => {
                warn!(transaction_id = %tx.id, refund_id = %refund.id, error = %e, "refund rejected");
                refund.status = RefundStatus::Failed;
                refund.failure_reason = Some(e.to_string());
                match self.save_refund(&mut refund).await {
                    Ok(saved) => self.notify_refund(NotificationType::RefundFailed, &tx, &saved),
                    Err(save_err) => warn!(
                        refund_id = %refund.id,
                        error = %save_err,
                        "failed to record refund rejection"
                    ),
                }
                Err(e.into())
            }
        }
    }

    pub async fn get_status(
        &self,
        actor: &Actor,
        transaction_id: Uuid,
    ) -> OrchestratorResult<PaymentStatusView> {
        let tx = self.load(transaction_id).await?;
        if !actor.can_access(&tx) {
            return Err(OrchestratorError::Forbidden(
                "not the owner of this payment".to_string(),
            ));
        }
        let refunds = self.refunds.list_for_transaction(tx.id).await?;
        Ok(PaymentStatusView::project(&tx, Some(&refunds)))
    }

    pub async fn list_refunds(
        &self,
        actor: &Actor,
        transaction_id: Uuid,
    ) -> OrchestratorResult<Vec<RefundView>> {
        let tx = self.load(transaction_id).await?;
        if !actor.can_access(&tx) {
            return Err(OrchestratorError::Forbidden(
                "not the owner of this payment".to_string(),
            ));
        }
        let refunds = self.refunds.list_for_transaction(tx.id).await?;
        Ok(refunds.iter().map(RefundView::from).collect())
    }

    pub async fn list_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> OrchestratorResult<Page<PaymentStatusView>> {
        let page = self.transactions.list(filter).await?;
        Ok(Page {
            items: page
                .items
                .iter()
                .map(|tx| PaymentStatusView::project(tx, None))
                .collect(),
            total: page.total,
            limit: page.limit,
            offset: page.offset,
        })
    }

    pub async fn available_payment_methods(
        &self,
        query: PaymentMethodsQuery,
    ) -> OrchestratorResult<Vec<PaymentMethodInfo>> {
        if let Some(currency) = query.currency.as_deref() {
            if !is_valid_currency_code(currency) {
                return Err(OrchestratorError::InvalidCurrency(currency.to_string()));
            }
        }
        Ok(self.gateway.payment_methods(query).await?)
    }

    // =========================================================================
    // Webhook-driven operations
    // =========================================================================

    /// AUTHORISATION success. With auto-capture on, captures right away and falls
    /// back to a capture job if that fails.
    pub async fn authorize_payment(
        &self,
        item: &NotificationRequestItem,
        correlation_id: &str,
    ) -> OrchestratorResult<WebhookEffect> {
        let found = self.find_for_item(item).await?;
        let tx = {
            let _guard = self.locks.lock(found.id).await;
            let mut tx = self.load(found.id).await?;

            if tx.status != TransactionStatus::Pending {
                if tx.gateway_reference.as_deref() == Some(item.psp_reference.as_str()) {
                    debug!(transaction_id = %tx.id, status = %tx.status, "authorisation already applied");
                    return Ok(WebhookEffect::AlreadyApplied);
                }
                warn!(
                    transaction_id = %tx.id,
                    status = %tx.status,
                    psp_reference = %item.psp_reference,
                    "authorisation for a transaction that is no longer pending"
                );
                return Ok(WebhookEffect::Ignored);
            }
            if item.amount.currency != tx.currency {
                return Err(OrchestratorError::Inconsistent(format!(
                    "authorisation currency {} does not match transaction currency {}",
                    item.amount.currency, tx.currency
                )));
            }
            if item.amount.value <= 0 || item.amount.value > tx.amount {
                return Err(OrchestratorError::Inconsistent(format!(
                    "authorised amount {} outside (0, {}]",
                    item.amount.value, tx.amount
                )));
            }

            tx.gateway_reference = Some(item.psp_reference.clone());
            tx.authorized_amount = item.amount.value;
            tx.payment_method = item.payment_method.clone();
            Self::transition(&mut tx, TransactionStatus::Authorized, "authorize")?;
            let tx = self.save(&tx).await?;

            info!(
                transaction_id = %tx.id,
                psp_reference = %item.psp_reference,
                authorized_amount = tx.authorized_amount,
                "payment authorized"
            );
            self.audit_webhook(actions::PAYMENT_AUTHORIZE, &tx, item, correlation_id, None);
            self.notify_tx(NotificationType::PaymentAuthorized, &tx);
            tx
        };

        if self.config.auto_capture {
            if let Err(e) = self.capture_payment(&Actor::system(), tx.id, None).await {
                warn!(
                    transaction_id = %tx.id,
                    error = %e,
                    "auto-capture failed, scheduling capture job"
                );
                self.schedule(
                    QueueName::Payments,
                    JobPayload::Capture {
                        transaction_id: tx.id,
                        amount: None,
                    },
                    JobOptions::default(),
                );
            }
        }
        Ok(WebhookEffect::Applied)
    }

    /// AUTHORISATION failure
    pub async fn mark_failed(
        &self,
        item: &NotificationRequestItem,
        correlation_id: &str,
    ) -> OrchestratorResult<WebhookEffect> {
        let found = self.find_for_item(item).await?;
        let _guard = self.locks.lock(found.id).await;
        let mut tx = self.load(found.id).await?;

        match tx.status {
            TransactionStatus::Failed => return Ok(WebhookEffect::AlreadyApplied),
            TransactionStatus::Pending | TransactionStatus::Authorized => {}
            current => {
                warn!(transaction_id = %tx.id, status = %current, "refusal for a settled transaction");
                return Ok(WebhookEffect::Ignored);
            }
        }
        tx.metadata.refusal_reason = item.reason.clone();
        if tx.gateway_reference.is_none() {
            tx.gateway_reference = Some(item.psp_reference.clone());
        }
        Self::transition(&mut tx, TransactionStatus::Failed, "fail")?;
        let tx = self.save(&tx).await?;

        info!(
            transaction_id = %tx.id,
            reason = item.reason.as_deref().unwrap_or(""),
            "payment refused"
        );
        self.audit_webhook(actions::PAYMENT_FAIL, &tx, item, correlation_id, item.reason.as_deref());
        self.notify_tx(NotificationType::PaymentFailed, &tx);
        Ok(WebhookEffect::Applied)
    }

    /// CAPTURE: confirm a capture, or record one made outside this service
    pub async fn finalize_capture(
        &self,
        item: &NotificationRequestItem,
        correlation_id: &str,
    ) -> OrchestratorResult<WebhookEffect> {
        if !item.success {
            return self.record_capture_failure(item, correlation_id).await;
        }
        let found = self.find_for_item(item).await?;
        let _guard = self.locks.lock(found.id).await;
        let mut tx = self.load(found.id).await?;

        match tx.status {
            TransactionStatus::Captured
            | TransactionStatus::PartiallyRefunded
            | TransactionStatus::Refunded => return Ok(WebhookEffect::AlreadyApplied),
            TransactionStatus::Authorized => {}
            TransactionStatus::Pending => {
                return Err(OrchestratorError::InvalidState {
                    transaction_id: tx.id,
                    current: tx.status,
                    action: "capture",
                })
            }
            current => {
                warn!(transaction_id = %tx.id, status = %current, "capture for a closed transaction");
                return Ok(WebhookEffect::Ignored);
            }
        }

        if item.amount.value <= 0 || item.amount.value > tx.authorized_amount {
            return Err(OrchestratorError::Inconsistent(format!(
                "captured amount {} exceeds authorized {}",
                item.amount.value, tx.authorized_amount
            )));
        }
        tx.captured_amount = item.amount.value;
        Self::transition(&mut tx, TransactionStatus::Captured, "capture")?;
        let tx = self.save(&tx).await?;

        info!(transaction_id = %tx.id, captured_amount = tx.captured_amount, "capture confirmed");
        self.audit_webhook(actions::PAYMENT_CAPTURE, &tx, item, correlation_id, None);
        self.notify_tx(NotificationType::PaymentCaptured, &tx);
        Ok(WebhookEffect::Applied)
    }

    /// CAPTURE_FAILED, or CAPTURE with success=false. A capture already recorded
    /// from the gateway's synchronous answer is left in place for reconciliation.
    pub async fn record_capture_failure(
        &self,
        item: &NotificationRequestItem,
        correlation_id: &str,
    ) -> OrchestratorResult<WebhookEffect> {
        let tx = self.find_for_item(item).await?;
        warn!(
            transaction_id = %tx.id,
            status = %tx.status,
            reason = item.reason.as_deref().unwrap_or(""),
            "gateway reported capture failure"
        );
        self.audit_webhook(
            actions::PAYMENT_CAPTURE,
            &tx,
            item,
            correlation_id,
            Some(item.reason.as_deref().unwrap_or("capture failed")),
        );
        Ok(WebhookEffect::Ignored)
    }

    /// CANCELLATION
    pub async fn mark_cancelled(
        &self,
        item: &NotificationRequestItem,
        correlation_id: &str,
    ) -> OrchestratorResult<WebhookEffect> {
        let found = self.find_for_item(item).await?;
        let _guard = self.locks.lock(found.id).await;
        let mut tx = self.load(found.id).await?;

        if !item.success {
            warn!(transaction_id = %tx.id, "gateway reported cancellation failure");
            return Ok(WebhookEffect::Ignored);
        }
        match tx.status {
            TransactionStatus::Cancelled => return Ok(WebhookEffect::AlreadyApplied),
            TransactionStatus::Pending | TransactionStatus::Authorized => {}
            current => {
                warn!(transaction_id = %tx.id, status = %current, "cancellation for a settled transaction");
                return Ok(WebhookEffect::Ignored);
            }
        }
        Self::transition(&mut tx, TransactionStatus::Cancelled, "cancel")?;
        let tx = self.save(&tx).await?;

        info!(transaction_id = %tx.id, "cancellation confirmed");
        self.audit_webhook(actions::PAYMENT_CANCEL, &tx, item, correlation_id, None);
        self.notify_tx(NotificationType::PaymentCancelled, &tx);
        Ok(WebhookEffect::Applied)
    }

    async fn find_refund_for_item(&self, item: &NotificationRequestItem) -> OrchestratorResult<Refund> {
        if !item.merchant_reference.is_empty() {
            if let Some(refund) = self
                .refunds
                .find_by_reference(&item.merchant_reference)
                .await?
            {
                return Ok(refund);
            }
        }
        self.refunds
            .find_by_gateway_reference(&item.psp_reference)
            .await?
            .ok_or_else(|| OrchestratorError::RefundNotFound(item.merchant_reference.clone()))
    }

    /// REFUND success: credit the refund and recompute the transaction status
    pub async fn complete_refund(
        &self,
        item: &NotificationRequestItem,
        correlation_id: &str,
    ) -> OrchestratorResult<WebhookEffect> {
        let found = self.find_refund_for_item(item).await?;
        let _guard = self.locks.lock(found.transaction_id).await;
        let mut refund = self.load_refund(found.id).await?;
        let mut tx = self.load(refund.transaction_id).await?;

        if refund.status == RefundStatus::Completed {
            debug!(refund_id = %refund.id, "refund already completed");
            return Ok(WebhookEffect::AlreadyApplied);
        }
        if item.amount.value != refund.amount {
            warn!(
                refund_id = %refund.id,
                requested = refund.amount,
                notified = item.amount.value,
                "refund notification amount differs from request"
            );
        }

        let refunded = tx.refunded_amount + refund.amount;
        if refunded > tx.captured_amount {
            return Err(OrchestratorError::Inconsistent(format!(
                "refund {} would bring refunded amount to {} above captured {}",
                refund.id, refunded, tx.captured_amount
            )));
        }
        tx.refunded_amount = refunded;
        let next = if refunded == tx.captured_amount {
            TransactionStatus::Refunded
        } else {
            TransactionStatus::PartiallyRefunded
        };
        Self::transition(&mut tx, next, "refund")?;
        let tx = self.save(&tx).await?;

        refund.status = RefundStatus::Completed;
        refund.completed_at = Some(Utc::now());
        refund.failure_reason = None;
        if refund.gateway_reference.is_none() {
            refund.gateway_reference = Some(item.psp_reference.clone());
        }
        let refund = self.save_refund(&mut refund).await?;

        info!(
            transaction_id = %tx.id,
            refund_id = %refund.id,
            refunded_amount = tx.refunded_amount,
            status = %tx.status,
            "refund completed"
        );
        self.audit_webhook(actions::REFUND_COMPLETE, &tx, item, correlation_id, None);
        self.notify_refund(NotificationType::RefundCompleted, &tx, &refund);
        Ok(WebhookEffect::Applied)
    }

    /// REFUND failure or REFUND_FAILED
    pub async fn fail_refund(
        &self,
        item: &NotificationRequestItem,
        correlation_id: &str,
    ) -> OrchestratorResult<WebhookEffect> {
        let found = self.find_refund_for_item(item).await?;
        let _guard = self.locks.lock(found.transaction_id).await;
        let mut refund = self.load_refund(found.id).await?;
        let tx = self.load(refund.transaction_id).await?;

        match refund.status {
            RefundStatus::Failed => return Ok(WebhookEffect::AlreadyApplied),
            RefundStatus::Completed => {
                warn!(
                    refund_id = %refund.id,
                    "refund failure reported after completion, leaving ledger unchanged"
                );
                self.audit_webhook(
                    actions::REFUND_FAIL,
                    &tx,
                    item,
                    correlation_id,
                    Some("failure after completion"),
                );
                return Ok(WebhookEffect::Ignored);
            }
            RefundStatus::Pending | RefundStatus::Processing => {}
        }

        refund.status = RefundStatus::Failed;
        refund.failure_reason = Some(
            item.reason
                .clone()
                .unwrap_or_else(|| "refused by gateway".to_string()),
        );
        let refund = self.save_refund(&mut refund).await?;

        warn!(transaction_id = %tx.id, refund_id = %refund.id, "refund failed");
        self.audit_webhook(
            actions::REFUND_FAIL,
            &tx,
            item,
            correlation_id,
            refund.failure_reason.as_deref(),
        );
        self.notify_refund(NotificationType::RefundFailed, &tx, &refund);
        Ok(WebhookEffect::Applied)
    }

    // =========================================================================
    // Follow-up jobs
    // =========================================================================

    /// Capture job. A transaction that has left `authorized` is left alone.
    pub async fn capture_follow_up(
        &self,
        transaction_id: Uuid,
        amount: Option<i64>,
    ) -> OrchestratorResult<()> {
        let tx = self.load(transaction_id).await?;
        if tx.status != TransactionStatus::Authorized {
            debug!(transaction_id = %tx.id, status = %tx.status, "capture job no longer needed");
            return Ok(());
        }
        self.capture_payment(&Actor::system(), transaction_id, amount)
            .await
            .map(|_| ())
    }

    pub async fn cancel_follow_up(&self, transaction_id: Uuid) -> OrchestratorResult<()> {
        let tx = self.load(transaction_id).await?;
        if tx.status != TransactionStatus::Authorized {
            debug!(transaction_id = %tx.id, status = %tx.status, "cancel job no longer needed");
            return Ok(());
        }
        self.cancel_payment(&Actor::system(), transaction_id)
            .await
            .map(|_| ())
    }

    /// Fail a transaction whose session expired without authorisation.
    /// Returns true if the transaction was failed.
    pub async fn expire_session(&self, transaction_id: Uuid) -> OrchestratorResult<bool> {
        let _guard = self.locks.lock(transaction_id).await;
        let mut tx = self.load(transaction_id).await?;
        if tx.status != TransactionStatus::Pending {
            return Ok(false);
        }

        tx.metadata.failure_reason = Some(SESSION_EXPIRED_REASON.to_string());
        Self::transition(&mut tx, TransactionStatus::Failed, "expire")?;
        let tx = self.save(&tx).await?;

        info!(transaction_id = %tx.id, reference = %tx.reference, "payment session expired");
        self.audit_system(
            actions::PAYMENT_FAIL,
            "transaction",
            tx.id,
            serde_json::json!({ "reason": SESSION_EXPIRED_REASON }),
        );
        self.notify_tx(NotificationType::PaymentFailed, &tx);
        Ok(true)
    }

    /// Flag a refund still waiting for confirmation. Returns true if it is stuck.
    pub async fn check_refund(&self, refund_id: Uuid) -> OrchestratorResult<bool> {
        let refund = self.load_refund(refund_id).await?;
        if !refund.status.is_in_flight() {
            return Ok(false);
        }
        let tx = self.load(refund.transaction_id).await?;

        warn!(
            transaction_id = %tx.id,
            refund_id = %refund.id,
            status = %refund.status,
            age_secs = (Utc::now() - refund.created_at).num_seconds(),
            "refund has not been confirmed by the gateway"
        );
        self.audit_system(
            actions::REFUND_STUCK,
            "refund",
            refund.id,
            serde_json::json!({
                "transactionId": tx.id,
                "status": refund.status,
                "amount": refund.amount,
            }),
        );
        self.notify_refund(NotificationType::RefundStuck, &tx, &refund);
        Ok(true)
    }
}
