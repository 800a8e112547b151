//! Gateway notification processing
//!
//! A batch is verified as a whole before anything is applied: one bad signature
//! rejects the batch. Verified items are deduplicated through a cache claim and
//! dispatched to the orchestrator one by one. An item that cannot be applied yet
//! (out-of-order delivery, transient failure) is persisted to the webhook queue
//! before the batch is acknowledged, instead of failing its batch.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::cache::cache::SharedCache;
use crate::cache::keys::webhook::DedupeKey;
use crate::payments::providers::adyen::{
    verify_signature, EventCode, NotificationBatch, NotificationRequestItem, SignatureCheck,
};
use crate::services::audit::{actions, AuditEvent, AuditRecorder};
use crate::services::payment_orchestrator::{
    OrchestratorResult, PaymentOrchestrator, WebhookEffect,
};
use crate::workers::jobs::{JobOptions, JobPayload, JobScheduler, QueueName};

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Hex HMAC key; without it signatures cannot be checked
    pub hmac_key: Option<String>,
    /// Reject items that carry no signature
    pub require_signature: bool,
    pub dedupe_ttl: Duration,
    /// First retry delay for a deferred item
    pub defer_delay: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            hmac_key: None,
            require_signature: false,
            dedupe_ttl: Duration::from_secs(7 * 86_400),
            defer_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookProcessorError {
    #[error("notification batch is empty")]
    EmptyBatch,

    #[error("invalid signature on notification {psp_reference}")]
    InvalidSignature { psp_reference: String },

    #[error("notification {psp_reference} is not signed")]
    MissingSignature { psp_reference: String },

    #[error("failed to queue notification {psp_reference}: {message}")]
    Queue {
        psp_reference: String,
        message: String,
    },
}

/// Literal acknowledgement returned to the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAck {
    Accepted,
    Invalid,
    Failed,
}

impl WebhookAck {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookAck::Accepted => "[accepted]",
            WebhookAck::Invalid => "[invalid]",
            WebhookAck::Failed => "[failed]",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub applied: usize,
    pub duplicates: usize,
    pub ignored: usize,
    pub queued: usize,
    pub rejected: usize,
}

pub struct WebhookProcessor {
    orchestrator: Arc<PaymentOrchestrator>,
    cache: Arc<dyn SharedCache>,
    scheduler: Arc<dyn JobScheduler>,
    audit: AuditRecorder,
    config: WebhookConfig,
}

impl WebhookProcessor {
    pub fn new(
        orchestrator: Arc<PaymentOrchestrator>,
        cache: Arc<dyn SharedCache>,
        scheduler: Arc<dyn JobScheduler>,
        audit: AuditRecorder,
        config: WebhookConfig,
    ) -> Self {
        if config.hmac_key.is_none() {
            warn!("no webhook HMAC key configured, notification signatures will not be verified");
        }
        Self {
            orchestrator,
            cache,
            scheduler,
            audit,
            config,
        }
    }

    /// Every item must pass before any is applied
    pub fn verify_batch(&self, batch: &NotificationBatch) -> Result<(), WebhookProcessorError> {
        if batch.notification_items.is_empty() {
            return Err(WebhookProcessorError::EmptyBatch);
        }
        for envelope in &batch.notification_items {
            let item = &envelope.item;
            let check = match self.config.hmac_key.as_deref() {
                Some(key) => verify_signature(key, item),
                None if item.hmac_signature().is_some() => {
                    warn!(
                        psp_reference = %item.psp_reference,
                        "signed notification received but no HMAC key is configured to verify it"
                    );
                    SignatureCheck::Invalid
                }
                None => SignatureCheck::Missing,
            };
            match check {
                SignatureCheck::Valid => {}
                SignatureCheck::Invalid => {
                    return Err(WebhookProcessorError::InvalidSignature {
                        psp_reference: item.psp_reference.clone(),
                    })
                }
                SignatureCheck::Missing if self.config.require_signature => {
                    return Err(WebhookProcessorError::MissingSignature {
                        psp_reference: item.psp_reference.clone(),
                    })
                }
                SignatureCheck::Missing => {}
            }
        }
        Ok(())
    }

    pub async fn process_batch(
        &self,
        batch: &NotificationBatch,
        correlation_id: &str,
    ) -> Result<BatchSummary, WebhookProcessorError> {
        if let Err(e) = self.verify_batch(batch) {
            warn!(correlation_id = %correlation_id, error = %e, "notification batch rejected");
            self.audit.record(
                AuditEvent::new(actions::WEBHOOK_RECEIVE, "webhook_batch", correlation_id)
                    .actor("gateway", None)
                    .correlation(correlation_id)
                    .request(serde_json::to_value(batch).unwrap_or_default())
                    .failed(e.to_string()),
            );
            return Err(e);
        }

        let mut summary = BatchSummary::default();
        let mut queue_failure = None;

        for envelope in &batch.notification_items {
            let item = &envelope.item;
            let claim_key = dedupe_key(item);

            match self
                .cache
                .claim(&claim_key, correlation_id, self.config.dedupe_ttl)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    info!(
                        event_code = %item.event_code,
                        psp_reference = %item.psp_reference,
                        "duplicate notification acknowledged"
                    );
                    summary.duplicates += 1;
                    continue;
                }
                Err(e) => warn!(
                    psp_reference = %item.psp_reference,
                    error = %e,
                    "notification dedupe unavailable, processing without it"
                ),
            }

            match self.apply(item, correlation_id).await {
                Ok(WebhookEffect::Applied) => summary.applied += 1,
                Ok(WebhookEffect::AlreadyApplied) => summary.duplicates += 1,
                Ok(WebhookEffect::Ignored) => summary.ignored += 1,
                Err(e) if e.is_out_of_order() || e.is_retryable() => {
                    info!(
                        event_code = %item.event_code,
                        psp_reference = %item.psp_reference,
                        reason = %e,
                        "notification deferred to webhook queue"
                    );
                    match self
                        .scheduler
                        .enqueue_durable(
                            QueueName::Webhooks,
                            JobPayload::WebhookItem { item: item.clone() },
                            JobOptions::delayed(self.config.defer_delay),
                        )
                        .await
                    {
                        Ok(_) => summary.queued += 1,
                        Err(queue_err) => {
                            error!(
                                psp_reference = %item.psp_reference,
                                error = %queue_err,
                                "failed to queue notification"
                            );
                            if let Err(e) = self.cache.delete(&claim_key).await {
                                warn!(error = %e, "failed to release notification dedupe claim");
                            }
                            queue_failure.get_or_insert(WebhookProcessorError::Queue {
                                psp_reference: item.psp_reference.clone(),
                                message: queue_err.to_string(),
                            });
                        }
                    }
                }
                Err(e) => {
                    error!(
                        event_code = %item.event_code,
                        psp_reference = %item.psp_reference,
                        error = %e,
                        "notification rejected"
                    );
                    summary.rejected += 1;
                }
            }
        }

        self.audit.record(
            AuditEvent::new(actions::WEBHOOK_RECEIVE, "webhook_batch", correlation_id)
                .actor("gateway", None)
                .correlation(correlation_id)
                .request(serde_json::to_value(batch).unwrap_or_default())
                .response(serde_json::json!({
                    "applied": summary.applied,
                    "duplicates": summary.duplicates,
                    "ignored": summary.ignored,
                    "queued": summary.queued,
                    "rejected": summary.rejected,
                })),
        );

        match queue_failure {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Forget that `item` was received, so a redelivery is processed again
    pub async fn release_claim(&self, item: &NotificationRequestItem) {
        if let Err(e) = self.cache.delete(&dedupe_key(item)).await {
            warn!(
                psp_reference = %item.psp_reference,
                error = %e,
                "failed to release notification dedupe claim"
            );
        }
    }

    /// Dispatch one verified item by event code
    pub async fn apply(
        &self,
        item: &NotificationRequestItem,
        correlation_id: &str,
    ) -> OrchestratorResult<WebhookEffect> {
        let orchestrator = &self.orchestrator;
        match item.event() {
            EventCode::Authorisation if item.success => {
                orchestrator.authorize_payment(item, correlation_id).await
            }
            EventCode::Authorisation => orchestrator.mark_failed(item, correlation_id).await,
            EventCode::Capture => orchestrator.finalize_capture(item, correlation_id).await,
            EventCode::CaptureFailed => {
                orchestrator
                    .record_capture_failure(item, correlation_id)
                    .await
            }
            EventCode::Refund if item.success => {
                orchestrator.complete_refund(item, correlation_id).await
            }
            EventCode::Refund | EventCode::RefundFailed => {
                orchestrator.fail_refund(item, correlation_id).await
            }
            EventCode::Cancellation => orchestrator.mark_cancelled(item, correlation_id).await,
            EventCode::Other(code) => {
                info!(event_code = %code, psp_reference = %item.psp_reference, "unhandled notification type");
                Ok(WebhookEffect::Ignored)
            }
        }
    }
}

fn dedupe_key(item: &NotificationRequestItem) -> String {
    DedupeKey::new(
        item.event_code.clone(),
        item.success,
        item.psp_reference.clone(),
        item.merchant_reference.clone(),
    )
    .to_string()
}
