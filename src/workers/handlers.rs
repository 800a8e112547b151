//! Job handlers, one per named queue

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::services::notification::{NotificationError, NotificationSink};
use crate::services::payment_orchestrator::{OrchestratorError, PaymentOrchestrator};
use crate::services::reconciliation::Reconciler;
use crate::services::webhook_processor::WebhookProcessor;
use crate::workers::jobs::{Job, JobError, JobHandler, JobPayload};

fn to_job_error(err: OrchestratorError) -> JobError {
    if err.is_retryable() {
        JobError::Retryable(err.to_string())
    } else {
        JobError::Permanent(err.to_string())
    }
}

fn unexpected(job: &Job) -> JobError {
    JobError::Permanent(format!(
        "{} job does not belong on the {} queue",
        job.payload.kind(),
        job.queue
    ))
}

/// Capture, cancel and session-expiry follow-ups
pub struct PaymentJobHandler {
    orchestrator: Arc<PaymentOrchestrator>,
}

impl PaymentJobHandler {
    pub fn new(orchestrator: Arc<PaymentOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl JobHandler for PaymentJobHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        match &job.payload {
            JobPayload::Capture {
                transaction_id,
                amount,
            } => self
                .orchestrator
                .capture_follow_up(*transaction_id, *amount)
                .await
                .map_err(to_job_error),
            JobPayload::Cancel { transaction_id } => self
                .orchestrator
                .cancel_follow_up(*transaction_id)
                .await
                .map_err(to_job_error),
            JobPayload::StatusCheck { transaction_id } => {
                let expired = self
                    .orchestrator
                    .expire_session(*transaction_id)
                    .await
                    .map_err(to_job_error)?;
                debug!(transaction_id = %transaction_id, expired, "session status checked");
                Ok(())
            }
            _ => Err(unexpected(job)),
        }
    }
}

/// Flags refunds the gateway has not confirmed
pub struct RefundJobHandler {
    orchestrator: Arc<PaymentOrchestrator>,
}

impl RefundJobHandler {
    pub fn new(orchestrator: Arc<PaymentOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl JobHandler for RefundJobHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        match &job.payload {
            JobPayload::RefundStatusCheck { refund_id } => self
                .orchestrator
                .check_refund(*refund_id)
                .await
                .map(|_| ())
                .map_err(to_job_error),
            _ => Err(unexpected(job)),
        }
    }
}

/// Applies notifications deferred by the webhook endpoint.
/// Items that arrived ahead of the state they depend on are retried; once an
/// item is abandoned its dedupe claim is dropped.
pub struct WebhookJobHandler {
    processor: Arc<WebhookProcessor>,
}

impl WebhookJobHandler {
    pub fn new(processor: Arc<WebhookProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl JobHandler for WebhookJobHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let JobPayload::WebhookItem { item } = &job.payload else {
            return Err(unexpected(job));
        };
        match self.processor.apply(item, &job.id.to_string()).await {
            Ok(effect) => {
                info!(
                    job_id = %job.id,
                    event_code = %item.event_code,
                    psp_reference = %item.psp_reference,
                    effect = ?effect,
                    "deferred notification processed"
                );
                Ok(())
            }
            Err(e) => {
                let error = if e.is_out_of_order() {
                    JobError::Retryable(e.to_string())
                } else {
                    to_job_error(e)
                };
                if !error.is_retryable() || job.attempts >= job.max_attempts {
                    warn!(
                        job_id = %job.id,
                        event_code = %item.event_code,
                        psp_reference = %item.psp_reference,
                        attempts = job.attempts,
                        error = %error,
                        "giving up on deferred notification, a redelivery will be processed again"
                    );
                    self.processor.release_claim(item).await;
                }
                Err(error)
            }
        }
    }
}

/// Delivers notification events to the downstream consumer
pub struct NotificationJobHandler {
    sink: Arc<dyn NotificationSink>,
}

impl NotificationJobHandler {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl JobHandler for NotificationJobHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let JobPayload::Notify { event } = &job.payload else {
            return Err(unexpected(job));
        };
        match self.sink.deliver(event).await {
            Ok(()) => Ok(()),
            Err(NotificationError::Rejected(status)) if (400..500).contains(&status) => {
                warn!(
                    event_type = event.event_type.as_str(),
                    transaction_id = %event.transaction_id,
                    status,
                    "notification refused by consumer"
                );
                Err(JobError::Permanent(format!("consumer returned HTTP {}", status)))
            }
            Err(e) => Err(JobError::Retryable(e.to_string())),
        }
    }
}

pub struct ReconciliationJobHandler {
    reconciler: Arc<Reconciler>,
}

impl ReconciliationJobHandler {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl JobHandler for ReconciliationJobHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        match &job.payload {
            JobPayload::Reconcile => self
                .reconciler
                .run()
                .await
                .map(|_| ())
                .map_err(to_job_error),
            _ => Err(unexpected(job)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::keys::webhook::DedupeKey;
    use crate::cache::memory::InMemoryCache;
    use crate::cache::SharedCache;
    use crate::payments::providers::adyen::{NotificationBatch, NotificationItemEnvelope};
    use crate::database::transaction_repository::{TransactionRepository, TransactionStatus};
    use crate::services::notification::{NotificationEvent, NotificationType};
    use crate::services::test_support::{fixture, notification};
    use crate::services::webhook_processor::WebhookConfig;
    use crate::workers::jobs::QueueName;
    use chrono::Utc;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn job(queue: QueueName, payload: JobPayload) -> Job {
        Job {
            id: Uuid::new_v4(),
            queue,
            payload,
            priority: 0,
            attempts: 1,
            max_attempts: 3,
            created_at: Utc::now(),
            last_error: None,
        }
    }

    #[tokio::test]
    async fn deferred_capture_retries_until_authorised() {
        let fx = fixture(false);
        let (id, reference) = fx.pending_payment(1000).await;
        let processor = Arc::new(WebhookProcessor::new(
            fx.orchestrator.clone(),
            Arc::new(InMemoryCache::new()),
            fx.scheduler.clone(),
            fx.audit.clone(),
            WebhookConfig::default(),
        ));
        let handler = WebhookJobHandler::new(processor.clone());

        let capture = job(
            QueueName::Webhooks,
            JobPayload::WebhookItem {
                item: notification("CAPTURE", true, &reference, "PSP1", 1000),
            },
        );
        let err = handler.handle(&capture).await.unwrap_err();
        assert!(err.is_retryable());

        processor
            .apply(&notification("AUTHORISATION", true, &reference, "PSP1", 1000), "c")
            .await
            .unwrap();
        handler.handle(&capture).await.unwrap();

        let tx = TransactionRepository::find_by_id(&fx.ledger, id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Captured);
        assert_eq!(tx.captured_amount, 1000);
    }

    #[tokio::test]
    async fn abandoned_notification_releases_its_dedupe_claim() {
        let fx = fixture(false);
        let (_, reference) = fx.pending_payment(1000).await;
        let cache = Arc::new(InMemoryCache::new());
        let processor = Arc::new(WebhookProcessor::new(
            fx.orchestrator.clone(),
            cache.clone(),
            fx.scheduler.clone(),
            fx.audit.clone(),
            WebhookConfig::default(),
        ));
        let handler = WebhookJobHandler::new(processor.clone());
        let item = notification("CAPTURE", true, &reference, "PSP1", 1000);
        let summary = processor
            .process_batch(
                &NotificationBatch {
                    live: None,
                    notification_items: vec![NotificationItemEnvelope { item: item.clone() }],
                },
                "c",
            )
            .await
            .unwrap();
        assert_eq!(summary.queued, 1);
        let key = DedupeKey::new("CAPTURE", true, "PSP1", reference.as_str()).to_string();
        assert!(cache.get(&key).await.unwrap().is_some());

        let mut deferred = job(QueueName::Webhooks, JobPayload::WebhookItem { item });
        deferred.attempts = 2;
        assert!(handler.handle(&deferred).await.unwrap_err().is_retryable());
        assert!(cache.get(&key).await.unwrap().is_some());

        deferred.attempts = deferred.max_attempts;
        assert!(handler.handle(&deferred).await.is_err());
        assert!(cache.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_check_expires_pending_session() {
        let fx = fixture(false);
        let (id, _) = fx.pending_payment(1000).await;
        let handler = PaymentJobHandler::new(fx.orchestrator.clone());

        handler
            .handle(&job(
                QueueName::Payments,
                JobPayload::StatusCheck { transaction_id: id },
            ))
            .await
            .unwrap();
        let tx = TransactionRepository::find_by_id(&fx.ledger, id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn wrong_payload_is_permanent() {
        let fx = fixture(false);
        let handler = RefundJobHandler::new(fx.orchestrator.clone());
        let err = handler
            .handle(&job(QueueName::Refunds, JobPayload::Reconcile))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    struct ScriptedSink {
        responses: Mutex<Vec<Result<(), NotificationError>>>,
    }

    #[async_trait]
    impl NotificationSink for ScriptedSink {
        async fn deliver(&self, _event: &NotificationEvent) -> Result<(), NotificationError> {
            self.responses.lock().unwrap().remove(0)
        }
    }

    #[tokio::test]
    async fn consumer_errors_are_classified() {
        let sink = Arc::new(ScriptedSink {
            responses: Mutex::new(vec![
                Err(NotificationError::Rejected(503)),
                Err(NotificationError::Rejected(410)),
                Ok(()),
            ]),
        });
        let handler = NotificationJobHandler::new(sink);
        let notify = job(
            QueueName::Notifications,
            JobPayload::Notify {
                event: NotificationEvent {
                    event_type: NotificationType::PaymentCaptured,
                    transaction_id: Uuid::new_v4(),
                    transaction_reference: "TX-1".to_string(),
                    status: "captured".to_string(),
                    amount: 100,
                    currency: "EUR".to_string(),
                    refund_id: None,
                    occurred_at: Utc::now(),
                },
            },
        );
        assert!(handler.handle(&notify).await.unwrap_err().is_retryable());
        assert!(!handler.handle(&notify).await.unwrap_err().is_retryable());
        assert!(handler.handle(&notify).await.is_ok());
    }
}
