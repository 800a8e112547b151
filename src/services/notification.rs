//! Best-effort notifications to the downstream consumer
//!
//! Orchestrator state changes are published as [`NotificationEvent`]s onto the
//! notifications queue; the queue worker delivers them through a [`NotificationSink`].
//! Nothing here can fail a payment operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::database::refund_repository::Refund;
use crate::database::transaction_repository::Transaction;
use crate::workers::jobs::{JobOptions, JobPayload, JobScheduler, QueueName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    PaymentCreated,
    PaymentAuthorized,
    PaymentCaptured,
    PaymentCancelled,
    PaymentFailed,
    RefundRequested,
    RefundCompleted,
    RefundFailed,
    RefundStuck,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::PaymentCreated => "payment.created",
            NotificationType::PaymentAuthorized => "payment.authorized",
            NotificationType::PaymentCaptured => "payment.captured",
            NotificationType::PaymentCancelled => "payment.cancelled",
            NotificationType::PaymentFailed => "payment.failed",
            NotificationType::RefundRequested => "refund.requested",
            NotificationType::RefundCompleted => "refund.completed",
            NotificationType::RefundFailed => "refund.failed",
            NotificationType::RefundStuck => "refund.stuck",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub event_type: NotificationType,
    pub transaction_id: Uuid,
    pub transaction_reference: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn for_transaction(event_type: NotificationType, tx: &Transaction) -> Self {
        Self {
            event_type,
            transaction_id: tx.id,
            transaction_reference: tx.reference.clone(),
            status: tx.status.to_string(),
            amount: tx.amount,
            currency: tx.currency.clone(),
            refund_id: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn for_refund(event_type: NotificationType, tx: &Transaction, refund: &Refund) -> Self {
        Self {
            event_type,
            transaction_id: tx.id,
            transaction_reference: tx.reference.clone(),
            status: refund.status.to_string(),
            amount: refund.amount,
            currency: refund.currency.clone(),
            refund_id: Some(refund.id),
            occurred_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),

    #[error("notification consumer returned HTTP {0}")]
    Rejected(u16),
}

/// Where notifications end up
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotificationError>;
}

/// POSTs events as JSON to the consumer's webhook URL
pub struct HttpNotificationSink {
    client: reqwest::Client,
    url: String,
}

impl HttpNotificationSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotificationError::Delivery(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for HttpNotificationSink {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| NotificationError::Delivery(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotificationError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

/// Used when no consumer URL is configured
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotificationError> {
        info!(
            event_type = event.event_type.as_str(),
            transaction_id = %event.transaction_id,
            reference = %event.transaction_reference,
            status = %event.status,
            amount = event.amount,
            currency = %event.currency,
            "notification"
        );
        Ok(())
    }
}

/// Publishes events onto the notifications queue
#[derive(Clone)]
pub struct Notifier {
    scheduler: Arc<dyn JobScheduler>,
}

impl Notifier {
    pub fn new(scheduler: Arc<dyn JobScheduler>) -> Self {
        Self { scheduler }
    }

    pub fn publish(&self, event: NotificationEvent) {
        let event_type = event.event_type;
        let transaction_id = event.transaction_id;
        if let Err(e) = self.scheduler.enqueue(
            QueueName::Notifications,
            JobPayload::Notify { event },
            JobOptions::default(),
        ) {
            warn!(
                event_type = event_type.as_str(),
                transaction_id = %transaction_id,
                error = %e,
                "failed to queue notification"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::transaction_repository::TransactionMetadata;

    #[test]
    fn event_serializes_type_and_omits_missing_refund() {
        let tx = Transaction::new_pending(
            "user-1",
            5000,
            "EUR",
            "booking",
            "b-1",
            "https://shop.test/return",
            TransactionMetadata::default(),
        );
        let event = NotificationEvent::for_transaction(NotificationType::PaymentCreated, &tx);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "payment_created");
        assert_eq!(json["status"], "pending");
        assert!(json.get("refund_id").is_none());
    }

    #[tokio::test]
    async fn log_sink_always_succeeds() {
        let tx = Transaction::new_pending(
            "user-1",
            100,
            "USD",
            "order",
            "o-1",
            "https://shop.test/return",
            TransactionMetadata::default(),
        );
        let event = NotificationEvent::for_transaction(NotificationType::PaymentFailed, &tx);
        assert!(LogNotificationSink.deliver(&event).await.is_ok());
    }
}
