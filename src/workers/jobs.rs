use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::error::AppError;
use crate::payments::providers::adyen::NotificationRequestItem;
use crate::services::notification::NotificationEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Payments,
    Refunds,
    Webhooks,
    Notifications,
    Reconciliation,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        QueueName::Payments,
        QueueName::Refunds,
        QueueName::Webhooks,
        QueueName::Notifications,
        QueueName::Reconciliation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Payments => "payments",
            QueueName::Refunds => "refunds",
            QueueName::Webhooks => "webhooks",
            QueueName::Notifications => "notifications",
            QueueName::Reconciliation => "reconciliation",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| JobError::Permanent(format!("unknown queue '{}'", s)))
    }
}

/// Work items carried by the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    /// Capture an authorized transaction (auto-capture fallback)
    Capture {
        transaction_id: Uuid,
        amount: Option<i64>,
    },
    Cancel {
        transaction_id: Uuid,
    },
    /// Fail a session that never completed
    StatusCheck {
        transaction_id: Uuid,
    },
    /// Flag a refund that never received its confirmation
    RefundStatusCheck {
        refund_id: Uuid,
    },
    WebhookItem {
        item: NotificationRequestItem,
    },
    Notify {
        event: NotificationEvent,
    },
    Reconcile,
}

impl JobPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::Capture { .. } => "capture",
            JobPayload::Cancel { .. } => "cancel",
            JobPayload::StatusCheck { .. } => "status_check",
            JobPayload::RefundStatusCheck { .. } => "refund_status_check",
            JobPayload::WebhookItem { .. } => "webhook_item",
            JobPayload::Notify { .. } => "notify",
            JobPayload::Reconcile => "reconcile",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub delay: Duration,
    pub priority: Option<i32>,
    pub max_attempts: Option<u32>,
}

impl JobOptions {
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("retryable job failure: {0}")]
    Retryable(String),

    #[error("permanent job failure: {0}")]
    Permanent(String),

    #[error("queue {0} is not accepting jobs")]
    QueueClosed(String),

    #[error("job could not be persisted: {0}")]
    Store(String),
}

impl JobError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retryable(_))
    }
}

impl From<AppError> for JobError {
    fn from(err: AppError) -> Self {
        if err.is_retryable() {
            JobError::Retryable(err.to_string())
        } else {
            JobError::Permanent(err.to_string())
        }
    }
}

/// Processes jobs of one queue
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), JobError>;
}

/// Enqueue side of the pipeline, used by services that schedule follow-up work
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Schedule a job; persisting it happens in the background
    fn enqueue(
        &self,
        queue: QueueName,
        payload: JobPayload,
        options: JobOptions,
    ) -> Result<Uuid, JobError>;

    /// Schedule a job and return only once it has been persisted
    async fn enqueue_durable(
        &self,
        queue: QueueName,
        payload: JobPayload,
        options: JobOptions,
    ) -> Result<Uuid, JobError> {
        self.enqueue(queue, payload, options)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: QueueName,
    pub payload: JobPayload,
    pub priority: i32,
    /// Attempts started so far, including the current one
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_error: Option<String>,
}
