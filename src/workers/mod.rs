//! Job pipeline: named queues, their dispatchers and handlers

pub mod handlers;
pub mod jobs;
pub mod queue;
pub mod scheduler;
pub mod store;

pub use handlers::{
    NotificationJobHandler, PaymentJobHandler, ReconciliationJobHandler, RefundJobHandler,
    WebhookJobHandler,
};
pub use jobs::{Job, JobError, JobHandler, JobOptions, JobPayload, JobScheduler, QueueName};
pub use queue::{JobQueue, QueueConfig, QueueManager, QueueStats};
pub use scheduler::ReconciliationScheduler;
pub use store::{JobStore, JobStoreConfig};
