//! Services module for business logic and integrations

pub mod audit;
pub mod circuit_breaker;
pub mod idempotency;
pub mod locks;
pub mod notification;
pub mod payment_orchestrator;
pub mod reconciliation;
pub mod webhook_processor;

#[cfg(test)]
pub(crate) mod test_support;

pub use audit::{AuditEvent, AuditRecorder};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry};
pub use idempotency::{IdempotencyConfig, IdempotencyGuard};
pub use notification::{NotificationSink, Notifier};
pub use payment_orchestrator::{
    Actor, ActorRole, OrchestratorConfig, OrchestratorError, OrchestratorResult,
    PaymentOrchestrator,
};
pub use reconciliation::{ReconciliationReport, Reconciler};
pub use webhook_processor::{WebhookAck, WebhookConfig, WebhookProcessor};
