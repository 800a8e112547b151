//! Periodic reconciliation sweep
//!
//! Finds ledger rows that should have moved on by now: sessions that were never
//! authorised, authorisations that were never captured or voided, and refunds the
//! gateway never confirmed. Expired sessions are failed; the rest are reported for
//! operators since only the gateway can say what actually happened to them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::database::refund_repository::{RefundRepository, RefundStatus};
use crate::database::transaction_repository::{TransactionRepository, TransactionStatus};
use crate::services::audit::{actions, AuditEvent, AuditRecorder};
use crate::services::payment_orchestrator::{OrchestratorResult, PaymentOrchestrator};

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub session_expiry: Duration,
    /// Authorisations older than this are reported
    pub authorization_max_age: Duration,
    /// Unconfirmed refunds older than this are reported
    pub refund_max_age: Duration,
    /// Rows examined per category per run
    pub batch_size: i64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            session_expiry: Duration::from_secs(3600),
            authorization_max_age: Duration::from_secs(7 * 86_400),
            refund_max_age: Duration::from_secs(86_400),
            batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleEntry {
    pub id: Uuid,
    pub reference: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub expired_sessions: Vec<StaleEntry>,
    pub stale_authorizations: Vec<StaleEntry>,
    pub stuck_refunds: Vec<StaleEntry>,
    pub errors: Vec<String>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.expired_sessions.is_empty()
            && self.stale_authorizations.is_empty()
            && self.stuck_refunds.is_empty()
            && self.errors.is_empty()
    }
}

fn cutoff(age: Duration) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero())
}

pub struct Reconciler {
    orchestrator: Arc<PaymentOrchestrator>,
    transactions: Arc<dyn TransactionRepository>,
    refunds: Arc<dyn RefundRepository>,
    audit: AuditRecorder,
    config: ReconciliationConfig,
}

impl Reconciler {
    pub fn new(
        orchestrator: Arc<PaymentOrchestrator>,
        transactions: Arc<dyn TransactionRepository>,
        refunds: Arc<dyn RefundRepository>,
        audit: AuditRecorder,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            orchestrator,
            transactions,
            refunds,
            audit,
            config,
        }
    }

    pub async fn run(&self) -> OrchestratorResult<ReconciliationReport> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let mut errors = Vec::new();
        info!(run_id = %run_id, "reconciliation started");

        let mut expired_sessions = Vec::new();
        let pending = self
            .transactions
            .find_stale(
                TransactionStatus::Pending,
                cutoff(self.config.session_expiry),
                self.config.batch_size,
            )
            .await?;
        for tx in pending {
            match self.orchestrator.expire_session(tx.id).await {
                Ok(true) => expired_sessions.push(StaleEntry {
                    id: tx.id,
                    reference: tx.reference,
                    status: TransactionStatus::Failed.to_string(),
                    amount: tx.amount,
                    currency: tx.currency,
                    last_updated: tx.updated_at,
                }),
                Ok(false) => {}
                Err(e) => errors.push(format!("expire {}: {}", tx.id, e)),
            }
        }

        let stale_authorizations: Vec<StaleEntry> = self
            .transactions
            .find_stale(
                TransactionStatus::Authorized,
                cutoff(self.config.authorization_max_age),
                self.config.batch_size,
            )
            .await?
            .into_iter()
            .map(|tx| StaleEntry {
                id: tx.id,
                reference: tx.reference,
                status: tx.status.to_string(),
                amount: tx.authorized_amount,
                currency: tx.currency,
                last_updated: tx.updated_at,
            })
            .collect();

        let mut stuck_refunds = Vec::new();
        for status in [RefundStatus::Pending, RefundStatus::Processing] {
            let refunds = self
                .refunds
                .find_stale(status, cutoff(self.config.refund_max_age), self.config.batch_size)
                .await?;
            stuck_refunds.extend(refunds.into_iter().map(|r| StaleEntry {
                id: r.id,
                reference: r.reference,
                status: r.status.to_string(),
                amount: r.amount,
                currency: r.currency,
                last_updated: r.updated_at,
            }));
        }

        let report = ReconciliationReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            expired_sessions,
            stale_authorizations,
            stuck_refunds,
            errors,
        };

        if report.is_clean() {
            info!(run_id = %run_id, "reconciliation found nothing to report");
        } else {
            warn!(
                run_id = %run_id,
                expired_sessions = report.expired_sessions.len(),
                stale_authorizations = report.stale_authorizations.len(),
                stuck_refunds = report.stuck_refunds.len(),
                errors = report.errors.len(),
                "reconciliation found discrepancies"
            );
        }

        let mut event = AuditEvent::new(actions::RECONCILIATION_RUN, "reconciliation", run_id.to_string())
            .correlation(run_id.to_string())
            .response(serde_json::to_value(&report).unwrap_or_default());
        event.duration = (report.finished_at - started_at).to_std().unwrap_or_default();
        self.audit.record(event);

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::transaction_repository::{Transaction, TransactionMetadata};
    use crate::database::InMemoryLedger;
    use crate::payments::error::{GatewayError, GatewayResult};
    use crate::payments::provider::PaymentGateway;
    use crate::payments::types::*;
    use crate::services::notification::Notifier;
    use crate::services::payment_orchestrator::OrchestratorConfig;
    use crate::workers::jobs::{JobError, JobOptions, JobPayload, JobScheduler, QueueName};
    use async_trait::async_trait;

    struct UnusedGateway;

    #[async_trait]
    impl PaymentGateway for UnusedGateway {
        async fn create_session(&self, _r: SessionRequest) -> GatewayResult<SessionResponse> {
            Err(GatewayError::Network {
                message: "unused".to_string(),
            })
        }
        async fn capture(&self, _r: CaptureRequest) -> GatewayResult<ModificationResponse> {
            Err(GatewayError::Network {
                message: "unused".to_string(),
            })
        }
        async fn refund(&self, _r: RefundRequest) -> GatewayResult<ModificationResponse> {
            Err(GatewayError::Network {
                message: "unused".to_string(),
            })
        }
        async fn cancel(&self, _r: CancelRequest) -> GatewayResult<ModificationResponse> {
            Err(GatewayError::Network {
                message: "unused".to_string(),
            })
        }
        async fn payment_methods(
            &self,
            _q: PaymentMethodsQuery,
        ) -> GatewayResult<Vec<PaymentMethodInfo>> {
            Ok(vec![])
        }
        fn name(&self) -> &'static str {
            "unused"
        }
    }

    struct NullScheduler;

    impl JobScheduler for NullScheduler {
        fn enqueue(&self, _q: QueueName, _p: JobPayload, _o: JobOptions) -> Result<Uuid, JobError> {
            Ok(Uuid::new_v4())
        }
    }

    #[tokio::test]
    async fn stale_pending_sessions_are_failed_and_reported() {
        let ledger = InMemoryLedger::new();
        let (audit, _writer) = AuditRecorder::spawn(Arc::new(ledger.clone()), 16);
        let orchestrator = Arc::new(PaymentOrchestrator::new(
            Arc::new(ledger.clone()),
            Arc::new(ledger.clone()),
            Arc::new(UnusedGateway),
            Arc::new(NullScheduler),
            Notifier::new(Arc::new(NullScheduler)),
            audit.clone(),
            OrchestratorConfig::default(),
        ));

        let mut old = Transaction::new_pending(
            "user-1",
            1000,
            "EUR",
            "order",
            "o-1",
            "https://shop.test/r",
            TransactionMetadata::default(),
        );
        old.updated_at = Utc::now() - chrono::Duration::hours(3);
        TransactionRepository::insert(&ledger, &old).await.unwrap();
        let fresh = Transaction::new_pending(
            "user-1",
            1000,
            "EUR",
            "order",
            "o-2",
            "https://shop.test/r",
            TransactionMetadata::default(),
        );
        TransactionRepository::insert(&ledger, &fresh).await.unwrap();

        let reconciler = Reconciler::new(
            orchestrator,
            Arc::new(ledger.clone()),
            Arc::new(ledger.clone()),
            audit.clone(),
            ReconciliationConfig::default(),
        );
        let report = reconciler.run().await.unwrap();

        assert_eq!(report.expired_sessions.len(), 1);
        assert_eq!(report.expired_sessions[0].id, old.id);
        assert!(report.errors.is_empty());

        let after = TransactionRepository::find_by_id(&ledger, fresh.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, TransactionStatus::Pending);

        audit.flush().await.unwrap();
        let entries = ledger.audit_entries().await;
        assert!(entries
            .iter()
            .any(|e| e.action == actions::RECONCILIATION_RUN));
    }
}
