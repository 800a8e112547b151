//! In-process ledger for tests and `SKIP_EXTERNALS` runs.
//!
//! Enforces the same constraints as the Postgres schema: unique references,
//! version-checked transaction updates and an append-only audit log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::audit_repository::{AuditFilter, AuditLogEntry, AuditRepository};
use super::error::{DatabaseError, DbResult};
use super::refund_repository::{Refund, RefundRepository, RefundStatus};
use super::transaction_repository::{
    Page, Transaction, TransactionFilter, TransactionRepository, TransactionStatus,
};

#[derive(Default)]
struct LedgerState {
    transactions: HashMap<Uuid, Transaction>,
    refunds: HashMap<Uuid, Refund>,
    audit: Vec<AuditLogEntry>,
}

#[derive(Clone, Default)]
pub struct InMemoryLedger {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn transaction_count(&self) -> usize {
        self.state.read().await.transactions.len()
    }

    pub async fn audit_entries(&self) -> Vec<AuditLogEntry> {
        self.state.read().await.audit.clone()
    }
}

#[async_trait]
impl TransactionRepository for InMemoryLedger {
    async fn insert(&self, tx: &Transaction) -> DbResult<Transaction> {
        let mut state = self.state.write().await;
        if state
            .transactions
            .values()
            .any(|t| t.id == tx.id || t.reference == tx.reference)
        {
            return Err(DatabaseError::UniqueViolation(format!(
                "transaction {} already exists",
                tx.reference
            )));
        }
        state.transactions.insert(tx.id, tx.clone());
        Ok(tx.clone())
    }

    async fn find_by_id(&self, id: Uuid) -> DbResult<Option<Transaction>> {
        Ok(self.state.read().await.transactions.get(&id).cloned())
    }

    async fn find_by_reference(&self, reference: &str) -> DbResult<Option<Transaction>> {
        Ok(self
            .state
            .read()
            .await
            .transactions
            .values()
            .find(|t| t.reference == reference)
            .cloned())
    }

    async fn find_by_gateway_reference(
        &self,
        gateway_reference: &str,
    ) -> DbResult<Option<Transaction>> {
        Ok(self
            .state
            .read()
            .await
            .transactions
            .values()
            .find(|t| t.gateway_reference.as_deref() == Some(gateway_reference))
            .cloned())
    }

    async fn update(&self, tx: &Transaction) -> DbResult<Transaction> {
        let mut state = self.state.write().await;
        let stored = state
            .transactions
            .get_mut(&tx.id)
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "transaction",
                id: tx.id.to_string(),
            })?;

        if stored.version != tx.version {
            return Err(DatabaseError::VersionConflict {
                entity: "transaction",
                id: tx.id.to_string(),
                expected_version: tx.version,
            });
        }

        let mut updated = tx.clone();
        updated.version += 1;
        updated.updated_at = Utc::now();
        *stored = updated.clone();
        Ok(updated)
    }

    async fn list(&self, filter: &TransactionFilter) -> DbResult<Page<Transaction>> {
        let state = self.state.read().await;
        let mut matching: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as i64;
        let items = matching
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect();

        Ok(Page {
            items,
            total,
            limit: filter.limit,
            offset: filter.offset,
        })
    }

    async fn find_stale(
        &self,
        status: TransactionStatus,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Transaction>> {
        let state = self.state.read().await;
        let mut stale: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|t| t.status == status && t.updated_at < older_than)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }
}

#[async_trait]
impl RefundRepository for InMemoryLedger {
    async fn insert(&self, refund: &Refund) -> DbResult<Refund> {
        let mut state = self.state.write().await;
        if !state.transactions.contains_key(&refund.transaction_id) {
            return Err(DatabaseError::NotFound {
                entity: "transaction",
                id: refund.transaction_id.to_string(),
            });
        }
        if state.refunds.values().any(|r| r.reference == refund.reference) {
            return Err(DatabaseError::UniqueViolation(format!(
                "refund {} already exists",
                refund.reference
            )));
        }
        state.refunds.insert(refund.id, refund.clone());
        Ok(refund.clone())
    }

    async fn find_by_id(&self, id: Uuid) -> DbResult<Option<Refund>> {
        Ok(self.state.read().await.refunds.get(&id).cloned())
    }

    async fn find_by_reference(&self, reference: &str) -> DbResult<Option<Refund>> {
        Ok(self
            .state
            .read()
            .await
            .refunds
            .values()
            .find(|r| r.reference == reference)
            .cloned())
    }

    async fn find_by_gateway_reference(&self, gateway_reference: &str) -> DbResult<Option<Refund>> {
        Ok(self
            .state
            .read()
            .await
            .refunds
            .values()
            .find(|r| r.gateway_reference.as_deref() == Some(gateway_reference))
            .cloned())
    }

    async fn list_for_transaction(&self, transaction_id: Uuid) -> DbResult<Vec<Refund>> {
        let state = self.state.read().await;
        let mut refunds: Vec<Refund> = state
            .refunds
            .values()
            .filter(|r| r.transaction_id == transaction_id)
            .cloned()
            .collect();
        refunds.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(refunds)
    }

    async fn update(&self, refund: &Refund) -> DbResult<Refund> {
        let mut state = self.state.write().await;
        let stored = state
            .refunds
            .get_mut(&refund.id)
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "refund",
                id: refund.id.to_string(),
            })?;
        let mut updated = refund.clone();
        updated.updated_at = Utc::now();
        *stored = updated.clone();
        Ok(updated)
    }

    async fn find_stale(
        &self,
        status: RefundStatus,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Refund>> {
        let state = self.state.read().await;
        let mut stale: Vec<Refund> = state
            .refunds
            .values()
            .filter(|r| r.status == status && r.updated_at < older_than)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }
}

#[async_trait]
impl AuditRepository for InMemoryLedger {
    async fn append(&self, entry: &AuditLogEntry) -> DbResult<()> {
        let mut state = self.state.write().await;
        if state.audit.iter().any(|e| e.id == entry.id) {
            return Err(DatabaseError::AppendOnly {
                table: "audit_logs",
                message: format!("entry {} already exists", entry.id),
            });
        }
        state.audit.push(entry.clone());
        Ok(())
    }

    async fn list(&self, filter: &AuditFilter) -> DbResult<Vec<AuditLogEntry>> {
        let state = self.state.read().await;
        Ok(state
            .audit
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(filter.limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn update(&self, entry: &AuditLogEntry) -> DbResult<()> {
        Err(DatabaseError::AppendOnly {
            table: "audit_logs",
            message: format!("UPDATE of entry {} rejected", entry.id),
        })
    }

    async fn delete(&self, id: Uuid) -> DbResult<()> {
        Err(DatabaseError::AppendOnly {
            table: "audit_logs",
            message: format!("DELETE of entry {} rejected", id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::refund_repository::RefundReason;
    use crate::database::transaction_repository::TransactionMetadata;

    fn pending() -> Transaction {
        Transaction::new_pending(
            "user-1",
            5000,
            "EUR",
            "booking",
            "b-1",
            "https://shop.example/return",
            TransactionMetadata::default(),
        )
    }

    #[tokio::test]
    async fn update_bumps_version_and_rejects_stale_writes() {
        let ledger = InMemoryLedger::new();
        let tx = TransactionRepository::insert(&ledger, &pending()).await.unwrap();

        let mut first = tx.clone();
        first.transition_to(TransactionStatus::Authorized);
        let saved = TransactionRepository::update(&ledger, &first).await.unwrap();
        assert_eq!(saved.version, 1);

        let mut stale = tx.clone();
        stale.transition_to(TransactionStatus::Failed);
        let err = TransactionRepository::update(&ledger, &stale).await.unwrap_err();
        assert!(matches!(err, DatabaseError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn refund_requires_existing_transaction() {
        let ledger = InMemoryLedger::new();
        let refund = Refund::new_pending(
            Uuid::new_v4(),
            100,
            "EUR",
            RefundReason::Other,
            None,
            "admin",
        );
        assert!(RefundRepository::insert(&ledger, &refund).await.is_err());
    }

    #[tokio::test]
    async fn list_paginates_newest_first() {
        let ledger = InMemoryLedger::new();
        for _ in 0..5 {
            TransactionRepository::insert(&ledger, &pending()).await.unwrap();
        }
        let page = TransactionRepository::list(
            &ledger,
            &TransactionFilter {
                limit: 2,
                offset: 0,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert!(page.items[0].created_at >= page.items[1].created_at);
    }
}
