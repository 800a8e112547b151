use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::database::error::{DatabaseError, DbResult};
use crate::database::transaction_repository::generate_reference;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "pending",
            RefundStatus::Processing => "processing",
            RefundStatus::Completed => "completed",
            RefundStatus::Failed => "failed",
        }
    }

    /// Refunds that still hold part of the refundable balance
    pub fn is_in_flight(&self) -> bool {
        matches!(self, RefundStatus::Pending | RefundStatus::Processing)
    }
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefundStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RefundStatus::Pending),
            "processing" => Ok(RefundStatus::Processing),
            "completed" => Ok(RefundStatus::Completed),
            "failed" => Ok(RefundStatus::Failed),
            other => Err(DatabaseError::Decode(format!(
                "unknown refund status '{}'",
                other
            ))),
        }
    }
}

/// Why a refund was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    RequestedByCustomer,
    Duplicate,
    Fraudulent,
    ServiceNotProvided,
    Other,
}

impl RefundReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundReason::RequestedByCustomer => "requested_by_customer",
            RefundReason::Duplicate => "duplicate",
            RefundReason::Fraudulent => "fraudulent",
            RefundReason::ServiceNotProvided => "service_not_provided",
            RefundReason::Other => "other",
        }
    }
}

impl FromStr for RefundReason {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested_by_customer" => Ok(RefundReason::RequestedByCustomer),
            "duplicate" => Ok(RefundReason::Duplicate),
            "fraudulent" => Ok(RefundReason::Fraudulent),
            "service_not_provided" => Ok(RefundReason::ServiceNotProvided),
            "other" => Ok(RefundReason::Other),
            other => Err(DatabaseError::Decode(format!(
                "unknown refund reason '{}'",
                other
            ))),
        }
    }
}

/// Refund entity; belongs to a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refund {
    pub id: Uuid,
    pub reference: String,
    pub transaction_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub reason: RefundReason,
    pub reason_details: Option<String>,
    pub status: RefundStatus,
    pub gateway_reference: Option<String>,
    pub initiated_by: String,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Refund {
    pub fn new_pending(
        transaction_id: Uuid,
        amount: i64,
        currency: impl Into<String>,
        reason: RefundReason,
        reason_details: Option<String>,
        initiated_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4();
        Self {
            id,
            reference: generate_reference("RF", id, now),
            transaction_id,
            amount,
            currency: currency.into(),
            reason,
            reason_details,
            status: RefundStatus::Pending,
            gateway_reference: None,
            initiated_by: initiated_by.into(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

#[async_trait]
pub trait RefundRepository: Send + Sync {
    async fn insert(&self, refund: &Refund) -> DbResult<Refund>;

    async fn find_by_id(&self, id: Uuid) -> DbResult<Option<Refund>>;

    async fn find_by_reference(&self, reference: &str) -> DbResult<Option<Refund>>;

    async fn find_by_gateway_reference(&self, gateway_reference: &str)
        -> DbResult<Option<Refund>>;

    /// Refunds for one transaction, oldest first
    async fn list_for_transaction(&self, transaction_id: Uuid) -> DbResult<Vec<Refund>>;

    async fn update(&self, refund: &Refund) -> DbResult<Refund>;

    async fn find_stale(
        &self,
        status: RefundStatus,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Refund>>;
}

#[cfg(feature = "database")]
pub use postgres::PgRefundRepository;

#[cfg(feature = "database")]
mod postgres {
    use super::*;
    use sqlx::{FromRow, PgPool};

    const COLUMNS: &str = "id, reference, transaction_id, amount, currency, reason, \
         reason_details, status, gateway_reference, initiated_by, failure_reason, \
         created_at, updated_at, completed_at";

    #[derive(Debug, FromRow)]
    struct RefundRow {
        id: Uuid,
        reference: String,
        transaction_id: Uuid,
        amount: i64,
        currency: String,
        reason: String,
        reason_details: Option<String>,
        status: String,
        gateway_reference: Option<String>,
        initiated_by: String,
        failure_reason: Option<String>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        completed_at: Option<DateTime<Utc>>,
    }

    impl TryFrom<RefundRow> for Refund {
        type Error = DatabaseError;

        fn try_from(row: RefundRow) -> Result<Self, Self::Error> {
            Ok(Refund {
                id: row.id,
                reference: row.reference,
                transaction_id: row.transaction_id,
                amount: row.amount,
                currency: row.currency,
                reason: row.reason.parse()?,
                reason_details: row.reason_details,
                status: row.status.parse()?,
                gateway_reference: row.gateway_reference,
                initiated_by: row.initiated_by,
                failure_reason: row.failure_reason,
                created_at: row.created_at,
                updated_at: row.updated_at,
                completed_at: row.completed_at,
            })
        }
    }

    #[derive(Clone)]
    pub struct PgRefundRepository {
        pool: PgPool,
    }

    impl PgRefundRepository {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        async fn find_one(&self, column: &str, value: &str) -> DbResult<Option<Refund>> {
            let row = sqlx::query_as::<_, RefundRow>(&format!(
                "SELECT {} FROM refunds WHERE {} = $1",
                COLUMNS, column
            ))
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            row.map(Refund::try_from).transpose()
        }
    }

    #[async_trait]
    impl RefundRepository for PgRefundRepository {
        async fn insert(&self, refund: &Refund) -> DbResult<Refund> {
            let row = sqlx::query_as::<_, RefundRow>(&format!(
                "INSERT INTO refunds
                 (id, reference, transaction_id, amount, currency, reason, reason_details,
                  status, gateway_reference, initiated_by, failure_reason, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
                 RETURNING {}",
                COLUMNS
            ))
            .bind(refund.id)
            .bind(&refund.reference)
            .bind(refund.transaction_id)
            .bind(refund.amount)
            .bind(&refund.currency)
            .bind(refund.reason.as_str())
            .bind(&refund.reason_details)
            .bind(refund.status.as_str())
            .bind(&refund.gateway_reference)
            .bind(&refund.initiated_by)
            .bind(&refund.failure_reason)
            .bind(refund.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            Refund::try_from(row)
        }

        async fn find_by_id(&self, id: Uuid) -> DbResult<Option<Refund>> {
            let row = sqlx::query_as::<_, RefundRow>(&format!(
                "SELECT {} FROM refunds WHERE id = $1",
                COLUMNS
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            row.map(Refund::try_from).transpose()
        }

        async fn find_by_reference(&self, reference: &str) -> DbResult<Option<Refund>> {
            self.find_one("reference", reference).await
        }

        async fn find_by_gateway_reference(
            &self,
            gateway_reference: &str,
        ) -> DbResult<Option<Refund>> {
            self.find_one("gateway_reference", gateway_reference).await
        }

        async fn list_for_transaction(&self, transaction_id: Uuid) -> DbResult<Vec<Refund>> {
            let rows = sqlx::query_as::<_, RefundRow>(&format!(
                "SELECT {} FROM refunds WHERE transaction_id = $1 ORDER BY created_at ASC",
                COLUMNS
            ))
            .bind(transaction_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            rows.into_iter().map(Refund::try_from).collect()
        }

        async fn update(&self, refund: &Refund) -> DbResult<Refund> {
            let row = sqlx::query_as::<_, RefundRow>(&format!(
                "UPDATE refunds
                 SET status = $2, gateway_reference = $3, failure_reason = $4,
                     completed_at = $5, updated_at = NOW()
                 WHERE id = $1
                 RETURNING {}",
                COLUMNS
            ))
            .bind(refund.id)
            .bind(refund.status.as_str())
            .bind(&refund.gateway_reference)
            .bind(&refund.failure_reason)
            .bind(refund.completed_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            match row {
                Some(row) => Refund::try_from(row),
                None => Err(DatabaseError::NotFound {
                    entity: "refund",
                    id: refund.id.to_string(),
                }),
            }
        }

        async fn find_stale(
            &self,
            status: RefundStatus,
            older_than: DateTime<Utc>,
            limit: i64,
        ) -> DbResult<Vec<Refund>> {
            let rows = sqlx::query_as::<_, RefundRow>(&format!(
                "SELECT {} FROM refunds
                 WHERE status = $1 AND updated_at < $2
                 ORDER BY updated_at ASC
                 LIMIT $3",
                COLUMNS
            ))
            .bind(status.as_str())
            .bind(older_than)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            rows.into_iter().map(Refund::try_from).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_statuses() {
        assert!(RefundStatus::Pending.is_in_flight());
        assert!(RefundStatus::Processing.is_in_flight());
        assert!(!RefundStatus::Completed.is_in_flight());
        assert!(!RefundStatus::Failed.is_in_flight());
    }

    #[test]
    fn test_reason_parsing() {
        assert_eq!(
            "requested_by_customer".parse::<RefundReason>().unwrap(),
            RefundReason::RequestedByCustomer
        );
        assert!("because".parse::<RefundReason>().is_err());
    }

    #[test]
    fn test_new_refund_is_pending() {
        let refund = Refund::new_pending(
            Uuid::new_v4(),
            2000,
            "EUR",
            RefundReason::Duplicate,
            None,
            "admin-1",
        );
        assert_eq!(refund.status, RefundStatus::Pending);
        assert!(refund.reference.starts_with("RF-"));
    }
}
