use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::database::error::{DatabaseError, DbResult};

/// Upper bound on caller-supplied metadata entries per transaction
pub const MAX_METADATA_ENTRIES: usize = 50;

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Authorized,
    Captured,
    PartiallyRefunded,
    Refunded,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Authorized => "authorized",
            TransactionStatus::Captured => "captured",
            TransactionStatus::PartiallyRefunded => "partially_refunded",
            TransactionStatus::Refunded => "refunded",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    pub fn valid_transitions(&self) -> &'static [TransactionStatus] {
        use TransactionStatus::*;
        match self {
            Pending => &[Authorized, Failed, Cancelled],
            Authorized => &[Captured, Failed, Cancelled],
            Captured => &[PartiallyRefunded, Refunded],
            PartiallyRefunded => &[PartiallyRefunded, Refunded],
            Refunded | Failed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        self.valid_transitions().is_empty()
    }

    /// Refunds may be issued against captured funds only
    pub fn is_refundable(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Captured | TransactionStatus::PartiallyRefunded
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "authorized" => Ok(TransactionStatus::Authorized),
            "captured" => Ok(TransactionStatus::Captured),
            "partially_refunded" => Ok(TransactionStatus::PartiallyRefunded),
            "refunded" => Ok(TransactionStatus::Refunded),
            "failed" => Ok(TransactionStatus::Failed),
            "cancelled" => Ok(TransactionStatus::Cancelled),
            other => Err(DatabaseError::Decode(format!(
                "unknown transaction status '{}'",
                other
            ))),
        }
    }
}

// ============================================================================
// Entity
// ============================================================================

/// Free-form metadata with the fields the orchestrator reads pulled out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refusal_reason: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl TransactionMetadata {
    pub fn with_extra(extra: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            extra,
            ..Self::default()
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }

    pub fn from_json(value: serde_json::Value) -> DbResult<Self> {
        serde_json::from_value(value).map_err(|e| DatabaseError::Decode(e.to_string()))
    }
}

/// Transaction entity. Amounts are in minor currency units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub reference: String,
    pub gateway_reference: Option<String>,
    pub owner_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub amount: i64,
    pub currency: String,
    pub status: TransactionStatus,
    pub authorized_amount: i64,
    pub captured_amount: i64,
    pub refunded_amount: i64,
    pub payment_method: Option<String>,
    pub return_url: String,
    pub metadata: TransactionMetadata,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub authorized_at: Option<DateTime<Utc>>,
    pub captured_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn new_pending(
        owner_id: impl Into<String>,
        amount: i64,
        currency: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        return_url: impl Into<String>,
        metadata: TransactionMetadata,
    ) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4();
        Self {
            id,
            reference: generate_reference("TX", id, now),
            gateway_reference: None,
            owner_id: owner_id.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            amount,
            currency: currency.into(),
            status: TransactionStatus::Pending,
            authorized_amount: 0,
            captured_amount: 0,
            refunded_amount: 0,
            payment_method: None,
            return_url: return_url.into(),
            metadata,
            version: 0,
            created_at: now,
            updated_at: now,
            authorized_at: None,
            captured_at: None,
            refunded_at: None,
            failed_at: None,
            cancelled_at: None,
        }
    }

    /// Captured funds not yet returned
    pub fn remaining_refundable(&self) -> i64 {
        self.captured_amount - self.refunded_amount
    }

    /// `0 <= captured <= authorized` and `0 <= refunded <= captured`
    pub fn amounts_consistent(&self) -> bool {
        0 <= self.captured_amount
            && self.captured_amount <= self.authorized_amount
            && 0 <= self.refunded_amount
            && self.refunded_amount <= self.captured_amount
    }

    /// Move to `next`, stamping the matching transition timestamp.
    pub fn transition_to(&mut self, next: TransactionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        match next {
            TransactionStatus::Authorized => self.authorized_at = Some(now),
            TransactionStatus::Captured => self.captured_at = Some(now),
            TransactionStatus::Refunded | TransactionStatus::PartiallyRefunded => {
                self.refunded_at = Some(now)
            }
            TransactionStatus::Failed => self.failed_at = Some(now),
            TransactionStatus::Cancelled => self.cancelled_at = Some(now),
            TransactionStatus::Pending => {}
        }
        self.status = next;
        true
    }
}

/// Human-readable reference: `<PREFIX>-YYYYMMDD-<8 hex>`
pub fn generate_reference(prefix: &str, id: Uuid, at: DateTime<Utc>) -> String {
    let simple = id.simple().to_string();
    format!(
        "{}-{}-{}",
        prefix,
        at.format("%Y%m%d"),
        simple[..8].to_uppercase()
    )
}

// ============================================================================
// Queries
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub status: Option<TransactionStatus>,
    pub owner_id: Option<String>,
    pub currency: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl TransactionFilter {
    pub fn matches(&self, tx: &Transaction) -> bool {
        self.status.map_or(true, |s| tx.status == s)
            && self.owner_id.as_deref().map_or(true, |o| tx.owner_id == o)
            && self.currency.as_deref().map_or(true, |c| tx.currency == c)
            && self.created_after.map_or(true, |t| tx.created_at >= t)
            && self.created_before.map_or(true, |t| tx.created_at < t)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Durable store of transactions. No business rules live here.
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    async fn insert(&self, tx: &Transaction) -> DbResult<Transaction>;

    async fn find_by_id(&self, id: Uuid) -> DbResult<Option<Transaction>>;

    async fn find_by_reference(&self, reference: &str) -> DbResult<Option<Transaction>>;

    async fn find_by_gateway_reference(&self, gateway_reference: &str)
        -> DbResult<Option<Transaction>>;

    /// Persist `tx` if the stored version still equals `tx.version`.
    /// Returns the stored row with the version incremented.
    async fn update(&self, tx: &Transaction) -> DbResult<Transaction>;

    async fn list(&self, filter: &TransactionFilter) -> DbResult<Page<Transaction>>;

    /// Transactions in `status` last touched before `older_than`, oldest first
    async fn find_stale(
        &self,
        status: TransactionStatus,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Transaction>>;
}

// ============================================================================
// Postgres
// ============================================================================

#[cfg(feature = "database")]
pub use postgres::PgTransactionRepository;

#[cfg(feature = "database")]
mod postgres {
    use super::*;
    use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};

    const COLUMNS: &str = "id, reference, gateway_reference, owner_id, resource_type, resource_id, \
         amount, currency, status, authorized_amount, captured_amount, refunded_amount, \
         payment_method, return_url, metadata, version, created_at, updated_at, \
         authorized_at, captured_at, refunded_at, failed_at, cancelled_at";

    #[derive(Debug, FromRow)]
    struct TransactionRow {
        id: Uuid,
        reference: String,
        gateway_reference: Option<String>,
        owner_id: String,
        resource_type: String,
        resource_id: String,
        amount: i64,
        currency: String,
        status: String,
        authorized_amount: i64,
        captured_amount: i64,
        refunded_amount: i64,
        payment_method: Option<String>,
        return_url: String,
        metadata: serde_json::Value,
        version: i64,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        authorized_at: Option<DateTime<Utc>>,
        captured_at: Option<DateTime<Utc>>,
        refunded_at: Option<DateTime<Utc>>,
        failed_at: Option<DateTime<Utc>>,
        cancelled_at: Option<DateTime<Utc>>,
    }

    impl TryFrom<TransactionRow> for Transaction {
        type Error = DatabaseError;

        fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
            Ok(Transaction {
                id: row.id,
                reference: row.reference,
                gateway_reference: row.gateway_reference,
                owner_id: row.owner_id,
                resource_type: row.resource_type,
                resource_id: row.resource_id,
                amount: row.amount,
                currency: row.currency,
                status: row.status.parse()?,
                authorized_amount: row.authorized_amount,
                captured_amount: row.captured_amount,
                refunded_amount: row.refunded_amount,
                payment_method: row.payment_method,
                return_url: row.return_url,
                metadata: TransactionMetadata::from_json(row.metadata)?,
                version: row.version,
                created_at: row.created_at,
                updated_at: row.updated_at,
                authorized_at: row.authorized_at,
                captured_at: row.captured_at,
                refunded_at: row.refunded_at,
                failed_at: row.failed_at,
                cancelled_at: row.cancelled_at,
            })
        }
    }

    fn convert(row: Option<TransactionRow>) -> DbResult<Option<Transaction>> {
        row.map(Transaction::try_from).transpose()
    }

    /// Postgres-backed transaction repository
    #[derive(Clone)]
    pub struct PgTransactionRepository {
        pool: PgPool,
    }

    impl PgTransactionRepository {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &TransactionFilter) {
            builder.push(" WHERE 1 = 1");
            if let Some(status) = filter.status {
                builder.push(" AND status = ").push_bind(status.as_str());
            }
            if let Some(owner) = &filter.owner_id {
                builder.push(" AND owner_id = ").push_bind(owner.clone());
            }
            if let Some(currency) = &filter.currency {
                builder.push(" AND currency = ").push_bind(currency.clone());
            }
            if let Some(after) = filter.created_after {
                builder.push(" AND created_at >= ").push_bind(after);
            }
            if let Some(before) = filter.created_before {
                builder.push(" AND created_at < ").push_bind(before);
            }
        }
    }

    #[async_trait]
    impl TransactionRepository for PgTransactionRepository {
        async fn insert(&self, tx: &Transaction) -> DbResult<Transaction> {
            let row = sqlx::query_as::<_, TransactionRow>(&format!(
                "INSERT INTO transactions
                 (id, reference, gateway_reference, owner_id, resource_type, resource_id,
                  amount, currency, status, authorized_amount, captured_amount, refunded_amount,
                  payment_method, return_url, metadata, version, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $17)
                 RETURNING {}",
                COLUMNS
            ))
            .bind(tx.id)
            .bind(&tx.reference)
            .bind(&tx.gateway_reference)
            .bind(&tx.owner_id)
            .bind(&tx.resource_type)
            .bind(&tx.resource_id)
            .bind(tx.amount)
            .bind(&tx.currency)
            .bind(tx.status.as_str())
            .bind(tx.authorized_amount)
            .bind(tx.captured_amount)
            .bind(tx.refunded_amount)
            .bind(&tx.payment_method)
            .bind(&tx.return_url)
            .bind(tx.metadata.to_json())
            .bind(tx.version)
            .bind(tx.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            Transaction::try_from(row)
        }

        async fn find_by_id(&self, id: Uuid) -> DbResult<Option<Transaction>> {
            let row = sqlx::query_as::<_, TransactionRow>(&format!(
                "SELECT {} FROM transactions WHERE id = $1",
                COLUMNS
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            convert(row)
        }

        async fn find_by_reference(&self, reference: &str) -> DbResult<Option<Transaction>> {
            let row = sqlx::query_as::<_, TransactionRow>(&format!(
                "SELECT {} FROM transactions WHERE reference = $1",
                COLUMNS
            ))
            .bind(reference)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            convert(row)
        }

        async fn find_by_gateway_reference(
            &self,
            gateway_reference: &str,
        ) -> DbResult<Option<Transaction>> {
            let row = sqlx::query_as::<_, TransactionRow>(&format!(
                "SELECT {} FROM transactions WHERE gateway_reference = $1",
                COLUMNS
            ))
            .bind(gateway_reference)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            convert(row)
        }

        async fn update(&self, tx: &Transaction) -> DbResult<Transaction> {
            let row = sqlx::query_as::<_, TransactionRow>(&format!(
                "UPDATE transactions
                 SET gateway_reference = $3, status = $4, authorized_amount = $5,
                     captured_amount = $6, refunded_amount = $7, payment_method = $8,
                     metadata = $9, authorized_at = $10, captured_at = $11, refunded_at = $12,
                     failed_at = $13, cancelled_at = $14,
                     version = version + 1, updated_at = NOW()
                 WHERE id = $1 AND version = $2
                 RETURNING {}",
                COLUMNS
            ))
            .bind(tx.id)
            .bind(tx.version)
            .bind(&tx.gateway_reference)
            .bind(tx.status.as_str())
            .bind(tx.authorized_amount)
            .bind(tx.captured_amount)
            .bind(tx.refunded_amount)
            .bind(&tx.payment_method)
            .bind(tx.metadata.to_json())
            .bind(tx.authorized_at)
            .bind(tx.captured_at)
            .bind(tx.refunded_at)
            .bind(tx.failed_at)
            .bind(tx.cancelled_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            match row {
                Some(row) => Transaction::try_from(row),
                None => Err(DatabaseError::VersionConflict {
                    entity: "transaction",
                    id: tx.id.to_string(),
                    expected_version: tx.version,
                }),
            }
        }

        async fn list(&self, filter: &TransactionFilter) -> DbResult<Page<Transaction>> {
            let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM transactions");
            Self::push_filter(&mut count, filter);
            let total: i64 = count
                .build_query_scalar()
                .fetch_one(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?;

            let mut query =
                QueryBuilder::<Postgres>::new(format!("SELECT {} FROM transactions", COLUMNS));
            Self::push_filter(&mut query, filter);
            query
                .push(" ORDER BY created_at DESC LIMIT ")
                .push_bind(filter.limit)
                .push(" OFFSET ")
                .push_bind(filter.offset);

            let rows = query
                .build_query_as::<TransactionRow>()
                .fetch_all(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?;

            let items = rows
                .into_iter()
                .map(Transaction::try_from)
                .collect::<DbResult<Vec<_>>>()?;

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
            let rows = sqlx::query_as::<_, TransactionRow>(&format!(
                "SELECT {} FROM transactions
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

            rows.into_iter().map(Transaction::try_from).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn test_state_machine_transitions() {
        use TransactionStatus::*;
        assert!(Pending.can_transition_to(Authorized));
        assert!(Pending.can_transition_to(Failed));
        assert!(Authorized.can_transition_to(Captured));
        assert!(Authorized.can_transition_to(Cancelled));
        assert!(Captured.can_transition_to(PartiallyRefunded));
        assert!(PartiallyRefunded.can_transition_to(PartiallyRefunded));
        assert!(PartiallyRefunded.can_transition_to(Refunded));

        assert!(!Pending.can_transition_to(Captured));
        assert!(!Captured.can_transition_to(Cancelled));
        assert!(!Refunded.can_transition_to(PartiallyRefunded));
        assert!(Failed.is_terminal());
        assert!(Cancelled.is_terminal());
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            TransactionStatus::Pending,
            TransactionStatus::PartiallyRefunded,
            TransactionStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<TransactionStatus>().unwrap(), status);
        }
        assert!("settled".parse::<TransactionStatus>().is_err());
    }

    #[test]
    fn test_transition_stamps_timestamp() {
        let mut tx = pending();
        assert!(tx.transition_to(TransactionStatus::Authorized));
        assert!(tx.authorized_at.is_some());
        assert!(!tx.transition_to(TransactionStatus::Refunded));
        assert_eq!(tx.status, TransactionStatus::Authorized);
    }

    #[test]
    fn test_reference_format() {
        let tx = pending();
        assert!(tx.reference.starts_with("TX-"));
        assert_eq!(tx.reference.len(), "TX-20240101-ABCDEF12".len());
    }

    #[test]
    fn test_metadata_keeps_extra_fields() {
        let mut extra = BTreeMap::new();
        extra.insert("channel".to_string(), serde_json::json!("web"));
        let mut metadata = TransactionMetadata::with_extra(extra);
        metadata.session_id = Some("CS123".to_string());

        let json = metadata.to_json();
        assert_eq!(json["sessionId"].as_str(), None);
        assert_eq!(json["session_id"], "CS123");
        assert_eq!(json["channel"], "web");
        assert_eq!(TransactionMetadata::from_json(json).unwrap(), metadata);
    }

    #[test]
    fn test_filter_matches() {
        let tx = pending();
        let filter = TransactionFilter {
            status: Some(TransactionStatus::Pending),
            owner_id: Some("user-1".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&tx));

        let other_owner = TransactionFilter {
            owner_id: Some("user-2".to_string()),
            ..Default::default()
        };
        assert!(!other_owner.matches(&tx));
    }
}
