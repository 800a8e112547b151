use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use uuid::Uuid;

use crate::database::error::{DatabaseError, DbResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
            AuditOutcome::Denied => "denied",
        }
    }

    pub fn from_status_code(status: u16) -> Self {
        match status {
            200..=399 => AuditOutcome::Success,
            401 | 403 => AuditOutcome::Denied,
            _ => AuditOutcome::Failure,
        }
    }
}

impl FromStr for AuditOutcome {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AuditOutcome::Success),
            "failure" => Ok(AuditOutcome::Failure),
            "denied" => Ok(AuditOutcome::Denied),
            other => Err(DatabaseError::Decode(format!(
                "unknown audit outcome '{}'",
                other
            ))),
        }
    }
}

/// One append-only audit record.
///
/// `checksum` is SHA-256 over `correlation_id|action|resource_type|resource_id|actor_id|created_at`
/// (timestamp as RFC 3339 with microseconds). Bodies are sanitized before they get here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub correlation_id: String,
    pub actor_id: String,
    pub actor_role: Option<String>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub request_body: Option<serde_json::Value>,
    pub response_body: Option<serde_json::Value>,
    pub outcome: AuditOutcome,
    pub status_code: Option<i32>,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn compute_checksum(
        correlation_id: &str,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        actor_id: &str,
        created_at: DateTime<Utc>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(correlation_id.as_bytes());
        for part in [
            action,
            resource_type,
            resource_id,
            actor_id,
            &created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        ] {
            hasher.update(b"|");
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Postgres keeps microseconds; truncating up front keeps checksums stable across a round trip.
    pub fn timestamp_now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }

    pub fn expected_checksum(&self) -> String {
        Self::compute_checksum(
            &self.correlation_id,
            &self.action,
            &self.resource_type,
            &self.resource_id,
            &self.actor_id,
            self.created_at,
        )
    }

    /// Recompute the checksum and compare it with the stored one
    pub fn verify(&self) -> bool {
        self.expected_checksum() == self.checksum
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub correlation_id: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub action: Option<String>,
    pub limit: i64,
}

impl AuditFilter {
    pub fn for_resource(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type: Some(resource_type.into()),
            resource_id: Some(resource_id.into()),
            limit: 100,
            ..Default::default()
        }
    }

    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.correlation_id
            .as_deref()
            .map_or(true, |c| entry.correlation_id == c)
            && self
                .resource_type
                .as_deref()
                .map_or(true, |r| entry.resource_type == r)
            && self
                .resource_id
                .as_deref()
                .map_or(true, |r| entry.resource_id == r)
            && self.action.as_deref().map_or(true, |a| entry.action == a)
    }
}

/// Append-only audit store. `update` and `delete` exist so callers get a definite
/// rejection from the storage layer instead of a silent no-op.
#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn append(&self, entry: &AuditLogEntry) -> DbResult<()>;

    /// Newest first
    async fn list(&self, filter: &AuditFilter) -> DbResult<Vec<AuditLogEntry>>;

    async fn update(&self, entry: &AuditLogEntry) -> DbResult<()>;

    async fn delete(&self, id: Uuid) -> DbResult<()>;
}

#[cfg(feature = "database")]
pub use postgres::PgAuditRepository;

#[cfg(feature = "database")]
mod postgres {
    use super::*;
    use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};

    const COLUMNS: &str = "id, correlation_id, actor_id, actor_role, action, resource_type, \
         resource_id, request_body, response_body, outcome, status_code, duration_ms, \
         error_message, checksum, created_at";

    #[derive(Debug, FromRow)]
    struct AuditRow {
        id: Uuid,
        correlation_id: String,
        actor_id: String,
        actor_role: Option<String>,
        action: String,
        resource_type: String,
        resource_id: String,
        request_body: Option<serde_json::Value>,
        response_body: Option<serde_json::Value>,
        outcome: String,
        status_code: Option<i32>,
        duration_ms: i64,
        error_message: Option<String>,
        checksum: String,
        created_at: DateTime<Utc>,
    }

    impl TryFrom<AuditRow> for AuditLogEntry {
        type Error = DatabaseError;

        fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
            Ok(AuditLogEntry {
                id: row.id,
                correlation_id: row.correlation_id,
                actor_id: row.actor_id,
                actor_role: row.actor_role,
                action: row.action,
                resource_type: row.resource_type,
                resource_id: row.resource_id,
                request_body: row.request_body,
                response_body: row.response_body,
                outcome: row.outcome.parse()?,
                status_code: row.status_code,
                duration_ms: row.duration_ms,
                error_message: row.error_message,
                checksum: row.checksum,
                created_at: row.created_at,
            })
        }
    }

    #[derive(Clone)]
    pub struct PgAuditRepository {
        pool: PgPool,
    }

    impl PgAuditRepository {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl AuditRepository for PgAuditRepository {
        async fn append(&self, entry: &AuditLogEntry) -> DbResult<()> {
            sqlx::query(
                "INSERT INTO audit_logs
                 (id, correlation_id, actor_id, actor_role, action, resource_type, resource_id,
                  request_body, response_body, outcome, status_code, duration_ms,
                  error_message, checksum, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
            )
            .bind(entry.id)
            .bind(&entry.correlation_id)
            .bind(&entry.actor_id)
            .bind(&entry.actor_role)
            .bind(&entry.action)
            .bind(&entry.resource_type)
            .bind(&entry.resource_id)
            .bind(&entry.request_body)
            .bind(&entry.response_body)
            .bind(entry.outcome.as_str())
            .bind(entry.status_code)
            .bind(entry.duration_ms)
            .bind(&entry.error_message)
            .bind(&entry.checksum)
            .bind(entry.created_at)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            Ok(())
        }

        async fn list(&self, filter: &AuditFilter) -> DbResult<Vec<AuditLogEntry>> {
            let mut query = QueryBuilder::<Postgres>::new(format!(
                "SELECT {} FROM audit_logs WHERE 1 = 1",
                COLUMNS
            ));
            if let Some(correlation_id) = &filter.correlation_id {
                query
                    .push(" AND correlation_id = ")
                    .push_bind(correlation_id.clone());
            }
            if let Some(resource_type) = &filter.resource_type {
                query
                    .push(" AND resource_type = ")
                    .push_bind(resource_type.clone());
            }
            if let Some(resource_id) = &filter.resource_id {
                query.push(" AND resource_id = ").push_bind(resource_id.clone());
            }
            if let Some(action) = &filter.action {
                query.push(" AND action = ").push_bind(action.clone());
            }
            query
                .push(" ORDER BY created_at DESC LIMIT ")
                .push_bind(filter.limit);

            let rows = query
                .build_query_as::<AuditRow>()
                .fetch_all(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?;
            rows.into_iter().map(AuditLogEntry::try_from).collect()
        }

        // Both statements are rejected by the audit_logs triggers.
        async fn update(&self, entry: &AuditLogEntry) -> DbResult<()> {
            sqlx::query(
                "UPDATE audit_logs SET response_body = $2, outcome = $3, error_message = $4
                 WHERE id = $1",
            )
            .bind(entry.id)
            .bind(&entry.response_body)
            .bind(entry.outcome.as_str())
            .bind(&entry.error_message)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            Ok(())
        }

        async fn delete(&self, id: Uuid) -> DbResult<()> {
            sqlx::query("DELETE FROM audit_logs WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?;
            Ok(())
        }
    }
}
