//! Operator routes: transaction listing, queue control and breaker state

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::api::auth::{AdminActor, Correlation};
use crate::api::AppState;
use crate::database::transaction_repository::{Page, TransactionFilter, TransactionStatus};
use crate::error::{AppError, AppErrorKind, DomainError, ValidationError};
use crate::services::circuit_breaker::CircuitSnapshot;
use crate::services::payment_orchestrator::PaymentStatusView;
use crate::workers::jobs::QueueName;
use crate::workers::queue::QueueStats;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionListQuery {
    pub status: Option<TransactionStatus>,
    pub owner_id: Option<String>,
    pub currency: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl TransactionListQuery {
    fn into_filter(self) -> Result<TransactionFilter, AppError> {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(AppError::validation(ValidationError::InvalidField {
                field: "limit".to_string(),
                reason: format!("must be between 1 and {}", MAX_PAGE_SIZE),
            }));
        }
        let offset = self.offset.unwrap_or(0);
        if offset < 0 {
            return Err(AppError::validation(ValidationError::InvalidField {
                field: "offset".to_string(),
                reason: "must not be negative".to_string(),
            }));
        }
        Ok(TransactionFilter {
            status: self.status,
            owner_id: self.owner_id,
            currency: self.currency.map(|c| c.to_ascii_uppercase()),
            created_after: self.created_after,
            created_before: self.created_before,
            limit,
            offset,
        })
    }
}

/// GET /admin/transactions
pub async fn list_transactions(
    State(state): State<AppState>,
    _admin: AdminActor,
    correlation: Correlation,
    Query(query): Query<TransactionListQuery>,
) -> Result<Json<Page<PaymentStatusView>>, AppError> {
    let filter = query.into_filter().map_err(|e| correlation.tag(e))?;
    let page = state
        .orchestrator
        .list_transactions(&filter)
        .await
        .map_err(|e| correlation.tag(e))?;
    Ok(Json(page))
}

/// GET /admin/queues
pub async fn queue_stats(
    State(state): State<AppState>,
    _admin: AdminActor,
) -> Json<Vec<QueueStats>> {
    Json(state.queues.stats())
}

fn parse_queue(raw: &str, correlation: &Correlation) -> Result<QueueName, AppError> {
    raw.parse().map_err(|_| {
        correlation.tag(AppError::validation(ValidationError::InvalidField {
            field: "queue".to_string(),
            reason: format!("unknown queue '{}'", raw),
        }))
    })
}

/// POST /admin/queues/{queue}/pause
pub async fn pause_queue(
    State(state): State<AppState>,
    AdminActor(admin): AdminActor,
    correlation: Correlation,
    Path(queue): Path<String>,
) -> Result<Json<QueueStats>, AppError> {
    let name = parse_queue(&queue, &correlation)?;
    let queue = state.queues.queue(name);
    queue.pause();
    info!(queue = %name, actor = %admin.id, "queue paused");
    Ok(Json(queue.stats()))
}

/// POST /admin/queues/{queue}/resume
pub async fn resume_queue(
    State(state): State<AppState>,
    AdminActor(admin): AdminActor,
    correlation: Correlation,
    Path(queue): Path<String>,
) -> Result<Json<QueueStats>, AppError> {
    let name = parse_queue(&queue, &correlation)?;
    let queue = state.queues.queue(name);
    queue.resume();
    info!(queue = %name, actor = %admin.id, "queue resumed");
    Ok(Json(queue.stats()))
}

/// DELETE /admin/jobs/{id}
///
/// Only jobs that have not started can be cancelled.
pub async fn cancel_job(
    State(state): State<AppState>,
    AdminActor(admin): AdminActor,
    correlation: Correlation,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let job_id = Uuid::parse_str(&id).map_err(|_| {
        correlation.tag(AppError::validation(ValidationError::InvalidField {
            field: "id".to_string(),
            reason: "must be a UUID".to_string(),
        }))
    })?;
    if state.queues.cancel(job_id) {
        info!(job_id = %job_id, actor = %admin.id, "job cancelled");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(correlation.tag(AppError::new(AppErrorKind::Domain(
            DomainError::JobNotFound {
                job_id: job_id.to_string(),
            },
        ))))
    }
}

/// GET /admin/circuit-breakers
pub async fn circuit_breakers(
    State(state): State<AppState>,
    _admin: AdminActor,
) -> Json<Vec<CircuitSnapshot>> {
    Json(state.breakers.snapshots())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_page() {
        let filter = TransactionListQuery::default().into_filter().unwrap();
        assert_eq!(filter.limit, DEFAULT_PAGE_SIZE);
        assert_eq!(filter.offset, 0);
    }

    #[test]
    fn test_page_size_is_bounded() {
        let query = TransactionListQuery {
            limit: Some(MAX_PAGE_SIZE + 1),
            ..Default::default()
        };
        assert_eq!(query.into_filter().unwrap_err().status_code(), 400);
    }
}
