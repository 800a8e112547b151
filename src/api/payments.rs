//! Payment routes
//!
//! Handlers only translate HTTP into orchestrator calls; rules live in
//! [`PaymentOrchestrator`](crate::services::payment_orchestrator::PaymentOrchestrator).

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use tracing::info;
use uuid::Uuid;

use crate::api::auth::Correlation;
use crate::api::{ApiJson, AppState};
use crate::error::{AppError, ValidationError};
use crate::payments::types::{PaymentMethodInfo, PaymentMethodsQuery};
use crate::services::payment_orchestrator::{
    Actor, CapturePaymentRequest, CreatePaymentRequest, CreatePaymentResponse,
    PaymentStatusView, RefundPaymentRequest, RefundView,
};

fn parse_id(raw: &str, correlation: &Correlation) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| {
        correlation.tag(AppError::validation(ValidationError::InvalidField {
            field: "id".to_string(),
            reason: "must be a UUID".to_string(),
        }))
    })
}

/// POST /payments
pub async fn create_payment(
    State(state): State<AppState>,
    actor: Actor,
    correlation: Correlation,
    ApiJson(request): ApiJson<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<CreatePaymentResponse>), AppError> {
    let response = state
        .orchestrator
        .create_payment(&actor, request)
        .await
        .map_err(|e| correlation.tag(e))?;
    info!(
        payment_id = %response.payment_id,
        request_id = %correlation.0,
        "payment session created"
    );
    Ok((StatusCode::CREATED, Json(response)))
}

/// GET /payments/{id}
pub async fn get_payment(
    State(state): State<AppState>,
    actor: Actor,
    correlation: Correlation,
    Path(id): Path<String>,
) -> Result<Json<PaymentStatusView>, AppError> {
    let id = parse_id(&id, &correlation)?;
    let view = state
        .orchestrator
        .get_status(&actor, id)
        .await
        .map_err(|e| correlation.tag(e))?;
    Ok(Json(view))
}

/// POST /payments/{id}/capture
pub async fn capture_payment(
    State(state): State<AppState>,
    actor: Actor,
    correlation: Correlation,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<PaymentStatusView>, AppError> {
    let id = parse_id(&id, &correlation)?;
    // The body is optional; an empty one captures the full authorized amount.
    let request: CapturePaymentRequest = if body.is_empty() {
        CapturePaymentRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            correlation.tag(AppError::validation(ValidationError::InvalidField {
                field: "body".to_string(),
                reason: e.to_string(),
            }))
        })?
    };
    let amount = request.amount;
    let tx = state
        .orchestrator
        .capture_payment(&actor, id, amount)
        .await
        .map_err(|e| correlation.tag(e))?;
    Ok(Json(PaymentStatusView::project(&tx, None)))
}

/// POST /payments/{id}/cancel
pub async fn cancel_payment(
    State(state): State<AppState>,
    actor: Actor,
    correlation: Correlation,
    Path(id): Path<String>,
) -> Result<Json<PaymentStatusView>, AppError> {
    let id = parse_id(&id, &correlation)?;
    let tx = state
        .orchestrator
        .cancel_payment(&actor, id)
        .await
        .map_err(|e| correlation.tag(e))?;
    Ok(Json(PaymentStatusView::project(&tx, None)))
}

/// POST /payments/{id}/refunds
pub async fn create_refund(
    State(state): State<AppState>,
    actor: Actor,
    correlation: Correlation,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<RefundPaymentRequest>,
) -> Result<(StatusCode, Json<RefundView>), AppError> {
    let id = parse_id(&id, &correlation)?;
    let refund = state
        .orchestrator
        .refund_payment(&actor, id, request)
        .await
        .map_err(|e| correlation.tag(e))?;
    Ok((StatusCode::CREATED, Json(refund)))
}

/// GET /payments/{id}/refunds
pub async fn list_refunds(
    State(state): State<AppState>,
    actor: Actor,
    correlation: Correlation,
    Path(id): Path<String>,
) -> Result<Json<Vec<RefundView>>, AppError> {
    let id = parse_id(&id, &correlation)?;
    let refunds = state
        .orchestrator
        .list_refunds(&actor, id)
        .await
        .map_err(|e| correlation.tag(e))?;
    Ok(Json(refunds))
}

/// GET /payment-methods/available?country&currency&amount
pub async fn available_payment_methods(
    State(state): State<AppState>,
    _actor: Actor,
    correlation: Correlation,
    Query(query): Query<PaymentMethodsQuery>,
) -> Result<Json<Vec<PaymentMethodInfo>>, AppError> {
    let methods = state
        .orchestrator
        .available_payment_methods(query)
        .await
        .map_err(|e| correlation.tag(e))?;
    Ok(Json(methods))
}
