//! HTTP surface

pub mod admin;
pub mod auth;
pub mod health;
pub mod payments;
pub mod webhooks;

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    routing::{delete, get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};

use crate::error::{AppError, ValidationError};
use crate::health::HealthChecker;
use crate::middleware::{
    audit_middleware, idempotency_middleware, logging::request_id, request_logging_middleware,
    UuidRequestId,
};
use crate::services::audit::AuditRecorder;
use crate::services::circuit_breaker::CircuitBreakerRegistry;
use crate::services::idempotency::IdempotencyGuard;
use crate::services::payment_orchestrator::PaymentOrchestrator;
use crate::services::webhook_processor::WebhookProcessor;
use crate::workers::queue::QueueManager;

/// Shared handles for every route
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub webhooks: Arc<WebhookProcessor>,
    pub queues: Arc<QueueManager>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub health: HealthChecker,
    pub audit: AuditRecorder,
    pub idempotency: Arc<IdempotencyGuard>,
}

/// `Json` whose rejections use the service's error body
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let request_id = request_id(req.headers());
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => {
                let error = invalid_body(&rejection);
                Err(match request_id {
                    Some(id) => error.with_request_id(id),
                    None => error,
                })
            }
        }
    }
}

fn invalid_body(rejection: &JsonRejection) -> AppError {
    AppError::validation(ValidationError::InvalidField {
        field: "body".to_string(),
        reason: rejection.body_text(),
    })
}

pub fn router(state: AppState) -> Router {
    let payment_routes = Router::new()
        .route("/payments", post(payments::create_payment))
        .route("/payments/{id}", get(payments::get_payment))
        .route("/payments/{id}/capture", post(payments::capture_payment))
        .route("/payments/{id}/cancel", post(payments::cancel_payment))
        .route(
            "/payments/{id}/refunds",
            post(payments::create_refund).get(payments::list_refunds),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            state.idempotency.clone(),
            idempotency_middleware,
        ))
        .route(
            "/payment-methods/available",
            get(payments::available_payment_methods),
        );

    let admin_routes = Router::new()
        .route("/admin/transactions", get(admin::list_transactions))
        .route("/admin/queues", get(admin::queue_stats))
        .route("/admin/queues/{queue}/pause", post(admin::pause_queue))
        .route("/admin/queues/{queue}/resume", post(admin::resume_queue))
        .route("/admin/jobs/{id}", delete(admin::cancel_job))
        .route("/admin/circuit-breakers", get(admin::circuit_breakers));

    let audited = payment_routes
        .merge(admin_routes)
        .route_layer(axum::middleware::from_fn_with_state(
            state.audit.clone(),
            audit_middleware,
        ));

    Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/webhooks/adyen", post(webhooks::handle_adyen_notification))
        .merge(audited)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}
