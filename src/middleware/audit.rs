//! HTTP audit capture for sensitive routes
//!
//! Must be installed with `route_layer` so the matched route template is known.
//! The entry is handed to the recorder after the handler has produced its
//! response; the write itself happens on the recorder's background task.
//! Bodies of unknown size or larger than [`MAX_CAPTURED_BYTES`] are forwarded
//! untouched and left out of the entry.

use axum::{
    body::{Body, Bytes, HttpBody},
    extract::{MatchedPath, Request, State},
    http::{Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::Value as JsonValue;
use std::time::Instant;
use tracing::{debug, warn};

use crate::api::auth::actor_from_headers;
use crate::database::audit_repository::AuditOutcome;
use crate::middleware::logging::request_id;
use crate::services::audit::{actions, AuditEvent, AuditRecorder};

pub const MAX_CAPTURED_BYTES: usize = 256 * 1024;

/// Action and resource type for an audited route, `None` for everything else
pub fn classify(method: &Method, route: &str) -> Option<(&'static str, &'static str)> {
    let entry = match (method.as_str(), route) {
        ("POST", "/payments") => (actions::PAYMENT_CREATE, "transaction"),
        ("POST", "/payments/{id}/capture") => (actions::PAYMENT_CAPTURE, "transaction"),
        ("POST", "/payments/{id}/cancel") => (actions::PAYMENT_CANCEL, "transaction"),
        ("POST", "/payments/{id}/refunds") => (actions::REFUND_CREATE, "transaction"),
        ("GET", "/admin/transactions") => (actions::TRANSACTION_LIST, "transaction"),
        ("POST", "/admin/queues/{queue}/pause") | ("POST", "/admin/queues/{queue}/resume") => {
            (actions::QUEUE_CONTROL, "queue")
        }
        ("DELETE", "/admin/jobs/{id}") => (actions::QUEUE_CONTROL, "job"),
        _ => return None,
    };
    Some(entry)
}

/// First path parameter of `route` as it appears in `path`
fn path_param(route: &str, path: &str) -> Option<String> {
    route
        .split('/')
        .zip(path.split('/'))
        .find(|(template, _)| template.starts_with('{'))
        .map(|(_, value)| value.to_string())
}

/// Bodies whose exact size is known and within the capture limit
fn capturable(body: &Body) -> bool {
    body.size_hint()
        .exact()
        .is_some_and(|len| len <= MAX_CAPTURED_BYTES as u64)
}

/// Buffer a capturable body; anything else is handed back as is
async fn capture(body: Body) -> Result<(Option<Bytes>, Body), axum::Error> {
    if !capturable(&body) {
        return Ok((None, body));
    }
    let bytes = axum::body::to_bytes(body, MAX_CAPTURED_BYTES).await?;
    Ok((Some(bytes.clone()), Body::from(bytes)))
}

fn as_json(bytes: &[u8]) -> Option<JsonValue> {
    if bytes.is_empty() {
        return None;
    }
    serde_json::from_slice(bytes).ok()
}

pub async fn audit_middleware(
    State(audit): State<AuditRecorder>,
    request: Request,
    next: Next,
) -> Response {
    let Some(route) = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
    else {
        return next.run(request).await;
    };
    let Some((action, resource_type)) = classify(request.method(), &route) else {
        return next.run(request).await;
    };

    let started = Instant::now();
    let correlation_id =
        request_id(request.headers()).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let (actor_id, actor_role) = match actor_from_headers(request.headers()) {
        Ok(actor) => (actor.id, Some(actor.role.as_str().to_string())),
        Err(_) => ("anonymous".to_string(), None),
    };
    let path_id = path_param(&route, request.uri().path());

    let (parts, body) = request.into_parts();
    let (request_bytes, body) = match capture(body).await {
        Ok(captured) => captured,
        Err(e) => {
            warn!(action, error = %e, "failed to read request body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    if request_bytes.is_none() {
        debug!(action, "request body too large or unsized, not captured for audit");
    }
    let request_body = request_bytes.as_deref().and_then(as_json);

    let response = next.run(Request::from_parts(parts, body)).await;

    let (parts, body) = response.into_parts();
    let (response_bytes, body) = match capture(body).await {
        Ok(captured) => captured,
        Err(e) => {
            warn!(action, error = %e, "failed to read response body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if response_bytes.is_none() {
        debug!(action, "response body too large or unsized, not captured for audit");
    }
    let response_body = response_bytes.as_deref().and_then(as_json);

    let resource_id = path_id
        .or_else(|| {
            response_body
                .as_ref()
                .and_then(|b| b.get("paymentId"))
                .and_then(JsonValue::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| "-".to_string());

    let status = parts.status.as_u16();
    let mut event = AuditEvent::new(action, resource_type, resource_id)
        .actor(actor_id, actor_role)
        .correlation(correlation_id);
    if let Some(body) = request_body {
        event = event.request(body);
    }
    if !parts.status.is_success() {
        let message = response_body
            .as_ref()
            .and_then(|b| b.get("message"))
            .and_then(JsonValue::as_str)
            .unwrap_or("request failed")
            .to_string();
        event = event.failed(message);
    }
    if let Some(body) = response_body {
        event = event.response(body);
    }
    event.outcome = AuditOutcome::from_status_code(status);
    event.status_code = Some(status);
    event.duration = started.elapsed();
    audit.record(event);

    Response::from_parts(parts, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth::{USER_ID_HEADER, USER_ROLE_HEADER};
    use crate::database::memory::InMemoryLedger;
    use crate::services::audit::REDACTED;
    use axum::{
        routing::{get, post},
        Json, Router,
    };
    use std::sync::Arc;
    use tower::ServiceExt;

    #[test]
    fn test_classify_routes() {
        assert_eq!(
            classify(&Method::POST, "/payments/{id}/refunds"),
            Some((actions::REFUND_CREATE, "transaction"))
        );
        assert_eq!(classify(&Method::GET, "/payments/{id}"), None);
        assert_eq!(
            path_param("/payments/{id}/capture", "/payments/abc/capture").as_deref(),
            Some("abc")
        );
    }

    #[tokio::test]
    async fn test_records_sanitized_entry_after_response() {
        let ledger = Arc::new(InMemoryLedger::new());
        let (recorder, _writer) = AuditRecorder::spawn(ledger.clone(), 16);
        let app = Router::new()
            .route(
                "/payments/{id}/capture",
                post(|| async {
                    (
                        StatusCode::CONFLICT,
                        Json(serde_json::json!({ "message": "Cannot capture" })),
                    )
                }),
            )
            .route_layer(axum::middleware::from_fn_with_state(
                recorder.clone(),
                audit_middleware,
            ));

        let response = app
            .oneshot(
                http::Request::builder()
                    .method("POST")
                    .uri("/payments/tx-9/capture")
                    .header(USER_ID_HEADER, "ops-1")
                    .header(USER_ROLE_HEADER, "admin")
                    .header("x-request-id", "corr-1")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"amount":100,"cardNumber":"4111111111111111"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        recorder.flush().await.unwrap();
        let entries = ledger.audit_entries().await;
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.action, actions::PAYMENT_CAPTURE);
        assert_eq!(entry.resource_id, "tx-9");
        assert_eq!(entry.correlation_id, "corr-1");
        assert_eq!(entry.actor_role.as_deref(), Some("admin"));
        assert_eq!(entry.outcome, AuditOutcome::Failure);
        assert_eq!(entry.status_code, Some(409));
        let request = entry.request_body.as_ref().unwrap();
        assert_eq!(request["cardNumber"], REDACTED);
        assert_eq!(request["amount"], 100);
        assert!(entry.verify());
    }

    #[tokio::test]
    async fn test_oversized_bodies_pass_through_uncaptured() {
        let ledger = Arc::new(InMemoryLedger::new());
        let (recorder, _writer) = AuditRecorder::spawn(ledger.clone(), 16);
        let large = "x".repeat(MAX_CAPTURED_BYTES + 1);
        let listing = large.clone();
        let app = Router::new()
            .route(
                "/payments",
                post(|body: Bytes| async move {
                    Json(serde_json::json!({ "paymentId": "p-1", "received": body.len() }))
                }),
            )
            .route(
                "/admin/transactions",
                get(move || {
                    let listing = listing.clone();
                    async move { Json(serde_json::json!({ "items": [listing] })) }
                }),
            )
            .route_layer(axum::middleware::from_fn_with_state(
                recorder.clone(),
                audit_middleware,
            ));

        let response = app
            .clone()
            .oneshot(
                http::Request::builder()
                    .method("POST")
                    .uri("/payments")
                    .header(USER_ID_HEADER, "user-1")
                    .body(Body::from(large.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let created: JsonValue = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(created["received"], large.len());

        let response = app
            .oneshot(
                http::Request::builder()
                    .uri("/admin/transactions")
                    .header(USER_ID_HEADER, "ops-1")
                    .header(USER_ROLE_HEADER, "admin")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(bytes.len() > MAX_CAPTURED_BYTES);
        let listed: JsonValue = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(listed["items"][0].as_str().map(str::len), Some(large.len()));

        recorder.flush().await.unwrap();
        let entries = ledger.audit_entries().await;
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.request_body.is_none()));
        assert!(entries
            .iter()
            .any(|e| e.action == actions::PAYMENT_CREATE && e.response_body.is_some()));
        assert!(entries
            .iter()
            .any(|e| e.action == actions::TRANSACTION_LIST && e.response_body.is_none()));
    }
}
