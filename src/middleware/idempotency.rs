//! Idempotency for mutating routes
//!
//! The key comes from the `Idempotency-Key` header, scoped to the caller. Without
//! one, a fingerprint of the caller, the amount and resource fields of the JSON
//! body, the path and the client address is used instead.

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::Value as JsonValue;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::api::auth::actor_from_headers;
use crate::error::{AppError, AppErrorKind, DomainError, ValidationError};
use crate::middleware::logging::request_id;
use crate::services::idempotency::{ClaimOutcome, Fingerprint, IdempotencyGuard};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const REPLAYED_HEADER: &str = "idempotent-replayed";

const MAX_BODY_BYTES: usize = 1024 * 1024;
const MAX_KEY_LEN: usize = 255;

fn client_address(request: &http::request::Parts) -> Option<String> {
    request
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| {
            request
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
}

fn client_key(headers: &http::HeaderMap) -> Result<Option<String>, AppError> {
    let Some(raw) = headers.get(IDEMPOTENCY_KEY_HEADER) else {
        return Ok(None);
    };
    let key = raw
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|k| !k.is_empty() && k.len() <= MAX_KEY_LEN)
        .ok_or_else(|| {
            AppError::validation(ValidationError::InvalidField {
                field: "Idempotency-Key".to_string(),
                reason: format!("must be 1 to {} visible ASCII characters", MAX_KEY_LEN),
            })
        })?;
    Ok(Some(key.to_string()))
}

fn text_field<'a>(json: &'a Option<JsonValue>, name: &str) -> Option<&'a str> {
    json.as_ref()
        .and_then(|b| b.get(name))
        .and_then(JsonValue::as_str)
}

fn fingerprint(actor_id: &str, parts: &http::request::Parts, body: &Bytes) -> String {
    let json: Option<JsonValue> = serde_json::from_slice(body).ok();
    let address = client_address(parts);

    Fingerprint {
        actor_id,
        amount: json
            .as_ref()
            .and_then(|b| b.get("amount"))
            .and_then(JsonValue::as_i64),
        currency: text_field(&json, "currency"),
        resource_type: text_field(&json, "resourceType"),
        resource_id: text_field(&json, "resourceId").or(Some(parts.uri.path())),
        client_address: address.as_deref(),
    }
    .derive_key()
}

fn with_request_id(error: AppError, parts: &http::request::Parts) -> Response {
    match request_id(&parts.headers) {
        Some(id) => error.with_request_id(id),
        None => error,
    }
    .into_response()
}

pub async fn idempotency_middleware(
    State(guard): State<Arc<IdempotencyGuard>>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::POST {
        return next.run(request).await;
    }
    // Unauthenticated requests are rejected by the handler; nothing to protect.
    let Ok(actor) = actor_from_headers(request.headers()) else {
        return next.run(request).await;
    };

    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return with_request_id(
                AppError::validation(ValidationError::InvalidField {
                    field: "body".to_string(),
                    reason: "request body too large".to_string(),
                }),
                &parts,
            )
        }
    };

    let key = match client_key(&parts.headers) {
        Ok(Some(key)) => format!("{}:{}", actor.id, key),
        Ok(None) => fingerprint(&actor.id, &parts, &bytes),
        Err(e) => return with_request_id(e, &parts),
    };

    match guard.begin(&key).await {
        ClaimOutcome::Acquired(token) => {
            let request = Request::from_parts(parts, Body::from(bytes));
            let response = next.run(request).await;

            let (parts, body) = response.into_parts();
            let status = parts.status.as_u16();
            let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
                Ok(body) => body,
                Err(e) => {
                    warn!(idempotency_key = %key, error = %e, "failed to buffer response body");
                    guard.fail(&token, StatusCode::INTERNAL_SERVER_ERROR.as_u16()).await;
                    return AppError::internal("failed to read response body").into_response();
                }
            };

            if parts.status.is_success() {
                let content_type = parts
                    .headers
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                guard
                    .complete(
                        &token,
                        status,
                        String::from_utf8_lossy(&body).into_owned(),
                        content_type,
                    )
                    .await;
            } else {
                guard.fail(&token, status).await;
            }
            Response::from_parts(parts, Body::from(body))
        }
        ClaimOutcome::InFlight => {
            debug!(idempotency_key = %key, "request already in flight");
            with_request_id(
                AppError::new(AppErrorKind::Domain(DomainError::IdempotencyInFlight { key })),
                &parts,
            )
        }
        ClaimOutcome::Replay(cached) => {
            debug!(idempotency_key = %key, status = cached.status_code, "replaying stored response");
            let status = StatusCode::from_u16(cached.status_code).unwrap_or(StatusCode::OK);
            let mut response = (status, cached.body).into_response();
            if let Some(content_type) = cached
                .content_type
                .and_then(|ct| HeaderValue::from_str(&ct).ok())
            {
                response.headers_mut().insert(header::CONTENT_TYPE, content_type);
            }
            response
                .headers_mut()
                .insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
            response
        }
        ClaimOutcome::Degraded => {
            let request = Request::from_parts(parts, Body::from(bytes));
            next.run(request).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth::USER_ID_HEADER;
    use crate::cache::memory::InMemoryCache;
    use crate::services::idempotency::IdempotencyConfig;
    use axum::{routing::post, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn app(guard: Arc<IdempotencyGuard>, calls: Arc<AtomicUsize>, status: StatusCode) -> Router {
        Router::new()
            .route(
                "/payments",
                post(move || {
                    let calls = calls.clone();
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                        (status, Json(serde_json::json!({ "call": n })))
                    }
                }),
            )
            .layer(axum::middleware::from_fn_with_state(
                guard,
                idempotency_middleware,
            ))
    }

    fn guard(cache: &InMemoryCache) -> Arc<IdempotencyGuard> {
        Arc::new(IdempotencyGuard::new(
            Arc::new(cache.clone()),
            IdempotencyConfig::default(),
        ))
    }

    fn post_request(key: Option<&str>, body: &str) -> Request {
        let mut builder = http::Request::builder()
            .method("POST")
            .uri("/payments")
            .header(USER_ID_HEADER, "user-1")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(key) = key {
            builder = builder.header(IDEMPOTENCY_KEY_HEADER, key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_of(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_completed_key_replays_response() {
        let cache = InMemoryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let app = app(guard(&cache), calls.clone(), StatusCode::CREATED);

        let first = app.clone().oneshot(post_request(Some("abc123"), "{}")).await.unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        let first_body = body_of(first).await;

        let second = app.oneshot(post_request(Some("abc123"), "{}")).await.unwrap();
        assert_eq!(second.status(), StatusCode::CREATED);
        assert_eq!(second.headers()[REPLAYED_HEADER], "true");
        assert_eq!(body_of(second).await, first_body);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_in_flight_key_conflicts() {
        let cache = InMemoryCache::new();
        let guard = guard(&cache);
        let ClaimOutcome::Acquired(_token) = guard.begin("user-1:busy").await else {
            panic!("claim");
        };
        let calls = Arc::new(AtomicUsize::new(0));

        let response = app(guard, calls.clone(), StatusCode::CREATED)
            .oneshot(post_request(Some("busy"), "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_request_may_retry() {
        let cache = InMemoryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let app = app(guard(&cache), calls.clone(), StatusCode::BAD_GATEWAY);

        for _ in 0..2 {
            let response = app.clone().oneshot(post_request(Some("k"), "{}")).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fingerprint_dedupes_identical_bodies() {
        let cache = InMemoryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let app = app(guard(&cache), calls.clone(), StatusCode::CREATED);
        let body = r#"{"amount":5000,"currency":"EUR","resourceType":"order","resourceId":"o-1"}"#;

        app.clone().oneshot(post_request(None, body)).await.unwrap();
        app.clone().oneshot(post_request(None, body)).await.unwrap();
        let other = body.replace("o-1", "o-2");
        app.oneshot(post_request(None, &other)).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_outage_fails_open() {
        let cache = InMemoryCache::new();
        cache.set_available(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let app = app(guard(&cache), calls.clone(), StatusCode::CREATED);

        app.clone().oneshot(post_request(Some("k"), "{}")).await.unwrap();
        app.oneshot(post_request(Some("k"), "{}")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
