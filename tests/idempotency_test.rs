//! Duplicate write protection on the payment routes

mod common;

use axum::body::Body;
use common::*;
use http::{Request, StatusCode};
use serde_json::json;

fn create_request(key: &str, resource_id: &str) -> Request<Body> {
    Request::post("/payments")
        .header("content-type", "application/json")
        .header("x-user-id", "user-1")
        .header("idempotency-key", key)
        .body(Body::from(
            json!({
                "amount": 5000,
                "currency": "EUR",
                "resourceType": "booking",
                "resourceId": resource_id,
                "returnUrl": "https://shop.test/return"
            })
            .to_string(),
        ))
        .unwrap()
}

#[tokio::test]
async fn test_concurrent_creates_with_same_key_persist_one_transaction() {
    let app = spawn_app(settings());

    let (first, second) = tokio::join!(
        app.send(create_request("abc123", "booking-1")),
        app.send(create_request("abc123", "booking-1")),
    );
    let statuses = [first.status(), second.status()];
    assert!(statuses.contains(&StatusCode::CREATED));
    assert!(statuses
        .iter()
        .all(|s| *s == StatusCode::CREATED || *s == StatusCode::CONFLICT));
    assert_eq!(app.ledger.transaction_count().await, 1);

    let created = if first.status() == StatusCode::CREATED {
        json_body(first).await
    } else {
        json_body(second).await
    };

    let replay = app.send(create_request("abc123", "booking-1")).await;
    assert_eq!(replay.status(), StatusCode::CREATED);
    assert_eq!(
        replay.headers().get("idempotent-replayed").unwrap(),
        "true"
    );
    let replayed = json_body(replay).await;
    assert_eq!(replayed["paymentId"], created["paymentId"]);
    assert_eq!(app.ledger.transaction_count().await, 1);
    assert_eq!(
        app.gateway
            .session_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );

    app.shutdown().await;
}

#[tokio::test]
async fn test_keys_are_scoped_per_user() {
    let app = spawn_app(settings());

    let first = app.send(create_request("shared-key", "booking-2")).await;
    assert_eq!(first.status(), StatusCode::CREATED);

    let other_user = Request::post("/payments")
        .header("content-type", "application/json")
        .header("x-user-id", "user-2")
        .header("idempotency-key", "shared-key")
        .body(Body::from(
            json!({
                "amount": 5000,
                "currency": "EUR",
                "resourceType": "booking",
                "resourceId": "booking-2",
                "returnUrl": "https://shop.test/return"
            })
            .to_string(),
        ))
        .unwrap();
    let second = app.send(other_user).await;
    assert_eq!(second.status(), StatusCode::CREATED);
    assert!(second.headers().get("idempotent-replayed").is_none());
    assert_eq!(app.ledger.transaction_count().await, 2);

    app.shutdown().await;
}

#[tokio::test]
async fn test_failed_request_can_be_retried_with_same_key() {
    let app = spawn_app(settings());

    let invalid = Request::post("/payments")
        .header("content-type", "application/json")
        .header("x-user-id", "user-1")
        .header("idempotency-key", "retry-me")
        .body(Body::from(
            json!({
                "amount": -1,
                "currency": "EUR",
                "resourceType": "booking",
                "resourceId": "booking-3",
                "returnUrl": "https://shop.test/return"
            })
            .to_string(),
        ))
        .unwrap();
    let response = app.send(invalid).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app.send(create_request("retry-me", "booking-3")).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(response.headers().get("idempotent-replayed").is_none());

    app.shutdown().await;
}

#[tokio::test]
async fn test_cache_outage_does_not_block_payments() {
    let app = spawn_app(settings());
    app.cache.set_available(false);

    let response = app.send(create_request("no-cache", "booking-4")).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(app.ledger.transaction_count().await, 1);

    app.shutdown().await;
}
