//! Gateway outages trip the breaker and surface as 503s

mod common;

use axum::body::Body;
use common::*;
use http::{Request, StatusCode};
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn test_breaker_opens_after_consecutive_gateway_failures() {
    let mut settings = settings();
    settings.circuit_breaker.failure_threshold = 3;
    settings.circuit_breaker.cooldown = Duration::from_secs(60);
    let app = spawn_app(settings);
    app.gateway.fail_with_network_errors(true);

    for i in 0..3 {
        let (status, body) = app.create_payment("user-1", 5000, &format!("booking-{}", i)).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "PAYMENT_GATEWAY_ERROR");
        assert_eq!(body["retryable"], true);
    }
    assert_eq!(app.gateway.session_calls.load(Ordering::SeqCst), 3);

    let (status, body) = app.create_payment("user-1", 5000, "booking-open").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "CIRCUIT_OPEN");
    assert_eq!(app.gateway.session_calls.load(Ordering::SeqCst), 3);

    let response = app
        .send(
            Request::get("/admin/circuit-breakers")
                .header("x-user-id", "ops-1")
                .header("x-user-role", "admin")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let snapshots = json_body(response).await;
    let adyen = snapshots
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["name"] == "adyen")
        .unwrap();
    assert_eq!(adyen["state"], "open");
    assert_eq!(adyen["total_rejections"], 1);

    // An open circuit degrades the service without taking it out of rotation
    let response = app
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let health = json_body(response).await;
    assert_eq!(health["status"], "Degraded");

    app.shutdown().await;
}

#[tokio::test]
async fn test_rejected_input_does_not_trip_the_breaker() {
    let mut settings = settings();
    settings.circuit_breaker.failure_threshold = 2;
    let app = spawn_app(settings);

    // Validation failures never reach the gateway
    for _ in 0..3 {
        let response = app
            .send(
                Request::post("/payments")
                    .header("content-type", "application/json")
                    .header("x-user-id", "user-1")
                    .body(Body::from(
                        r#"{"amount":100,"currency":"euro","resourceType":"booking","resourceId":"b","returnUrl":"https://shop.test"}"#,
                    ))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    let (status, _) = app.create_payment("user-1", 5000, "booking-ok").await;
    assert_eq!(status, StatusCode::CREATED);

    app.shutdown().await;
}
