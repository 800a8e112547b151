//! Gateway notification intake

mod common;

use axum::body::Body;
use common::*;
use http::{Request, StatusCode};

#[tokio::test]
async fn test_invalid_signature_rejects_whole_batch() {
    let app = spawn_app(settings());
    let (_, created) = app.create_payment("user-1", 5000, "booking-1").await;
    let payment_id = created["paymentId"].as_str().unwrap().to_string();
    let reference = created["transactionReference"].as_str().unwrap().to_string();

    let mut tampered = sign(notification("AUTHORISATION", true, &reference, "PSP-1", 5000));
    tampered.amount.value = 1;
    let body = serde_json::to_string(&batch(vec![tampered])).unwrap();

    let response = app
        .send(
            Request::post("/webhooks/adyen")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(text_body(response).await, "[invalid]");

    let (_, view) = app.get_payment("user-1", &payment_id).await;
    assert_eq!(view["status"], "pending");

    app.shutdown().await;
}

#[tokio::test]
async fn test_empty_and_malformed_batches_are_invalid() {
    let app = spawn_app(settings());

    for body in [r#"{"live":"false","notificationItems":[]}"#, "not json"] {
        let response = app
            .send(
                Request::post("/webhooks/adyen")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(text_body(response).await, "[invalid]");
    }

    app.shutdown().await;
}

#[tokio::test]
async fn test_refusal_fails_pending_payment() {
    let app = spawn_app(settings());
    let (_, created) = app.create_payment("user-1", 5000, "booking-2").await;
    let payment_id = created["paymentId"].as_str().unwrap().to_string();
    let reference = created["transactionReference"].as_str().unwrap().to_string();

    let mut refused = notification("AUTHORISATION", false, &reference, "PSP-2", 5000);
    refused.reason = Some("Refused".to_string());
    let (status, ack) = app.deliver(vec![refused]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack, "[accepted]");

    let (_, view) = app.get_payment("user-1", &payment_id).await;
    assert_eq!(view["status"], "failed");

    // A late authorisation cannot revive a failed payment
    let (status, _) = app
        .deliver(vec![notification("AUTHORISATION", true, &reference, "PSP-3", 5000)])
        .await;
    assert_eq!(status, StatusCode::OK);
    let (_, view) = app.get_payment("user-1", &payment_id).await;
    assert_eq!(view["status"], "failed");

    app.shutdown().await;
}

#[tokio::test]
async fn test_unknown_reference_is_acknowledged() {
    let app = spawn_app(settings());

    let (status, ack) = app
        .deliver(vec![notification("REPORT_AVAILABLE", true, "", "PSP-9", 0)])
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack, "[accepted]");
    assert_eq!(app.ledger.transaction_count().await, 0);

    app.shutdown().await;
}

#[tokio::test]
async fn test_batch_receipt_is_audited() {
    let app = spawn_app(settings());
    let (_, created) = app.create_payment("user-1", 5000, "booking-3").await;
    let reference = created["transactionReference"].as_str().unwrap().to_string();

    app.deliver(vec![notification("AUTHORISATION", true, &reference, "PSP-4", 5000)])
        .await;
    app.flush_audit().await;

    let entries = app.ledger.audit_entries().await;
    assert!(entries.iter().any(|e| e.action == "webhook.receive"));
    assert!(entries.iter().all(|e| e.verify()));

    app.shutdown().await;
}

#[tokio::test]
async fn test_signed_items_are_refused_without_a_verification_key() {
    let mut settings = settings();
    settings.webhooks.hmac_key = None;
    let app = spawn_app(settings);
    let (_, created) = app.create_payment("user-1", 5000, "booking-4").await;
    let payment_id = created["paymentId"].as_str().unwrap().to_string();
    let reference = created["transactionReference"].as_str().unwrap().to_string();

    let mut forged = notification("AUTHORISATION", true, &reference, "PSP-5", 5000);
    forged
        .additional_data
        .insert("hmacSignature".to_string(), serde_json::json!("Zm9yZ2Vk"));
    let response = app
        .send(
            Request::post("/webhooks/adyen")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_string(&batch(vec![forged])).unwrap()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(text_body(response).await, "[invalid]");

    let (_, view) = app.get_payment("user-1", &payment_id).await;
    assert_eq!(view["status"], "pending");

    app.shutdown().await;
}
