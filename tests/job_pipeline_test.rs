//! Background jobs and the operator surface over them

mod common;

use axum::body::Body;
use common::*;
use http::{Request, StatusCode};
use serde_json::Value;
use std::time::Duration;

fn admin(request: http::request::Builder) -> Request<Body> {
    request
        .header("x-user-id", "ops-1")
        .header("x-user-role", "admin")
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_expired_session_fails_the_payment() {
    let mut settings = settings();
    settings.orchestrator.session_expiry = Duration::from_millis(100);
    let app = spawn_app(settings);

    let (_, created) = app.create_payment("user-1", 5000, "booking-1").await;
    let payment_id = created["paymentId"].as_str().unwrap().to_string();

    let mut view = Value::Null;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        view = app.get_payment("user-1", &payment_id).await.1;
        if view["status"] == "failed" {
            break;
        }
    }
    assert_eq!(view["status"], "failed");
    assert_eq!(view["failureReason"], "session_expired");

    app.shutdown().await;
}

#[tokio::test]
async fn test_queue_pause_and_resume() {
    let app = spawn_app(settings());

    let response = app
        .send(admin(Request::post("/admin/queues/notifications/pause")))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let stats = json_body(response).await;
    assert_eq!(stats["name"], "notifications");
    assert_eq!(stats["paused"], true);

    // Notifications pile up while paused
    app.create_payment("user-1", 5000, "booking-2").await;
    let response = app.send(admin(Request::get("/admin/queues"))).await;
    let queues = json_body(response).await;
    let notifications = queues
        .as_array()
        .unwrap()
        .iter()
        .find(|q| q["name"] == "notifications")
        .unwrap();
    assert!(notifications["waiting"].as_u64().unwrap() >= 1);

    let response = app
        .send(admin(Request::post("/admin/queues/notifications/resume")))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["paused"], false);

    let mut completed = 0;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let queues = json_body(app.send(admin(Request::get("/admin/queues"))).await).await;
        completed = queues
            .as_array()
            .unwrap()
            .iter()
            .find(|q| q["name"] == "notifications")
            .and_then(|q| q["completed"].as_u64())
            .unwrap_or(0);
        if completed >= 1 {
            break;
        }
    }
    assert!(completed >= 1);

    app.shutdown().await;
}

#[tokio::test]
async fn test_unknown_queue_and_job_are_rejected() {
    let app = spawn_app(settings());

    let response = app
        .send(admin(Request::post("/admin/queues/emails/pause")))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .send(admin(Request::delete(format!(
            "/admin/jobs/{}",
            uuid::Uuid::new_v4()
        ))))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"], "JOB_NOT_FOUND");

    app.shutdown().await;
}

#[tokio::test]
async fn test_admin_transaction_listing() {
    let app = spawn_app(settings());
    app.create_payment("user-1", 5000, "booking-3").await;
    app.create_payment("user-2", 1200, "booking-4").await;

    let response = app
        .send(admin(Request::get("/admin/transactions?ownerId=user-2")))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let page = json_body(response).await;
    assert_eq!(page["total"], 1);
    assert_eq!(page["items"][0]["amount"], 1200);

    let response = app
        .send(
            Request::get("/admin/transactions")
                .header("x-user-id", "user-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    app.shutdown().await;
}

#[tokio::test]
async fn test_health_endpoints() {
    let app = spawn_app(settings());

    let response = app
        .send(Request::get("/health/live").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text_body(response).await, "OK");

    let response = app
        .send(Request::get("/health/ready").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    // A cache outage degrades but keeps the service ready
    app.cache.set_available(false);
    let response = app
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "Degraded");

    app.shutdown().await;
}
