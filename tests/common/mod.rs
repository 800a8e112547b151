//! Shared harness: the full router over in-memory stores and a scripted gateway

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::Router;
use http::{Request, Response, StatusCode};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower::ServiceExt;

use payments_core::cache::InMemoryCache;
use payments_core::database::InMemoryLedger;
use payments_core::payments::error::{GatewayError, GatewayResult};
use payments_core::payments::provider::PaymentGateway;
use payments_core::payments::providers::adyen::{
    compute_signature, NotificationBatch, NotificationItemEnvelope, NotificationRequestItem,
};
use payments_core::payments::types::*;
use payments_core::services::notification::LogNotificationSink;
use payments_core::startup::{self, App, Components, Settings};
use payments_core::workers::{QueueConfig, QueueName};

pub const HMAC_KEY: &str = "44782DEF547AAA06C910C43932B1EB0C71FC68D9D0C057550C48EC2ACF6BA056";

/// Gateway whose session and refund calls can be switched to fail
#[derive(Default)]
pub struct ScriptedGateway {
    pub failing: AtomicBool,
    pub session_calls: AtomicU32,
    pub refund_calls: AtomicU32,
}

impl ScriptedGateway {
    pub fn fail_with_network_errors(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> GatewayResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::Network {
                message: "connection reset by peer".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_session(&self, request: SessionRequest) -> GatewayResult<SessionResponse> {
        self.session_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(SessionResponse {
            session_id: format!("CS_{}", request.reference),
            session_data: "session-data".to_string(),
            expires_at: None,
        })
    }

    async fn capture(&self, request: CaptureRequest) -> GatewayResult<ModificationResponse> {
        self.check()?;
        Ok(ModificationResponse {
            psp_reference: format!("CAP_{}", request.gateway_reference),
            status: "received".to_string(),
        })
    }

    async fn refund(&self, request: RefundRequest) -> GatewayResult<ModificationResponse> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(ModificationResponse {
            psp_reference: format!("REF_{}", request.reference),
            status: "received".to_string(),
        })
    }

    async fn cancel(&self, request: CancelRequest) -> GatewayResult<ModificationResponse> {
        self.check()?;
        Ok(ModificationResponse {
            psp_reference: format!("CAN_{}", request.gateway_reference),
            status: "received".to_string(),
        })
    }

    async fn payment_methods(
        &self,
        _query: PaymentMethodsQuery,
    ) -> GatewayResult<Vec<PaymentMethodInfo>> {
        self.check()?;
        Ok(vec![PaymentMethodInfo {
            name: "Cards".to_string(),
            method_type: "scheme".to_string(),
            brands: vec!["visa".to_string()],
        }])
    }

    fn name(&self) -> &'static str {
        "adyen"
    }
}

pub struct TestApp {
    pub app: App,
    pub ledger: InMemoryLedger,
    pub cache: Arc<InMemoryCache>,
    pub gateway: Arc<ScriptedGateway>,
    pub shutdown_tx: watch::Sender<bool>,
}

pub fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.webhooks.hmac_key = Some(HMAC_KEY.to_string());
    settings
}

/// Deferred notifications retried within milliseconds
pub fn with_fast_webhook_retries(mut settings: Settings, max_attempts: u32) -> Settings {
    settings.webhooks.defer_delay = Duration::from_millis(50);
    settings.queues.insert(
        QueueName::Webhooks,
        QueueConfig {
            max_attempts,
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_millis(200),
            poll_interval: Duration::from_millis(20),
            ..QueueConfig::defaults_for(QueueName::Webhooks)
        },
    );
    settings
}

pub fn spawn_app(settings: Settings) -> TestApp {
    spawn_app_over(settings, InMemoryLedger::new(), Arc::new(InMemoryCache::new()))
}

/// An app sharing the ledger and cache of an earlier instance
pub fn spawn_app_over(settings: Settings, ledger: InMemoryLedger, cache: Arc<InMemoryCache>) -> TestApp {
    let gateway = Arc::new(ScriptedGateway::default());
    let components = Components::over_ledger(
        ledger.clone(),
        gateway.clone(),
        cache.clone(),
        Arc::new(LogNotificationSink),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = startup::build(components, settings, shutdown_rx);
    TestApp {
        app,
        ledger,
        cache,
        gateway,
        shutdown_tx,
    }
}

impl TestApp {
    pub fn router(&self) -> Router {
        self.app.router.clone()
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router().oneshot(request).await.unwrap()
    }

    pub async fn create_payment(&self, user: &str, amount: i64, resource_id: &str) -> (StatusCode, Value) {
        let response = self
            .send(
                Request::post("/payments")
                    .header("content-type", "application/json")
                    .header("x-user-id", user)
                    .body(Body::from(
                        json!({
                            "amount": amount,
                            "currency": "EUR",
                            "resourceType": "booking",
                            "resourceId": resource_id,
                            "returnUrl": "https://shop.test/return"
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await;
        let status = response.status();
        (status, json_body(response).await)
    }

    pub async fn get_payment(&self, user: &str, id: &str) -> (StatusCode, Value) {
        let response = self
            .send(
                Request::get(format!("/payments/{}", id))
                    .header("x-user-id", user)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        let status = response.status();
        (status, json_body(response).await)
    }

    /// POST a signed batch; returns the status and the literal ack
    pub async fn deliver(&self, items: Vec<NotificationRequestItem>) -> (StatusCode, String) {
        let batch = signed_batch(items);
        let response = self
            .send(
                Request::post("/webhooks/adyen")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_string(&batch).unwrap()))
                    .unwrap(),
            )
            .await;
        let status = response.status();
        (status, text_body(response).await)
    }

    /// Poll the payment until `done` holds or five seconds pass; returns the last view
    pub async fn wait_for_payment(&self, user: &str, id: &str, done: impl Fn(&Value) -> bool) -> Value {
        let mut view = Value::Null;
        for _ in 0..100 {
            view = self.get_payment(user, id).await.1;
            if done(&view) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        view
    }

    /// Wait until the background audit writer has persisted what was recorded
    pub async fn flush_audit(&self) {
        self.app.audit.flush().await.unwrap();
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.app.queues.close_all();
        for handle in self.app.workers {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
        self.app.queues.release_held().await;
    }
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn text_body(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub fn notification(
    event_code: &str,
    success: bool,
    merchant_reference: &str,
    psp_reference: &str,
    value: i64,
) -> NotificationRequestItem {
    NotificationRequestItem {
        event_code: event_code.to_string(),
        success,
        psp_reference: psp_reference.to_string(),
        original_reference: None,
        merchant_account_code: Some("TestMerchant".to_string()),
        merchant_reference: merchant_reference.to_string(),
        amount: Amount::new(value, "EUR"),
        payment_method: Some("visa".to_string()),
        reason: None,
        event_date: None,
        additional_data: BTreeMap::new(),
    }
}

pub fn sign(mut item: NotificationRequestItem) -> NotificationRequestItem {
    let signature = compute_signature(HMAC_KEY, &item).unwrap();
    item.additional_data
        .insert("hmacSignature".to_string(), json!(signature));
    item
}

pub fn batch(items: Vec<NotificationRequestItem>) -> NotificationBatch {
    NotificationBatch {
        live: Some("false".to_string()),
        notification_items: items
            .into_iter()
            .map(|item| NotificationItemEnvelope { item })
            .collect(),
    }
}

pub fn signed_batch(items: Vec<NotificationRequestItem>) -> NotificationBatch {
    batch(items.into_iter().map(sign).collect())
}
