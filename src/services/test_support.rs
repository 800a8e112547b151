//! Doubles shared by service and worker unit tests

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::database::InMemoryLedger;
use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::provider::PaymentGateway;
use crate::payments::providers::adyen::NotificationRequestItem;
use crate::payments::types::*;
use crate::services::audit::AuditRecorder;
use crate::services::notification::Notifier;
use crate::services::payment_orchestrator::{
    Actor, CreatePaymentRequest, OrchestratorConfig, PaymentOrchestrator,
};
use crate::workers::jobs::{JobError, JobOptions, JobPayload, JobScheduler, QueueName};

#[derive(Default)]
pub struct FakeGateway {
    pub refund_error: Mutex<Option<GatewayError>>,
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_session(&self, request: SessionRequest) -> GatewayResult<SessionResponse> {
        Ok(SessionResponse {
            session_id: format!("CS_{}", request.reference),
            session_data: "session-data".to_string(),
            expires_at: None,
        })
    }

    async fn capture(&self, request: CaptureRequest) -> GatewayResult<ModificationResponse> {
        Ok(ModificationResponse {
            psp_reference: format!("CAP_{}", request.gateway_reference),
            status: "received".to_string(),
        })
    }

    async fn refund(&self, request: RefundRequest) -> GatewayResult<ModificationResponse> {
        if let Some(e) = self.refund_error.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(ModificationResponse {
            psp_reference: format!("REF_{}", request.reference),
            status: "received".to_string(),
        })
    }

    async fn cancel(&self, request: CancelRequest) -> GatewayResult<ModificationResponse> {
        Ok(ModificationResponse {
            psp_reference: format!("CAN_{}", request.gateway_reference),
            status: "received".to_string(),
        })
    }

    async fn payment_methods(
        &self,
        _query: PaymentMethodsQuery,
    ) -> GatewayResult<Vec<PaymentMethodInfo>> {
        Ok(vec![PaymentMethodInfo {
            name: "Cards".to_string(),
            method_type: "scheme".to_string(),
            brands: vec!["visa".to_string(), "mc".to_string()],
        }])
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

#[derive(Default)]
pub struct RecordingScheduler {
    pub jobs: Mutex<Vec<(QueueName, JobPayload)>>,
}

impl RecordingScheduler {
    pub fn on(&self, queue: QueueName) -> Vec<JobPayload> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|(q, _)| *q == queue)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

impl JobScheduler for RecordingScheduler {
    fn enqueue(
        &self,
        queue: QueueName,
        payload: JobPayload,
        _options: JobOptions,
    ) -> Result<Uuid, JobError> {
        self.jobs.lock().unwrap().push((queue, payload));
        Ok(Uuid::new_v4())
    }
}

pub struct Fixture {
    pub ledger: InMemoryLedger,
    pub scheduler: Arc<RecordingScheduler>,
    pub audit: AuditRecorder,
    pub orchestrator: Arc<PaymentOrchestrator>,
}

pub fn fixture(auto_capture: bool) -> Fixture {
    let ledger = InMemoryLedger::new();
    let scheduler = Arc::new(RecordingScheduler::default());
    let (audit, _writer) = AuditRecorder::spawn(Arc::new(ledger.clone()), 256);
    let orchestrator = Arc::new(PaymentOrchestrator::new(
        Arc::new(ledger.clone()),
        Arc::new(ledger.clone()),
        Arc::new(FakeGateway::default()),
        scheduler.clone(),
        Notifier::new(scheduler.clone()),
        audit.clone(),
        OrchestratorConfig {
            auto_capture,
            ..Default::default()
        },
    ));
    Fixture {
        ledger,
        scheduler,
        audit,
        orchestrator,
    }
}

impl Fixture {
    /// Create a pending payment; returns its id and merchant reference
    pub async fn pending_payment(&self, amount: i64) -> (Uuid, String) {
        let created = self
            .orchestrator
            .create_payment(
                &Actor::user("user-1"),
                CreatePaymentRequest {
                    amount,
                    currency: "EUR".to_string(),
                    resource_type: "booking".to_string(),
                    resource_id: "b-1".to_string(),
                    return_url: "https://shop.test/return".to_string(),
                    metadata: BTreeMap::new(),
                },
            )
            .await
            .unwrap();
        (created.payment_id, created.transaction_reference)
    }
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
