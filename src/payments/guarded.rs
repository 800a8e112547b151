use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::provider::PaymentGateway;
use crate::payments::types::{
    CancelRequest, CaptureRequest, ModificationResponse, PaymentMethodInfo, PaymentMethodsQuery,
    RefundRequest, SessionRequest, SessionResponse,
};
use crate::services::circuit_breaker::CircuitBreaker;

/// Runs every gateway call through the gateway's circuit breaker.
pub struct CircuitBreakingGateway {
    inner: Arc<dyn PaymentGateway>,
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakingGateway {
    pub fn new(inner: Arc<dyn PaymentGateway>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    async fn guarded<T, F>(&self, call: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>> + Send,
    {
        let permit = self
            .breaker
            .try_acquire()
            .map_err(|open| GatewayError::CircuitOpen {
                dependency: open.dependency,
                retry_after_secs: open.retry_after.as_secs().max(1),
            })?;

        let result = call.await;
        match &result {
            Err(e) if e.counts_as_dependency_failure() => permit.failure(),
            _ => permit.success(),
        }
        result
    }
}

#[async_trait]
impl PaymentGateway for CircuitBreakingGateway {
    async fn create_session(&self, request: SessionRequest) -> GatewayResult<SessionResponse> {
        self.guarded(self.inner.create_session(request)).await
    }

    async fn capture(&self, request: CaptureRequest) -> GatewayResult<ModificationResponse> {
        self.guarded(self.inner.capture(request)).await
    }

    async fn refund(&self, request: RefundRequest) -> GatewayResult<ModificationResponse> {
        self.guarded(self.inner.refund(request)).await
    }

    async fn cancel(&self, request: CancelRequest) -> GatewayResult<ModificationResponse> {
        self.guarded(self.inner.cancel(request)).await
    }

    async fn payment_methods(
        &self,
        query: PaymentMethodsQuery,
    ) -> GatewayResult<Vec<PaymentMethodInfo>> {
        self.guarded(self.inner.payment_methods(query)).await
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
