use crate::payments::error::GatewayResult;
use crate::payments::types::{
    CancelRequest, CaptureRequest, ModificationResponse, PaymentMethodInfo, PaymentMethodsQuery,
    RefundRequest, SessionRequest, SessionResponse,
};
use async_trait::async_trait;

/// Boundary to the external payment gateway
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_session(&self, request: SessionRequest) -> GatewayResult<SessionResponse>;

    async fn capture(&self, request: CaptureRequest) -> GatewayResult<ModificationResponse>;

    async fn refund(&self, request: RefundRequest) -> GatewayResult<ModificationResponse>;

    async fn cancel(&self, request: CancelRequest) -> GatewayResult<ModificationResponse>;

    async fn payment_methods(
        &self,
        query: PaymentMethodsQuery,
    ) -> GatewayResult<Vec<PaymentMethodInfo>>;

    /// Dependency name used for circuit breaking and logs
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::Amount;
    use std::collections::BTreeMap;

    struct MockGateway;

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn create_session(&self, request: SessionRequest) -> GatewayResult<SessionResponse> {
            Ok(SessionResponse {
                session_id: format!("CS-{}", request.reference),
                session_data: "opaque".to_string(),
                expires_at: None,
            })
        }

        async fn capture(&self, request: CaptureRequest) -> GatewayResult<ModificationResponse> {
            Ok(ModificationResponse {
                psp_reference: format!("CAP-{}", request.gateway_reference),
                status: "received".to_string(),
            })
        }

        async fn refund(&self, request: RefundRequest) -> GatewayResult<ModificationResponse> {
            Ok(ModificationResponse {
                psp_reference: format!("REF-{}", request.gateway_reference),
                status: "received".to_string(),
            })
        }

        async fn cancel(&self, request: CancelRequest) -> GatewayResult<ModificationResponse> {
            Ok(ModificationResponse {
                psp_reference: format!("CAN-{}", request.gateway_reference),
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
                brands: vec!["visa".to_string()],
            }])
        }

        fn name(&self) -> &'static str {
            "mock"
        }
    }

    #[tokio::test]
    async fn trait_can_be_implemented_by_mock_gateway() {
        let gateway: Box<dyn PaymentGateway> = Box::new(MockGateway);
        let session = gateway
            .create_session(SessionRequest {
                reference: "TX-1".to_string(),
                amount: Amount::new(5000, "EUR"),
                return_url: "https://shop.example/return".to_string(),
                shopper_reference: None,
                expires_at: None,
                metadata: BTreeMap::new(),
            })
            .await
            .expect("session creation should succeed");
        assert_eq!(session.session_id, "CS-TX-1");

        let capture = gateway
            .capture(CaptureRequest {
                gateway_reference: "PSP1".to_string(),
                amount: Amount::new(5000, "EUR"),
                reference: "TX-1".to_string(),
            })
            .await
            .expect("capture should succeed");
        assert_eq!(capture.status, "received");
    }
}
