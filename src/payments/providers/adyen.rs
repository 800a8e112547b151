//! Adyen Checkout API adapter and notification (webhook) wire types.

use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::provider::PaymentGateway;
use crate::payments::types::{
    Amount, CancelRequest, CaptureRequest, ModificationResponse, PaymentMethodInfo,
    PaymentMethodsQuery, RefundRequest, SessionRequest, SessionResponse,
};
use crate::payments::utils::{hmac_sha256_base64, verify_hmac_sha256_base64, PaymentHttpClient};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::info;

pub const PROVIDER_NAME: &str = "adyen";

#[derive(Debug, Clone)]
pub struct AdyenConfig {
    pub api_key: String,
    pub merchant_account: String,
    pub checkout_url: String,
    pub hmac_key: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for AdyenConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            merchant_account: String::new(),
            checkout_url: "https://checkout-test.adyen.com/v71".to_string(),
            hmac_key: None,
            timeout_secs: 15,
            max_retries: 2,
        }
    }
}

impl AdyenConfig {
    pub fn from_env() -> GatewayResult<Self> {
        let api_key = std::env::var("ADYEN_API_KEY").map_err(|_| GatewayError::Validation {
            message: "ADYEN_API_KEY environment variable is required".to_string(),
            field: Some("ADYEN_API_KEY".to_string()),
        })?;
        let merchant_account =
            std::env::var("ADYEN_MERCHANT_ACCOUNT").map_err(|_| GatewayError::Validation {
                message: "ADYEN_MERCHANT_ACCOUNT environment variable is required".to_string(),
                field: Some("ADYEN_MERCHANT_ACCOUNT".to_string()),
            })?;

        Ok(Self {
            api_key,
            merchant_account,
            checkout_url: std::env::var("ADYEN_CHECKOUT_URL")
                .unwrap_or_else(|_| "https://checkout-test.adyen.com/v71".to_string()),
            hmac_key: std::env::var("ADYEN_HMAC_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            timeout_secs: std::env::var("ADYEN_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(15),
            max_retries: std::env::var("ADYEN_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(2),
        })
    }
}

pub struct AdyenGateway {
    config: AdyenConfig,
    http: PaymentHttpClient,
}

impl AdyenGateway {
    pub fn new(config: AdyenConfig) -> GatewayResult<Self> {
        let http = PaymentHttpClient::new(
            PROVIDER_NAME,
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> GatewayResult<Self> {
        Self::new(AdyenConfig::from_env()?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.checkout_url.trim_end_matches('/'), path)
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        payload: &serde_json::Value,
        idempotency_key: Option<&str>,
    ) -> GatewayResult<T> {
        let mut headers = vec![
            ("X-API-Key", self.config.api_key.as_str()),
            ("Content-Type", "application/json"),
        ];
        if let Some(key) = idempotency_key {
            headers.push(("Idempotency-Key", key));
        }
        self.http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint(path),
                Some(payload),
                &headers,
            )
            .await
    }

    fn ensure_reference(gateway_reference: &str) -> GatewayResult<()> {
        if gateway_reference.trim().is_empty() {
            return Err(GatewayError::Validation {
                message: "gateway reference is required".to_string(),
                field: Some("gateway_reference".to_string()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for AdyenGateway {
    async fn create_session(&self, request: SessionRequest) -> GatewayResult<SessionResponse> {
        request.amount.validate_positive("amount")?;

        let payload = serde_json::json!({
            "merchantAccount": self.config.merchant_account,
            "amount": request.amount,
            "reference": request.reference,
            "returnUrl": request.return_url,
            "shopperReference": request.shopper_reference,
            "expiresAt": request.expires_at.map(|t| t.to_rfc3339()),
            "metadata": request.metadata,
        });

        let raw: AdyenSessionResponse = self.post("/sessions", &payload, None).await?;
        info!(reference = %request.reference, session_id = %raw.id, "adyen session created");

        Ok(SessionResponse {
            session_id: raw.id,
            session_data: raw.session_data,
            expires_at: raw.expires_at,
        })
    }

    async fn capture(&self, request: CaptureRequest) -> GatewayResult<ModificationResponse> {
        Self::ensure_reference(&request.gateway_reference)?;
        request.amount.validate_positive("amount")?;

        let payload = serde_json::json!({
            "merchantAccount": self.config.merchant_account,
            "amount": request.amount,
            "reference": request.reference,
        });
        let raw: AdyenModificationResponse = self
            .post(
                &format!("/payments/{}/captures", request.gateway_reference),
                &payload,
                Some(&format!("capture-{}", request.reference)),
            )
            .await?;
        Ok(raw.into())
    }

    async fn refund(&self, request: RefundRequest) -> GatewayResult<ModificationResponse> {
        Self::ensure_reference(&request.gateway_reference)?;
        request.amount.validate_positive("amount")?;

        let payload = serde_json::json!({
            "merchantAccount": self.config.merchant_account,
            "amount": request.amount,
            "reference": request.reference,
        });
        let raw: AdyenModificationResponse = self
            .post(
                &format!("/payments/{}/refunds", request.gateway_reference),
                &payload,
                Some(&format!("refund-{}", request.reference)),
            )
            .await?;
        Ok(raw.into())
    }

    async fn cancel(&self, request: CancelRequest) -> GatewayResult<ModificationResponse> {
        Self::ensure_reference(&request.gateway_reference)?;

        let payload = serde_json::json!({
            "merchantAccount": self.config.merchant_account,
            "reference": request.reference,
        });
        let raw: AdyenModificationResponse = self
            .post(
                &format!("/payments/{}/cancels", request.gateway_reference),
                &payload,
                Some(&format!("cancel-{}", request.reference)),
            )
            .await?;
        Ok(raw.into())
    }

    async fn payment_methods(
        &self,
        query: PaymentMethodsQuery,
    ) -> GatewayResult<Vec<PaymentMethodInfo>> {
        let mut payload = serde_json::json!({
            "merchantAccount": self.config.merchant_account,
        });
        if let Some(country) = &query.country {
            payload["countryCode"] = serde_json::json!(country);
        }
        if let Some(currency) = &query.currency {
            payload["amount"] = serde_json::json!(Amount::new(
                query.amount.unwrap_or(1000),
                currency.clone()
            ));
        }

        let raw: AdyenPaymentMethodsResponse = self.post("/paymentMethods", &payload, None).await?;
        Ok(raw.payment_methods)
    }

    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdyenSessionResponse {
    id: String,
    session_data: String,
    expires_at: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdyenModificationResponse {
    psp_reference: String,
    status: String,
}

impl From<AdyenModificationResponse> for ModificationResponse {
    fn from(raw: AdyenModificationResponse) -> Self {
        ModificationResponse {
            psp_reference: raw.psp_reference,
            status: raw.status,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdyenPaymentMethodsResponse {
    #[serde(default)]
    payment_methods: Vec<PaymentMethodInfo>,
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventCode {
    Authorisation,
    Capture,
    CaptureFailed,
    Refund,
    RefundFailed,
    Cancellation,
    Other(String),
}

impl EventCode {
    pub fn parse(code: &str) -> Self {
        match code {
            "AUTHORISATION" => EventCode::Authorisation,
            "CAPTURE" => EventCode::Capture,
            "CAPTURE_FAILED" => EventCode::CaptureFailed,
            "REFUND" => EventCode::Refund,
            "REFUND_FAILED" => EventCode::RefundFailed,
            "CANCELLATION" => EventCode::Cancellation,
            other => EventCode::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            EventCode::Authorisation => "AUTHORISATION",
            EventCode::Capture => "CAPTURE",
            EventCode::CaptureFailed => "CAPTURE_FAILED",
            EventCode::Refund => "REFUND",
            EventCode::RefundFailed => "REFUND_FAILED",
            EventCode::Cancellation => "CANCELLATION",
            EventCode::Other(other) => other.as_str(),
        };
        f.write_str(code)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationBatch {
    #[serde(default)]
    pub live: Option<String>,
    #[serde(default)]
    pub notification_items: Vec<NotificationItemEnvelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationItemEnvelope {
    #[serde(rename = "NotificationRequestItem")]
    pub item: NotificationRequestItem,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequestItem {
    pub event_code: String,
    #[serde(deserialize_with = "bool_from_string_or_bool")]
    pub success: bool,
    pub psp_reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_account_code: Option<String>,
    #[serde(default)]
    pub merchant_reference: String,
    pub amount: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_date: Option<String>,
    #[serde(default)]
    pub additional_data: BTreeMap<String, serde_json::Value>,
}

impl NotificationRequestItem {
    pub fn event(&self) -> EventCode {
        EventCode::parse(&self.event_code)
    }

    pub fn hmac_signature(&self) -> Option<&str> {
        self.additional_data
            .get("hmacSignature")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    /// `pspReference:originalReference:merchantAccountCode:merchantReference:value:currency:eventCode:success`
    pub fn signing_payload(&self) -> String {
        [
            self.psp_reference.as_str(),
            self.original_reference.as_deref().unwrap_or(""),
            self.merchant_account_code.as_deref().unwrap_or(""),
            self.merchant_reference.as_str(),
            &self.amount.value.to_string(),
            self.amount.currency.as_str(),
            self.event_code.as_str(),
            if self.success { "true" } else { "false" },
        ]
        .join(":")
    }
}

fn bool_from_string_or_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => Ok(b),
        Flag::Text(s) => Ok(s.eq_ignore_ascii_case("true")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    Valid,
    Invalid,
    Missing,
}

/// Signature for an item under the hex-encoded HMAC key
pub fn compute_signature(hex_key: &str, item: &NotificationRequestItem) -> Option<String> {
    hmac_sha256_base64(hex_key, &item.signing_payload())
}

/// Recompute and compare in constant time
pub fn verify_signature(hex_key: &str, item: &NotificationRequestItem) -> SignatureCheck {
    let Some(supplied) = item.hmac_signature() else {
        return SignatureCheck::Missing;
    };
    if verify_hmac_sha256_base64(hex_key, &item.signing_payload(), supplied) {
        SignatureCheck::Valid
    } else {
        SignatureCheck::Invalid
    }
}
