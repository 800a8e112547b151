use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::payments::error::{GatewayError, GatewayResult};

// ============================================================================
// Money
// ============================================================================

/// Amount in minor units, shaped like the gateway's `{value, currency}` object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Amount {
    pub value: i64,
    pub currency: String,
}

impl Amount {
    pub fn new(value: i64, currency: impl Into<String>) -> Self {
        Self {
            value,
            currency: currency.into(),
        }
    }

    pub fn validate_positive(&self, field: &str) -> GatewayResult<()> {
        if self.value <= 0 {
            return Err(GatewayError::Validation {
                message: "amount must be greater than zero".to_string(),
                field: Some(field.to_string()),
            });
        }
        if !is_valid_currency_code(&self.currency) {
            return Err(GatewayError::Validation {
                message: format!("invalid currency code: {}", self.currency),
                field: Some("currency".to_string()),
            });
        }
        Ok(())
    }
}

fn currency_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Z]{3}$").ok()).as_ref()
}

/// ISO 4217 alphabetic code shape check
pub fn is_valid_currency_code(code: &str) -> bool {
    currency_pattern().map_or(false, |p| p.is_match(code))
}

/// Number of minor-unit digits for an ISO 4217 currency
pub fn currency_exponent(currency: &str) -> u32 {
    match currency {
        "BIF" | "CLP" | "DJF" | "GNF" | "ISK" | "JPY" | "KMF" | "KRW" | "PYG" | "RWF"
        | "UGX" | "VND" | "VUV" | "XAF" | "XOF" | "XPF" => 0,
        "BHD" | "IQD" | "JOD" | "KWD" | "LYD" | "OMR" | "TND" => 3,
        _ => 2,
    }
}

/// Minor units to a major-unit decimal, e.g. 5000 EUR -> 50.00
pub fn to_major_units(minor: i64, currency: &str) -> Decimal {
    let exponent = currency_exponent(currency);
    let mut value = Decimal::new(minor, exponent);
    value.rescale(exponent);
    value
}

pub fn format_major_units(minor: i64, currency: &str) -> String {
    to_major_units(minor, currency).to_string()
}

// ============================================================================
// Gateway requests
// ============================================================================

#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Our transaction reference; echoed back as `merchantReference` in webhooks
    pub reference: String,
    pub amount: Amount,
    pub return_url: String,
    pub shopper_reference: Option<String>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionResponse {
    pub session_id: String,
    pub session_data: String,
    pub expires_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub gateway_reference: String,
    pub amount: Amount,
    pub reference: String,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub gateway_reference: String,
    pub amount: Amount,
    /// Our refund reference; echoed back in the REFUND notification
    pub reference: String,
}

#[derive(Debug, Clone)]
pub struct CancelRequest {
    pub gateway_reference: String,
    pub reference: String,
}

/// Acknowledgement of a modification (capture/refund/cancel). The final
/// outcome arrives asynchronously.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModificationResponse {
    pub psp_reference: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymentMethodsQuery {
    pub country: Option<String>,
    pub currency: Option<String>,
    pub amount: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentMethodInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub method_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub brands: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_codes_are_validated() {
        assert!(is_valid_currency_code("EUR"));
        assert!(!is_valid_currency_code("eur"));
        assert!(!is_valid_currency_code("EURO"));
        assert!(!is_valid_currency_code(""));
    }

    #[test]
    fn major_units_follow_currency_exponent() {
        assert_eq!(format_major_units(5000, "EUR"), "50.00");
        assert_eq!(format_major_units(2000, "EUR"), "20.00");
        assert_eq!(format_major_units(5000, "JPY"), "5000");
        assert_eq!(format_major_units(1234, "KWD"), "1.234");
        assert_eq!(format_major_units(5, "USD"), "0.05");
    }

    #[test]
    fn non_positive_amounts_are_rejected() {
        assert!(Amount::new(0, "EUR").validate_positive("amount").is_err());
        assert!(Amount::new(-5, "EUR").validate_positive("amount").is_err());
        assert!(Amount::new(100, "EUR").validate_positive("amount").is_ok());
        assert!(Amount::new(100, "EU").validate_positive("amount").is_err());
    }
}
