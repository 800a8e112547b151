use crate::payments::error::{GatewayError, GatewayResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sha2::Sha256;
use std::time::Duration;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    provider: &'static str,
    timeout: Duration,
    max_retries: u32,
}

impl PaymentHttpClient {
    pub fn new(provider: &'static str, timeout: Duration, max_retries: u32) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Network {
                message: format!("failed to initialize HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            provider,
            timeout,
            max_retries,
        })
    }

    /// Send a JSON request, retrying transport errors, 429 and 5xx with
    /// exponential backoff. Any other 4xx is a definitive decline.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&JsonValue>,
        headers: &[(&str, &str)],
    ) -> GatewayResult<T> {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            let mut request = self.client.request(method.clone(), url);
            request = request.timeout(self.timeout);

            for (k, v) in headers {
                request = request.header(*k, *v);
            }
            if let Some(payload) = body {
                request = request.json(payload);
            }

            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout {
                        timeout_secs: self.timeout.as_secs(),
                    }
                } else {
                    GatewayError::Network {
                        message: format!("gateway request failed: {}", e),
                    }
                }
            });

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if status.is_success() {
                        return serde_json::from_str::<T>(&text).map_err(|e| {
                            GatewayError::Provider {
                                provider: self.provider.to_string(),
                                message: format!("invalid gateway JSON response: {}", e),
                                provider_code: None,
                                retryable: false,
                            }
                        });
                    }

                    if status.as_u16() == 429 {
                        if attempt < self.max_retries {
                            tokio::time::sleep(backoff(attempt)).await;
                            continue;
                        }
                        return Err(GatewayError::RateLimited {
                            message: "gateway rate limit exceeded".to_string(),
                            retry_after_seconds: None,
                        });
                    }

                    if status.is_server_error() {
                        if attempt < self.max_retries {
                            warn!(
                                provider = self.provider,
                                status = %status,
                                attempt = attempt + 1,
                                "gateway server error, retrying"
                            );
                            tokio::time::sleep(backoff(attempt)).await;
                            continue;
                        }
                        return Err(GatewayError::Provider {
                            provider: self.provider.to_string(),
                            message: format!("HTTP {}: {}", status, text),
                            provider_code: Some(status.as_u16().to_string()),
                            retryable: true,
                        });
                    }

                    return Err(GatewayError::Declined {
                        message: format!("HTTP {}: {}", status, text),
                        provider_code: Some(status.as_u16().to_string()),
                    });
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < self.max_retries {
                        tokio::time::sleep(backoff(attempt)).await;
                        continue;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(GatewayError::Network {
            message: "gateway request failed".to_string(),
        }))
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(250 * (1 << attempt.min(6)))
}

/// Base64 HMAC-SHA256 of `payload` keyed with the hex-encoded `hex_key`
pub fn hmac_sha256_base64(hex_key: &str, payload: &str) -> Option<String> {
    let key = hex::decode(hex_key.trim()).ok()?;
    let mut mac = HmacSha256::new_from_slice(&key).ok()?;
    mac.update(payload.as_bytes());
    Some(BASE64.encode(mac.finalize().into_bytes()))
}

/// Check a base64 HMAC-SHA256 signature over `payload` in constant time
pub fn verify_hmac_sha256_base64(hex_key: &str, payload: &str, signature: &str) -> bool {
    let Ok(key) = hex::decode(hex_key.trim()) else {
        return false;
    };
    let Ok(supplied) = BASE64.decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(&key) else {
        return false;
    };
    mac.update(payload.as_bytes());
    mac.verify_slice(&supplied).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_only_the_matching_signature() {
        let signature = hmac_sha256_base64("00112233", "payload").unwrap();
        assert!(verify_hmac_sha256_base64("00112233", "payload", &signature));
        assert!(!verify_hmac_sha256_base64("00112233", "payload2", &signature));
        assert!(!verify_hmac_sha256_base64("44556677", "payload", &signature));
        assert!(!verify_hmac_sha256_base64("00112233", "payload", "%%not-base64%%"));
        assert!(!verify_hmac_sha256_base64("not-hex", "payload", &signature));
    }

    #[test]
    fn hmac_requires_hex_key() {
        assert!(hmac_sha256_base64("not-hex", "payload").is_none());
        let a = hmac_sha256_base64("00112233", "payload").unwrap();
        let b = hmac_sha256_base64("00112233", "payload").unwrap();
        let c = hmac_sha256_base64("00112233", "payload2").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn backoff_grows_exponentially() {
        assert_eq!(backoff(0), Duration::from_millis(250));
        assert_eq!(backoff(2), Duration::from_millis(1000));
    }
}
