//! Idempotency guard
//!
//! A key moves `absent -> processing -> completed | failed` in the shared cache.
//! The first transition is an atomic claim, so exactly one request per key can be
//! `processing`. A `failed` key may be re-claimed with compare-and-swap. When the
//! cache is unreachable the guard lets requests through and says so in the logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::cache::SharedCache;
use crate::cache::keys::idempotency::RecordKey;

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// Lifetime of a finished record
    pub ttl: Duration,
    /// Lifetime of a `processing` claim if the holder never finishes
    pub processing_ttl: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(86_400),
            processing_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IdempotencyRecord {
    Processing {
        claim_id: Uuid,
        started_at: DateTime<Utc>,
    },
    Completed {
        status_code: u16,
        body: String,
        content_type: Option<String>,
        completed_at: DateTime<Utc>,
    },
    Failed {
        status_code: u16,
        failed_at: DateTime<Utc>,
    },
}

/// Response replayed for a completed key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status_code: u16,
    pub body: String,
    pub content_type: Option<String>,
}

/// Proof that this request holds the key
#[derive(Debug, Clone)]
pub struct ClaimToken {
    pub key: String,
    raw: String,
}

#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// Proceed and report the result with `complete` or `fail`
    Acquired(ClaimToken),
    /// Another request holds the key
    InFlight,
    Replay(CachedResponse),
    /// Cache unavailable; proceed without protection
    Degraded,
}

/// Inputs of the server-derived key used when the client sends none
#[derive(Debug, Clone, Default)]
pub struct Fingerprint<'a> {
    pub actor_id: &'a str,
    pub amount: Option<i64>,
    pub currency: Option<&'a str>,
    pub resource_type: Option<&'a str>,
    pub resource_id: Option<&'a str>,
    pub client_address: Option<&'a str>,
}

impl Fingerprint<'_> {
    /// Requests sharing actor, amount, resource and client address collide,
    /// including distinct users behind one NAT address with the same actor id.
    pub fn derive_key(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.actor_id.to_string(),
            self.amount.map(|a| a.to_string()).unwrap_or_default(),
            self.currency.unwrap_or_default().to_string(),
            self.resource_type.unwrap_or_default().to_string(),
            self.resource_id.unwrap_or_default().to_string(),
            self.client_address.unwrap_or_default().to_string(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update(b"\x1f");
        }
        format!("fp_{}", hex::encode(hasher.finalize()))
    }
}

pub struct IdempotencyGuard {
    cache: Arc<dyn SharedCache>,
    config: IdempotencyConfig,
}

impl IdempotencyGuard {
    pub fn new(cache: Arc<dyn SharedCache>, config: IdempotencyConfig) -> Self {
        Self { cache, config }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub async fn begin(&self, key: &str) -> ClaimOutcome {
        let cache_key = RecordKey::new(key).to_string();
        let raw = match serde_json::to_string(&IdempotencyRecord::Processing {
            claim_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }) {
            Ok(raw) => raw,
            Err(e) => return self.degraded(key, &e.to_string()),
        };

        // A record can expire between a lost claim and the read, so try twice.
        for _ in 0..2 {
            match self
                .cache
                .claim(&cache_key, &raw, self.config.processing_ttl)
                .await
            {
                Ok(true) => {
                    debug!(idempotency_key = %key, "idempotency key claimed");
                    return ClaimOutcome::Acquired(ClaimToken {
                        key: cache_key,
                        raw,
                    });
                }
                Ok(false) => {}
                Err(e) => return self.degraded(key, &e.to_string()),
            }

            let existing = match self.cache.get(&cache_key).await {
                Ok(Some(existing)) => existing,
                Ok(None) => continue,
                Err(e) => return self.degraded(key, &e.to_string()),
            };

            let record: IdempotencyRecord = match serde_json::from_str(&existing) {
                Ok(record) => record,
                Err(e) => return self.degraded(key, &format!("unreadable record: {}", e)),
            };

            return match record {
                IdempotencyRecord::Processing { .. } => ClaimOutcome::InFlight,
                IdempotencyRecord::Completed {
                    status_code,
                    body,
                    content_type,
                    ..
                } => ClaimOutcome::Replay(CachedResponse {
                    status_code,
                    body,
                    content_type,
                }),
                IdempotencyRecord::Failed { .. } => {
                    match self
                        .cache
                        .compare_and_swap(&cache_key, &existing, &raw, self.config.processing_ttl)
                        .await
                    {
                        Ok(true) => {
                            debug!(idempotency_key = %key, "retrying previously failed key");
                            ClaimOutcome::Acquired(ClaimToken {
                                key: cache_key,
                                raw,
                            })
                        }
                        Ok(false) => ClaimOutcome::InFlight,
                        Err(e) => self.degraded(key, &e.to_string()),
                    }
                }
            };
        }
        ClaimOutcome::InFlight
    }

    pub async fn complete(
        &self,
        token: &ClaimToken,
        status_code: u16,
        body: String,
        content_type: Option<String>,
    ) {
        self.finish(
            token,
            IdempotencyRecord::Completed {
                status_code,
                body,
                content_type,
                completed_at: Utc::now(),
            },
        )
        .await
    }

    /// Mark the key retryable
    pub async fn fail(&self, token: &ClaimToken, status_code: u16) {
        self.finish(
            token,
            IdempotencyRecord::Failed {
                status_code,
                failed_at: Utc::now(),
            },
        )
        .await
    }

    async fn finish(&self, token: &ClaimToken, record: IdempotencyRecord) {
        let value = match serde_json::to_string(&record) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %token.key, error = %e, "failed to encode idempotency record");
                return;
            }
        };
        match self
            .cache
            .compare_and_swap(&token.key, &token.raw, &value, self.config.ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(
                key = %token.key,
                "idempotency claim expired before the request finished"
            ),
            Err(e) => warn!(key = %token.key, error = %e, "failed to store idempotency result"),
        }
    }

    fn degraded(&self, key: &str, reason: &str) -> ClaimOutcome {
        warn!(
            idempotency_key = %key,
            reason = %reason,
            "idempotency store unavailable, allowing request without dedupe"
        );
        ClaimOutcome::Degraded
    }
}
