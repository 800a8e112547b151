//! Audit recorder
//!
//! Entries are sanitized and checksummed on the caller's task, then handed to a
//! background writer over a bounded channel so the request path never waits on
//! storage. Write failures are logged and dropped.

use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::database::audit_repository::{AuditLogEntry, AuditOutcome, AuditRepository};

pub const REDACTED: &str = "[REDACTED]";
pub const SYSTEM_ACTOR: &str = "system";

/// Action taxonomy
pub mod actions {
    pub const PAYMENT_CREATE: &str = "payment.create";
    pub const PAYMENT_AUTHORIZE: &str = "payment.authorize";
    pub const PAYMENT_CAPTURE: &str = "payment.capture";
    pub const PAYMENT_CANCEL: &str = "payment.cancel";
    pub const PAYMENT_FAIL: &str = "payment.fail";
    pub const REFUND_CREATE: &str = "refund.create";
    pub const REFUND_COMPLETE: &str = "refund.complete";
    pub const REFUND_FAIL: &str = "refund.fail";
    pub const REFUND_STUCK: &str = "refund.stuck";
    pub const WEBHOOK_RECEIVE: &str = "webhook.receive";
    pub const RECONCILIATION_RUN: &str = "reconciliation.run";
    pub const QUEUE_CONTROL: &str = "queue.control";
    pub const TRANSACTION_LIST: &str = "transaction.list";
}

/// Field names containing any of these (after dropping `_`/`-` and lowercasing) are redacted
const DENY_SUBSTRINGS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "sessiondata",
    "apikey",
    "authorization",
    "credential",
    "privatekey",
    "cardnumber",
    "cardholder",
    "securitycode",
    "expirymonth",
    "expiryyear",
    "accountnumber",
    "iban",
    "nationalid",
    "taxid",
    "passport",
    "hmac",
    "signature",
];

/// Short names matched exactly so that e.g. `company` survives
const DENY_EXACT: &[&str] = &["pan", "pin", "cvv", "cvc", "ssn", "card", "otp"];

fn is_sensitive_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect();
    DENY_EXACT.contains(&normalized.as_str())
        || DENY_SUBSTRINGS.iter().any(|term| normalized.contains(term))
}

/// Recursively redact sensitive fields
pub fn sanitize(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_sensitive_key(k) {
                        JsonValue::String(REDACTED.to_string())
                    } else {
                        sanitize(v)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}

/// What happened, before sanitizing and checksumming
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub correlation_id: String,
    pub actor_id: String,
    pub actor_role: Option<String>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub request_body: Option<JsonValue>,
    pub response_body: Option<JsonValue>,
    pub outcome: AuditOutcome,
    pub status_code: Option<u16>,
    pub duration: Duration,
    pub error_message: Option<String>,
}

impl AuditEvent {
    pub fn new(
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            actor_id: SYSTEM_ACTOR.to_string(),
            actor_role: None,
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            request_body: None,
            response_body: None,
            outcome: AuditOutcome::Success,
            status_code: None,
            duration: Duration::ZERO,
            error_message: None,
        }
    }

    pub fn actor(mut self, actor_id: impl Into<String>, role: Option<String>) -> Self {
        self.actor_id = actor_id.into();
        self.actor_role = role;
        self
    }

    pub fn correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn request(mut self, body: JsonValue) -> Self {
        self.request_body = Some(body);
        self
    }

    pub fn response(mut self, body: JsonValue) -> Self {
        self.response_body = Some(body);
        self
    }

    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.outcome = AuditOutcome::Failure;
        self.error_message = Some(message.into());
        self
    }

    pub fn into_entry(self) -> AuditLogEntry {
        let created_at = AuditLogEntry::timestamp_now();
        let checksum = AuditLogEntry::compute_checksum(
            &self.correlation_id,
            &self.action,
            &self.resource_type,
            &self.resource_id,
            &self.actor_id,
            created_at,
        );
        AuditLogEntry {
            id: Uuid::new_v4(),
            correlation_id: self.correlation_id,
            actor_id: self.actor_id,
            actor_role: self.actor_role,
            action: self.action,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            request_body: self.request_body.as_ref().map(sanitize),
            response_body: self.response_body.as_ref().map(sanitize),
            outcome: self.outcome,
            status_code: self.status_code.map(i32::from),
            duration_ms: self.duration.as_millis() as i64,
            error_message: self.error_message,
            checksum,
            created_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit writer has stopped")]
    WriterStopped,
}

enum AuditCommand {
    Write(Box<AuditLogEntry>),
    Flush(oneshot::Sender<()>),
}

/// Handle used by services and middleware; cheap to clone
#[derive(Clone)]
pub struct AuditRecorder {
    tx: mpsc::Sender<AuditCommand>,
}

impl AuditRecorder {
    /// Start the background writer. The writer stops once every recorder is dropped.
    pub fn spawn(repo: Arc<dyn AuditRepository>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_writer(repo, rx));
        (Self { tx }, handle)
    }

    /// Fire and forget
    pub fn record(&self, event: AuditEvent) {
        let entry = event.into_entry();
        let action = entry.action.clone();
        let resource_id = entry.resource_id.clone();
        if let Err(e) = self.tx.try_send(AuditCommand::Write(Box::new(entry))) {
            warn!(
                action = %action,
                resource_id = %resource_id,
                error = %e,
                "audit entry dropped"
            );
        }
    }

    /// Wait until everything recorded so far has been written
    pub async fn flush(&self) -> Result<(), AuditError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(AuditCommand::Flush(done_tx))
            .await
            .map_err(|_| AuditError::WriterStopped)?;
        done_rx.await.map_err(|_| AuditError::WriterStopped)
    }
}

async fn run_writer(repo: Arc<dyn AuditRepository>, mut rx: mpsc::Receiver<AuditCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            AuditCommand::Write(entry) => match repo.append(&entry).await {
                Ok(()) => debug!(action = %entry.action, resource_id = %entry.resource_id, "audit entry written"),
                Err(e) => warn!(
                    action = %entry.action,
                    resource_id = %entry.resource_id,
                    correlation_id = %entry.correlation_id,
                    error = %e,
                    "audit write failed"
                ),
            },
            AuditCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("audit writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryLedger;
    use serde_json::json;

    #[test]
    fn sanitize_redacts_nested_sensitive_fields() {
        let body = json!({
            "amount": 5000,
            "company": "Acme",
            "paymentMethod": {
                "type": "scheme",
                "encryptedCardNumber": "4111...",
                "cvc": "737"
            },
            "additionalData": [{"hmacSignature": "abc"}],
            "api_key": "sk_live",
            "Authorization": "Bearer x"
        });
        let clean = sanitize(&body);
        assert_eq!(clean["amount"], 5000);
        assert_eq!(clean["company"], "Acme");
        assert_eq!(clean["paymentMethod"]["type"], "scheme");
        assert_eq!(clean["paymentMethod"]["encryptedCardNumber"], REDACTED);
        assert_eq!(clean["paymentMethod"]["cvc"], REDACTED);
        assert_eq!(clean["additionalData"][0]["hmacSignature"], REDACTED);
        assert_eq!(clean["api_key"], REDACTED);
        assert_eq!(clean["Authorization"], REDACTED);
    }

    #[test]
    fn entry_checksum_verifies() {
        let entry = AuditEvent::new(actions::PAYMENT_CAPTURE, "transaction", "tx-1")
            .actor("admin-1", Some("admin".to_string()))
            .correlation("req-1")
            .into_entry();
        assert!(entry.verify());

        let mut tampered = entry.clone();
        tampered.actor_id = "someone-else".to_string();
        assert!(!tampered.verify());
    }

    #[tokio::test]
    async fn recorder_writes_in_background() {
        let ledger = InMemoryLedger::new();
        let (recorder, _writer) = AuditRecorder::spawn(Arc::new(ledger.clone()), 16);

        recorder.record(
            AuditEvent::new(actions::PAYMENT_CREATE, "transaction", "tx-9")
                .request(json!({"amount": 100, "password": "hunter2"})),
        );
        recorder.flush().await.unwrap();

        let entries = ledger.audit_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].request_body.as_ref().unwrap()["password"], REDACTED);
    }

    #[tokio::test]
    async fn writer_stops_when_recorders_are_dropped() {
        let ledger = InMemoryLedger::new();
        let (recorder, writer) = AuditRecorder::spawn(Arc::new(ledger), 4);
        drop(recorder);
        tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .expect("writer exits")
            .unwrap();
    }
}
