use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{info, warn};

use crate::api::auth::Correlation;
use crate::api::AppState;
use crate::payments::providers::adyen::NotificationBatch;
use crate::services::webhook_processor::{WebhookAck, WebhookProcessorError};

fn ack(status: StatusCode, ack: WebhookAck) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        ack.as_str(),
    )
        .into_response()
}

/// POST /webhooks/adyen
///
/// The body of the response is one of the literal acknowledgements the gateway
/// expects, never JSON.
pub async fn handle_adyen_notification(
    State(state): State<AppState>,
    Correlation(correlation_id): Correlation,
    body: String,
) -> Response {
    let batch: NotificationBatch = match serde_json::from_str(&body) {
        Ok(batch) => batch,
        Err(e) => {
            warn!(request_id = %correlation_id, error = %e, "malformed notification batch");
            return ack(StatusCode::BAD_REQUEST, WebhookAck::Invalid);
        }
    };

    match state
        .webhooks
        .process_batch(&batch, &correlation_id)
        .await
    {
        Ok(summary) => {
            info!(
                request_id = %correlation_id,
                applied = summary.applied,
                duplicates = summary.duplicates,
                ignored = summary.ignored,
                queued = summary.queued,
                rejected = summary.rejected,
                "notification batch accepted"
            );
            ack(StatusCode::OK, WebhookAck::Accepted)
        }
        Err(WebhookProcessorError::EmptyBatch) => ack(StatusCode::BAD_REQUEST, WebhookAck::Invalid),
        Err(
            WebhookProcessorError::InvalidSignature { .. }
            | WebhookProcessorError::MissingSignature { .. },
        ) => ack(StatusCode::UNAUTHORIZED, WebhookAck::Invalid),
        Err(WebhookProcessorError::Queue { .. }) => {
            ack(StatusCode::INTERNAL_SERVER_ERROR, WebhookAck::Failed)
        }
    }
}
