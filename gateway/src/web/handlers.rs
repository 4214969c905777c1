//! HTTP endpoint handlers.
//!
//! These handlers stay thin: authenticate, validate the body, hand the send
//! to the gateway and translate its outcome. All pacing, retrying and
//! ordering happens in the queue.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::auth::authenticate;
use crate::error::Error;
use crate::gate::Gateway;
use crate::limit::{ApiKeyRegistry, KeyStatistics};
use crate::queue::{QueueStats, RetryPolicy};
use crate::transport::{Delivery, Transport};
use crate::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub gateway: Gateway,
    pub keys: Arc<ApiKeyRegistry>,
    pub transport: Arc<dyn Transport>,
}

impl AppState {
    pub fn new(
        config: Config,
        gateway: Gateway,
        keys: Arc<ApiKeyRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            gateway,
            keys,
            transport,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// JSON error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Error returned by handlers, rendered as an [`ErrorResponse`].
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    retry_after_ms: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Timeout { .. } | Error::TransportFailure { .. } | Error::ExhaustedRetries { .. } => {
                StatusCode::BAD_GATEWAY
            }
            Error::QueueCancelled { .. } | Error::Abandoned { .. } => StatusCode::SERVICE_UNAVAILABLE,
        };
        let retry_after_ms = match &err {
            Error::RateLimited { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        };

        Self {
            status,
            message: err.to_string(),
            retry_after_ms,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        warn!(status = rejection.status().as_u16(), error = %rejection.body_text(), "request_body_rejected");
        Self::new(rejection.status(), rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            success: false,
            error: self.message,
            retry_after_ms: self.retry_after_ms,
        });

        let mut response = (self.status, body).into_response();
        if let Some(ms) = self.retry_after_ms {
            let secs = ms.div_ceil(1000);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Strip formatting from a phone number, keeping 8 to 15 digits.
pub fn normalize_recipient(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    (8..=15).contains(&digits.len()).then_some(digits)
}

fn send_work(
    transport: &Arc<dyn Transport>,
    to: String,
    message: String,
) -> impl FnMut() -> BoxFuture<'static, anyhow::Result<Delivery>> + Send + 'static {
    let transport = Arc::clone(transport);
    move || {
        let transport = Arc::clone(&transport);
        let to = to.clone();
        let message = message.clone();
        async move { transport.send(&to, &message).await }.boxed()
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub queue: QueueStats,
    pub timestamp: DateTime<Utc>,
}

/// Health check endpoint (never rate limited).
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        queue: state.gateway.stats(),
        timestamp: Utc::now(),
    })
}

// =============================================================================
// Single send
// =============================================================================

/// Single message request body.
#[derive(Debug, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub number: String,
    #[serde(default)]
    pub message: String,
}

/// Single message response body.
#[derive(Serialize, Deserialize)]
pub struct SendResponse {
    pub success: bool,
    pub data: Delivery,
}

/// Send one message through the queue and wait for its outcome.
pub async fn send_message(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    payload: Result<Json<SendRequest>, JsonRejection>,
) -> Result<Json<SendResponse>, ApiError> {
    let key = authenticate(&state.keys, &headers, "send")?;
    let Json(body) = payload?;

    if body.message.trim().is_empty() {
        return Err(ApiError::bad_request("Field \"message\" is required"));
    }
    let to = normalize_recipient(&body.number)
        .ok_or_else(|| ApiError::bad_request("Invalid recipient number"))?;

    info!(key_id = %key.id, to = %to, message_length = body.message.len(), "send_received");

    let handle = state.gateway.submit(
        &key.key,
        uri.path(),
        format!("send to {to}"),
        send_work(&state.transport, to.clone(), body.message),
    )?;

    match handle.await {
        Ok(delivery) => {
            info!(to = %to, message_id = %delivery.message_id, "send_delivered");
            Ok(Json(SendResponse {
                success: true,
                data: delivery,
            }))
        }
        Err(e) => {
            error!(to = %to, error = %e, "send_failed");
            Err(e.into())
        }
    }
}

// =============================================================================
// Bulk send
// =============================================================================

/// Bulk request body.
#[derive(Debug, Deserialize)]
pub struct BulkSendRequest {
    #[serde(default)]
    pub numbers: Vec<String>,
    #[serde(default)]
    pub message: String,
}

/// Outcome for one recipient of a bulk send.
#[derive(Debug, Serialize, Deserialize)]
pub struct RecipientResult {
    pub number: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Bulk response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct BulkSendResponse {
    pub success: bool,
    pub total: usize,
    pub sent: usize,
    pub failures: usize,
    pub results: Vec<RecipientResult>,
}

/// Send one message to many recipients, one queued task each.
pub async fn send_bulk(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    payload: Result<Json<BulkSendRequest>, JsonRejection>,
) -> Result<Json<BulkSendResponse>, ApiError> {
    let key = authenticate(&state.keys, &headers, "send")?;
    let Json(body) = payload?;

    if body.numbers.is_empty() {
        return Err(ApiError::bad_request("Field \"numbers\" must be a non-empty array"));
    }
    if body.message.trim().is_empty() {
        return Err(ApiError::bad_request("Field \"message\" is required"));
    }
    if body.numbers.len() > state.config.bulk_max_recipients {
        return Err(ApiError::bad_request(format!(
            "At most {} recipients per request",
            state.config.bulk_max_recipients
        )));
    }

    info!(key_id = %key.id, recipients = body.numbers.len(), "bulk_send_received");

    let mut valid = Vec::new();
    let mut rejected = Vec::new();
    for number in &body.numbers {
        match normalize_recipient(number) {
            Some(to) => valid.push((number.clone(), to)),
            None => rejected.push(number.clone()),
        }
    }

    // The bulk tier is charged on the requested fan-out, not on what validated.
    let items = valid
        .iter()
        .map(|(_, to)| {
            (
                format!("bulk send to {to}"),
                send_work(&state.transport, to.clone(), body.message.clone()),
            )
        })
        .collect();
    let handles = state
        .gateway
        .submit_batch(&key.key, uri.path(), body.numbers.len(), items)?;

    let outcomes = join_all(handles).await;

    let mut results: Vec<RecipientResult> = valid
        .into_iter()
        .zip(outcomes)
        .map(|((number, _), outcome)| match outcome {
            Ok(delivery) => RecipientResult {
                number,
                success: true,
                message_id: Some(delivery.message_id),
                error: None,
            },
            Err(e) => {
                warn!(number = %number, error = %e, "bulk_recipient_failed");
                RecipientResult {
                    number,
                    success: false,
                    message_id: None,
                    error: Some(e.to_string()),
                }
            }
        })
        .collect();

    results.extend(rejected.into_iter().map(|number| RecipientResult {
        number,
        success: false,
        message_id: None,
        error: Some("Invalid recipient number".to_string()),
    }));

    let sent = results.iter().filter(|r| r.success).count();
    let failures = results.len() - sent;
    info!(total = results.len(), sent = sent, failures = failures, "bulk_send_complete");

    Ok(Json(BulkSendResponse {
        success: true,
        total: results.len(),
        sent,
        failures,
        results,
    }))
}

// =============================================================================
// Queue administration
// =============================================================================

/// Queue statistics response.
#[derive(Serialize)]
pub struct QueueStatsResponse {
    pub success: bool,
    pub queue: QueueStats,
    pub retry_policy: RetryPolicy,
    pub pacing_ms: u64,
}

/// Queue depth and worker activity.
pub async fn queue_stats(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Json<QueueStatsResponse>, ApiError> {
    let key = authenticate(&state.keys, &headers, "status")?;
    state.gateway.admission().admit(&key.key, uri.path(), 0)?;

    let queue = state.gateway.queue();
    Ok(Json(QueueStatsResponse {
        success: true,
        queue: queue.stats(),
        retry_policy: queue.default_policy().clone(),
        pacing_ms: queue.pacing().as_millis() as u64,
    }))
}

/// Response to an administrative queue reset.
#[derive(Serialize)]
pub struct ClearResponse {
    pub success: bool,
    pub discarded: usize,
}

/// Drop every pending send (admin only).
pub async fn clear_queue(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Json<ClearResponse>, ApiError> {
    let key = authenticate(&state.keys, &headers, "admin")?;
    state.gateway.admission().admit(&key.key, uri.path(), 0)?;

    let discarded = state.gateway.queue().clear();
    warn!(key_id = %key.id, discarded = discarded, "queue_cleared_by_admin");

    Ok(Json(ClearResponse {
        success: true,
        discarded,
    }))
}

/// API key statistics response.
#[derive(Serialize)]
pub struct KeyStatsResponse {
    pub success: bool,
    pub keys: KeyStatistics,
}

/// Counts of known API keys (admin only).
pub async fn key_stats(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Json<KeyStatsResponse>, ApiError> {
    let key = authenticate(&state.keys, &headers, "admin")?;
    state.gateway.admission().admit(&key.key, uri.path(), 0)?;

    Ok(Json(KeyStatsResponse {
        success: true,
        keys: state.keys.statistics(),
    }))
}

/// Fallback for unknown routes.
pub async fn not_found(uri: Uri) -> ApiError {
    warn!(path = %uri.path(), "route_not_found");
    ApiError::new(StatusCode::NOT_FOUND, format!("No route for {}", uri.path()))
}
