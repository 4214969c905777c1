//! HTTP surface of the gateway.
//!
//! This module provides:
//! - API-key authentication against the key registry
//! - Send, bulk send and queue administration handlers
//!
//! Every send is admitted by the gateway before it is queued; the handler
//! then waits for the queued task to settle and reports its outcome.

pub mod auth;
pub mod handlers;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use auth::{authenticate, client_ip, API_KEY_HEADER};
pub use handlers::{
    clear_queue, health, key_stats, normalize_recipient, not_found, queue_stats, send_bulk,
    send_message, ApiError, AppState, BulkSendRequest, BulkSendResponse, ErrorResponse,
    HealthResponse, RecipientResult, SendRequest, SendResponse,
};

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/send", post(send_message))
        .route("/send/bulk", post(send_bulk))
        .route("/queue/stats", get(queue_stats))
        .route("/queue", delete(clear_queue))
        .route("/keys/stats", get(key_stats))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limit::{ApiKeyRegistry, QuotaConfig};
    use crate::transport::{Delivery, Transport};
    use crate::{Config, Gateway};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};
    use tower::ServiceExt;

    /// Records every recipient it is asked to reach; refuses one number.
    #[derive(Default)]
    struct FakeTransport {
        sent: Mutex<Vec<String>>,
        refuse: Option<String>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(&self, recipient: &str, _payload: &str) -> anyhow::Result<Delivery> {
            if self.refuse.as_deref() == Some(recipient) {
                anyhow::bail!("sidecar refused {recipient}");
            }
            self.sent.lock().unwrap().push(recipient.to_string());
            Ok(Delivery {
                message_id: format!("msg-{recipient}"),
                to: recipient.to_string(),
                timestamp: None,
            })
        }
    }

    fn test_config() -> Config {
        Config {
            rate_limit: QuotaConfig::new(2, 60_000),
            bulk_rate_limit: QuotaConfig::new(1, 60_000),
            bulk_recipient_threshold: 2,
            bulk_max_recipients: 5,
            task_max_attempts: 2,
            task_timeout_ms: 1_000,
            task_retry_delay_ms: 10,
            queue_pacing_ms: 10,
            ..Config::default()
        }
    }

    fn app(config: Config, transport: Arc<FakeTransport>) -> Router {
        let keys = Arc::new(
            ApiKeyRegistry::from_json(
                r#"[
                    {"id": "sender", "key": "sk_sender", "active": true, "permissions": ["send", "status"]},
                    {"id": "roomy", "key": "sk_roomy", "active": true, "permissions": ["send"],
                     "rateLimit": {"maxRequests": 50, "windowMs": 60000}}
                ]"#,
            )
            .unwrap()
            .with_env_key("sk_admin", QuotaConfig::new(100, 60_000)),
        );
        let gateway = Gateway::from_config(&config, keys.clone());
        router(AppState::new(config, gateway, keys, transport))
    }

    fn request(method: Method, uri: &str, key: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, body)
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_is_public_and_unlimited() {
        let app = app(test_config(), Arc::new(FakeTransport::default()));

        for _ in 0..5 {
            let (status, _, body) = call(&app, request(Method::GET, "/health", None, None)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "ok");
            assert_eq!(body["queue"]["queue_size"], 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_valid_key() {
        let app = app(test_config(), Arc::new(FakeTransport::default()));
        let body = json!({"number": "22912345678", "message": "hi"});

        let (status, _, _) = call(&app, request(Method::POST, "/send", None, Some(body.clone()))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, body) =
            call(&app, request(Method::POST, "/send", Some("sk_wrong"), Some(body))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["success"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_delivers_through_queue() {
        let transport = Arc::new(FakeTransport::default());
        let app = app(test_config(), transport.clone());

        let (status, _, body) = call(
            &app,
            request(
                Method::POST,
                "/send",
                Some("sk_sender"),
                Some(json!({"number": "+229 12-34-56-78", "message": "hello"})),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["message_id"], "msg-22912345678");
        assert_eq!(*transport.sent.lock().unwrap(), vec!["22912345678".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_send_is_rejected_without_charge() {
        let app = app(test_config(), Arc::new(FakeTransport::default()));

        for body in [json!({"number": "123", "message": "hi"}), json!({"number": "22912345678"})] {
            let (status, _, _) =
                call(&app, request(Method::POST, "/send", Some("sk_sender"), Some(body))).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }

        // both general-tier slots are still available
        for _ in 0..2 {
            let (status, _, _) = call(
                &app,
                request(
                    Method::POST,
                    "/send",
                    Some("sk_sender"),
                    Some(json!({"number": "22912345678", "message": "hi"})),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_body_gets_json_error() {
        let app = app(test_config(), Arc::new(FakeTransport::default()));
        let raw = |content_type: Option<&str>, key: Option<&str>, body: &'static str| {
            let mut builder = Request::builder().method(Method::POST).uri("/send");
            if let Some(content_type) = content_type {
                builder = builder.header(header::CONTENT_TYPE, content_type);
            }
            if let Some(key) = key {
                builder = builder.header(API_KEY_HEADER, key);
            }
            builder.body(Body::from(body)).unwrap()
        };

        let (status, _, body) =
            call(&app, raw(Some("application/json"), Some("sk_sender"), "{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].is_string());

        let (status, _, body) = call(&app, raw(None, Some("sk_sender"), r#"{"number": "1"}"#)).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(body["success"], false);

        let (status, _, body) =
            call(&app, raw(Some("application/json"), Some("sk_sender"), r#"{"number": 5}"#)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["success"], false);

        // authentication is checked before the body
        let (status, _, _) = call(&app, raw(Some("application/json"), None, "{not json")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_general_tier_exhaustion_returns_retry_after() {
        let transport = Arc::new(FakeTransport::default());
        let app = app(test_config(), transport.clone());
        let send = || {
            request(
                Method::POST,
                "/send",
                Some("sk_sender"),
                Some(json!({"number": "22912345678", "message": "hi"})),
            )
        };

        assert_eq!(call(&app, send()).await.0, StatusCode::OK);
        assert_eq!(call(&app, send()).await.0, StatusCode::OK);

        let (status, headers, body) = call(&app, send()).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["success"], false);
        assert!(body["retry_after_ms"].as_u64().unwrap() <= 60_000);
        let retry_after: u64 = headers[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
        assert!(retry_after > 0 && retry_after <= 60);

        // the denied send never reached the transport
        assert_eq!(transport.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_key_quota_overrides_default() {
        let app = app(test_config(), Arc::new(FakeTransport::default()));

        for _ in 0..4 {
            let (status, _, _) = call(
                &app,
                request(
                    Method::POST,
                    "/send",
                    Some("sk_roomy"),
                    Some(json!({"number": "22912345678", "message": "hi"})),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_reports_per_recipient_outcomes() {
        let transport = Arc::new(FakeTransport {
            refuse: Some("22987654321".to_string()),
            ..FakeTransport::default()
        });
        let app = app(test_config(), transport.clone());

        let (status, _, body) = call(
            &app,
            request(
                Method::POST,
                "/send/bulk",
                Some("sk_roomy"),
                Some(json!({
                    "numbers": ["22912345678", "not-a-number", "22987654321"],
                    "message": "hello all"
                })),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 3);
        assert_eq!(body["sent"], 1);
        assert_eq!(body["failures"], 2);

        let results = body["results"].as_array().unwrap();
        assert_eq!(results[0]["number"], "22912345678");
        assert_eq!(results[0]["success"], true);
        assert_eq!(results[1]["number"], "22987654321");
        assert_eq!(results[1]["success"], false);
        assert_eq!(results[2]["number"], "not-a-number");
        assert_eq!(results[2]["error"], "Invalid recipient number");

        assert_eq!(*transport.sent.lock().unwrap(), vec!["22912345678".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_tier_limits_large_fan_out() {
        let app = app(test_config(), Arc::new(FakeTransport::default()));
        let bulk = |numbers: Vec<&str>| {
            request(
                Method::POST,
                "/send/bulk",
                Some("sk_roomy"),
                Some(json!({"numbers": numbers, "message": "hi"})),
            )
        };
        let large = vec!["22900000001", "22900000002", "22900000003"];

        assert_eq!(call(&app, bulk(large.clone())).await.0, StatusCode::OK);

        let (status, headers, _) = call(&app, bulk(large)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(headers.contains_key(header::RETRY_AFTER));

        // at or below the threshold only the general tier applies
        let (status, _, body) = call(&app, bulk(vec!["22900000001", "22900000002"])).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sent"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_rejects_too_many_recipients() {
        let app = app(test_config(), Arc::new(FakeTransport::default()));
        let numbers: Vec<String> = (0..6).map(|i| format!("2290000000{i}")).collect();

        let (status, _, body) = call(
            &app,
            request(
                Method::POST,
                "/send/bulk",
                Some("sk_roomy"),
                Some(json!({"numbers": numbers, "message": "hi"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("At most 5"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_stats_reports_policy() {
        let app = app(test_config(), Arc::new(FakeTransport::default()));

        let (status, _, body) =
            call(&app, request(Method::GET, "/queue/stats", Some("sk_sender"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queue"]["queue_size"], 0);
        assert_eq!(body["queue"]["is_processing"], false);
        assert_eq!(body["retry_policy"]["max_attempts"], 2);
        assert_eq!(body["retry_policy"]["per_attempt_timeout_ms"], 1_000);
        assert_eq!(body["pacing_ms"], 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admin_routes_require_admin() {
        let app = app(test_config(), Arc::new(FakeTransport::default()));

        let (status, _, _) = call(&app, request(Method::DELETE, "/queue", Some("sk_sender"), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _, body) = call(&app, request(Method::DELETE, "/queue", Some("sk_admin"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["discarded"], 0);

        let (status, _, body) =
            call(&app, request(Method::GET, "/keys/stats", Some("sk_admin"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["keys"]["total"], 3);
        assert_eq!(body["keys"]["active"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_route_is_json_404() {
        let app = app(test_config(), Arc::new(FakeTransport::default()));

        let (status, _, body) = call(&app, request(Method::GET, "/nope", None, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }
}
