//! Seam to the external messaging transport.
//!
//! The transport is a browser-automation sidecar that can only handle one
//! send at a time and may hang or fail. The gateway only ever calls it
//! from the sequential queue.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Acknowledgement returned by the transport for one sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub message_id: String,
    pub to: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Opaque outbound sender.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, recipient: &str, payload: &str) -> Result<Delivery>;
}

#[derive(Serialize)]
struct SendRequest<'a> {
    to: &'a str,
    message: &'a str,
}

/// Transport reached over HTTP (the automation sidecar).
///
/// No client timeout is set: attempts are bounded by the retry executor.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: String) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(1)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, recipient: &str, payload: &str) -> Result<Delivery> {
        debug!(to = %recipient, payload_length = payload.len(), "transport_send_starting");

        let response = self
            .client
            .post(&self.url)
            .json(&SendRequest {
                to: recipient,
                message: payload,
            })
            .send()
            .await
            .context("Failed to reach transport")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("transport returned {status}: {body}");
        }

        let delivery = response
            .json::<Delivery>()
            .await
            .context("Invalid transport response")?;

        debug!(to = %recipient, message_id = %delivery.message_id, "transport_send_complete");

        Ok(delivery)
    }
}
