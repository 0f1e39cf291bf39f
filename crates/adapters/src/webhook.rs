use std::time::Duration;

use agentmesh_core::{DeliveryError, UniversalMessage};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use tracing::{debug, warn};

use crate::connection::{ConnectionState, LazyConnection};
use crate::{Ack, Adapter, DeliveryResult, MessageStream};

/// Delivers envelopes by HTTP POST. The destination is the full URL, so a
/// target reads `webhook:https://host/path`.
pub struct WebhookAdapter {
    client: LazyConnection<Client>,
    timeout: Duration,
}

impl WebhookAdapter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: LazyConnection::new(),
            timeout,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    async fn client(&self) -> DeliveryResult<&Client> {
        let timeout = self.timeout;
        self.client
            .get_or_connect(|| async move {
                Client::builder()
                    .timeout(timeout)
                    .build()
                    .map_err(|e| DeliveryError::Connection(format!("Failed to build HTTP client: {}", e)))
            })
            .await
    }
}

fn parse_destination(destination: &str) -> DeliveryResult<Url> {
    let url = Url::parse(destination)
        .map_err(|e| DeliveryError::DestinationNotFound(format!("{}: {}", destination, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(DeliveryError::DestinationNotFound(format!(
            "{}: unsupported URL scheme '{}'",
            destination, other
        ))),
    }
}

fn classify_status(status: StatusCode, destination: &str, body: &str) -> DeliveryError {
    let detail = if body.is_empty() {
        format!("{} returned HTTP {}", destination, status)
    } else {
        format!("{} returned HTTP {}: {}", destination, status, body)
    };
    if status == StatusCode::NOT_FOUND {
        DeliveryError::DestinationNotFound(detail)
    } else if status.is_client_error() {
        DeliveryError::Rejected(detail)
    } else {
        DeliveryError::Connection(detail)
    }
}

#[async_trait]
impl Adapter for WebhookAdapter {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, message: &UniversalMessage, destination: &str) -> DeliveryResult<Ack> {
        let url = parse_destination(destination)?;
        let body = message
            .to_bytes()
            .map_err(|e| DeliveryError::Rejected(e.to_string()))?;
        let client = self.client().await?;

        let resp = client
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-Message-Id", message.id())
            .header("X-Tenant-Id", message.tenant_id())
            .body(body)
            .send()
            .await
            .map_err(|e| DeliveryError::Connection(format!("Webhook request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let err = classify_status(status, destination, &text);
            warn!(message_id = %message.id(), url = %destination, status = status.as_u16(), "Webhook delivery failed");
            return Err(err);
        }

        debug!(message_id = %message.id(), url = %destination, status = status.as_u16(), "Webhook delivered");
        Ok(Ack::new(message, destination).with_receipt(status.as_u16().to_string()))
    }

    async fn consume(&self, subscription: &str) -> DeliveryResult<MessageStream> {
        Err(DeliveryError::Unsupported(format!(
            "webhook adapter cannot consume '{}'",
            subscription
        )))
    }
}
