//! Webhook delivery
//!
//! Posts translated requests to the operator's webhook. Delivery is
//! at-most-once: the signature is already in the ledger when a send starts,
//! so failures are logged and never retried.

use chrono::{SecondsFormat, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::export::PostmanItem;

/// Identifier placed in the envelope's `source` field
pub const RELAY_SOURCE: &str = "ReqMapper";
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(15);

fn user_agent() -> String {
    format!("ReqMapper-Relay/{}", env!("CARGO_PKG_VERSION"))
}

/// JSON document posted to the webhook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub source: String,
    /// RFC 3339 send time
    pub timestamp: String,
    pub request: PostmanItem,
}

impl RelayEnvelope {
    pub fn new(request: PostmanItem) -> Self {
        Self {
            source: RELAY_SOURCE.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            request,
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("webhook request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("webhook responded with {status} {reason}")]
    Status { status: u16, reason: String },
}

/// Destination for translated requests
pub trait Relay: Send + Sync {
    fn deliver<'a>(
        &'a self,
        webhook_url: &'a str,
        envelope: &'a RelayEnvelope,
    ) -> BoxFuture<'a, Result<(), RelayError>>;
}

/// Relay that POSTs the envelope as JSON
pub struct WebhookRelay {
    client: reqwest::Client,
}

impl WebhookRelay {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent())
            // Keep deliveries out of any system proxy the monitor may be observing
            .no_proxy()
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self { client })
    }

    async fn post(&self, webhook_url: &str, envelope: &RelayEnvelope) -> Result<(), RelayError> {
        let response = self.client.post(webhook_url).json(envelope).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(RelayError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or_default().to_string(),
            })
        }
    }
}

impl Relay for WebhookRelay {
    fn deliver<'a>(
        &'a self,
        webhook_url: &'a str,
        envelope: &'a RelayEnvelope,
    ) -> BoxFuture<'a, Result<(), RelayError>> {
        Box::pin(self.post(webhook_url, envelope))
    }
}
