//! Provider lifecycle events
//!
//! Wire shapes of the messages produced by the browser's network-observation
//! API. Every message carries a `type` tag and is keyed by the provider's
//! ephemeral `requestId`.

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::request::{FormField, HeaderEntry, PendingRequest, RequestBody, ResponseMeta};
use crate::models::settings::MonitorSettings;

/// Tab id the provider reports for requests not issued by a page
pub const TAB_ID_NONE: i64 = -1;

fn default_tab_id() -> i64 {
    TAB_ID_NONE
}

/// A single message from the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProviderMessage {
    BeforeRequest(BeforeRequestEvent),
    BeforeSendHeaders(BeforeSendHeadersEvent),
    Completed(CompletedEvent),
    ErrorOccurred(ErrorOccurredEvent),
    UpdateSettings { settings: MonitorSettings },
}

/// Initiation of a request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeforeRequestEvent {
    pub request_id: String,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub request_body: Option<RequestBodyDetails>,
    #[serde(default = "default_tab_id")]
    pub tab_id: i64,
    #[serde(default)]
    pub initiator: Option<String>,
    /// Provider timestamp in milliseconds since epoch
    #[serde(default)]
    pub time_stamp: Option<f64>,
}

/// Body descriptor attached to the initiation event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBodyDetails {
    /// Form fields mapped to one value or a list of values
    #[serde(default)]
    pub form_data: Option<Map<String, Value>>,
    #[serde(default)]
    pub raw: Option<Vec<UploadChunk>>,
    /// Set by the provider when the body could not be read
    #[serde(default)]
    pub error: Option<String>,
}

/// One element of a raw upload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadChunk {
    /// Chunk bytes, base64 encoded
    #[serde(default)]
    pub bytes: Option<String>,
    /// Path of a file-backed chunk; its contents are not observable
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpHeaderDetails {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub binary_value: Option<Vec<u8>>,
}

/// Request headers about to be sent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeforeSendHeadersEvent {
    pub request_id: String,
    #[serde(default)]
    pub request_headers: Vec<HttpHeaderDetails>,
}

/// Terminal success event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedEvent {
    pub request_id: String,
    pub status_code: u16,
    #[serde(default)]
    pub status_line: Option<String>,
    #[serde(default)]
    pub response_headers: Vec<HttpHeaderDetails>,
}

/// Terminal failure event (aborted, blocked, DNS failure, ...)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorOccurredEvent {
    pub request_id: String,
    #[serde(default)]
    pub error: String,
}

impl ProviderMessage {
    /// Request id the message refers to, if it is a lifecycle event
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ProviderMessage::BeforeRequest(e) => Some(&e.request_id),
            ProviderMessage::BeforeSendHeaders(e) => Some(&e.request_id),
            ProviderMessage::Completed(e) => Some(&e.request_id),
            ProviderMessage::ErrorOccurred(e) => Some(&e.request_id),
            ProviderMessage::UpdateSettings { .. } => None,
        }
    }
}

impl BeforeRequestEvent {
    /// Build the correlator record; `now_ms` is used when the provider sent
    /// no timestamp.
    pub fn into_pending(self, now_ms: i64) -> PendingRequest {
        let captured_at = self
            .time_stamp
            .filter(|ts| ts.is_finite() && *ts > 0.0)
            .map(|ts| ts as i64)
            .unwrap_or(now_ms);
        PendingRequest {
            request_id: self.request_id,
            method: self.method,
            url: self.url,
            body: self.request_body.and_then(RequestBodyDetails::into_body),
            captured_at,
            tab_id: self.tab_id,
            initiator: self.initiator,
            request_headers: None,
        }
    }
}

impl RequestBodyDetails {
    pub fn into_body(self) -> Option<RequestBody> {
        if let Some(form) = self.form_data {
            let fields = form
                .into_iter()
                .map(|(name, value)| FormField {
                    name,
                    values: form_values(value),
                })
                .collect();
            return Some(RequestBody::Form(fields));
        }
        if let Some(raw) = self.raw {
            let chunks = raw
                .into_iter()
                .filter_map(|chunk| {
                    let encoded = chunk.bytes?;
                    match general_purpose::STANDARD.decode(encoded.as_bytes()) {
                        Ok(bytes) => Some(bytes),
                        Err(err) => {
                            tracing::debug!("Skipping undecodable upload chunk: {err}");
                            None
                        }
                    }
                })
                .collect();
            return Some(RequestBody::Raw(chunks));
        }
        if let Some(err) = self.error {
            tracing::debug!("Provider could not read request body: {err}");
        }
        None
    }
}

fn form_values(value: Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.into_iter().map(scalar_to_string).collect(),
        other => vec![scalar_to_string(other)],
    }
}

fn scalar_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl From<HttpHeaderDetails> for HeaderEntry {
    fn from(header: HttpHeaderDetails) -> Self {
        let value = match (header.value, header.binary_value) {
            (Some(value), _) => value,
            (None, Some(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            (None, None) => String::new(),
        };
        HeaderEntry {
            name: header.name,
            value,
        }
    }
}

pub fn headers_from_details(headers: Vec<HttpHeaderDetails>) -> Vec<HeaderEntry> {
    headers.into_iter().map(HeaderEntry::from).collect()
}

impl CompletedEvent {
    pub fn response_meta(self) -> ResponseMeta {
        ResponseMeta {
            status_code: self.status_code,
            status_line: self.status_line,
            headers: headers_from_details(self.response_headers),
        }
    }
}
