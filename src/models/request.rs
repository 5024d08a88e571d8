//! Captured request model
//!
//! A single browser request as assembled from the provider's lifecycle events.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a tracked request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    /// Initiation seen, headers not yet attached
    Initiated,
    /// Request headers merged into the record
    HeadersAttached,
}

/// A single header as delivered by the provider, order preserved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

impl HeaderEntry {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One form field; browsers deliver every field as a list of values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    pub values: Vec<String>,
}

/// Request body descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestBody {
    /// Form-encoded body, fields in submission order
    Form(Vec<FormField>),
    /// Raw upload, one entry per byte chunk
    Raw(Vec<Vec<u8>>),
}

/// A request between its initiation event and a terminal event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    /// Ephemeral provider identifier for this exchange
    pub request_id: String,
    /// HTTP method exactly as delivered by the provider
    pub method: String,
    /// Absolute request URL
    pub url: String,
    /// Request body (if any)
    pub body: Option<RequestBody>,
    /// Capture time in milliseconds since epoch
    pub captured_at: i64,
    /// Originating tab, `-1` when not issued from a page
    pub tab_id: i64,
    /// Declared initiator origin
    pub initiator: Option<String>,
    /// Request headers, attached by the second lifecycle event
    pub request_headers: Option<Vec<HeaderEntry>>,
}

impl PendingRequest {
    pub fn state(&self) -> RequestState {
        if self.request_headers.is_some() {
            RequestState::HeadersAttached
        } else {
            RequestState::Initiated
        }
    }

    /// Age of the record relative to `now_ms`
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.captured_at).max(0)
    }

    pub fn complete(self, response: ResponseMeta) -> CompletedRequest {
        CompletedRequest {
            request: self,
            response,
        }
    }
}

/// Response metadata observable from the request's completion event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub status_code: u16,
    /// Full status line, e.g. `HTTP/1.1 200 OK`
    pub status_line: Option<String>,
    pub headers: Vec<HeaderEntry>,
}

/// A request that reached its completion event; immutable from here on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedRequest {
    pub request: PendingRequest,
    pub response: ResponseMeta,
}
