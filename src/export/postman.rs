use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::models::{CompletedRequest, HeaderEntry, RequestBody};

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("cannot translate malformed URL {url:?}: {source}")]
    MalformedUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One collection item describing a captured exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostmanItem {
    pub name: String,
    pub request: PostmanRequest,
    pub response: PostmanResponse,
    pub timestamp: i64,
    #[serde(rename = "tabId")]
    pub tab_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostmanRequest {
    pub method: String,
    pub header: Vec<KeyValue>,
    pub url: PostmanUrl,
    pub body: Option<PostmanBody>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostmanUrl {
    pub raw: String,
    pub protocol: String,
    pub host: Vec<String>,
    /// Empty when the scheme's default port is used
    pub port: String,
    pub path: Vec<String>,
    pub query: Vec<KeyValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum PostmanBody {
    Urlencoded { urlencoded: Vec<KeyValue> },
    Raw { raw: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostmanResponse {
    pub status: String,
    pub code: u16,
    pub header: Vec<KeyValue>,
    /// Response bodies are not observable; always empty
    pub body: String,
}

/// Translate a completed request into a collection item
pub fn to_postman_item(record: &CompletedRequest) -> Result<PostmanItem, TranslateError> {
    let request = &record.request;
    let url = Url::parse(&request.url).map_err(|source| TranslateError::MalformedUrl {
        url: request.url.clone(),
        source,
    })?;

    Ok(PostmanItem {
        name: format!("{} {}", request.method, url.path()),
        request: PostmanRequest {
            method: request.method.clone(),
            header: key_values(request.request_headers.as_deref().unwrap_or_default()),
            url: PostmanUrl::from_url(&request.url, &url),
            body: request.body.as_ref().map(PostmanBody::from_body),
        },
        response: PostmanResponse {
            status: status_text(record.response.status_code, record.response.status_line.as_deref()),
            code: record.response.status_code,
            header: key_values(&record.response.headers),
            body: String::new(),
        },
        timestamp: request.captured_at,
        tab_id: request.tab_id,
    })
}

fn key_values(headers: &[HeaderEntry]) -> Vec<KeyValue> {
    headers
        .iter()
        .map(|h| KeyValue::new(h.name.clone(), h.value.clone()))
        .collect()
}

impl PostmanUrl {
    fn from_url(raw: &str, url: &Url) -> Self {
        Self {
            raw: raw.to_string(),
            protocol: url.scheme().to_string(),
            host: url
                .host_str()
                .map(|h| h.split('.').map(str::to_string).collect())
                .unwrap_or_default(),
            port: url.port().map(|p| p.to_string()).unwrap_or_default(),
            path: url
                .path()
                .split('/')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
            query: url
                .query_pairs()
                .map(|(k, v)| KeyValue::new(k.into_owned(), v.into_owned()))
                .collect(),
        }
    }
}

impl PostmanBody {
    /// Multi-valued form fields keep only their first value.
    fn from_body(body: &RequestBody) -> Self {
        match body {
            RequestBody::Form(fields) => PostmanBody::Urlencoded {
                urlencoded: fields
                    .iter()
                    .map(|field| {
                        KeyValue::new(
                            field.name.clone(),
                            field.values.first().cloned().unwrap_or_default(),
                        )
                    })
                    .collect(),
            },
            RequestBody::Raw(chunks) => {
                let bytes = chunks.concat();
                let raw = match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(err) => general_purpose::STANDARD.encode(err.as_bytes()),
                };
                PostmanBody::Raw { raw }
            }
        }
    }
}

/// Reason phrase from the provider's status line, else the canonical one
fn status_text(code: u16, status_line: Option<&str>) -> String {
    if let Some(reason) = status_line
        .and_then(|line| line.trim().splitn(3, ' ').nth(2))
        .map(str::trim)
        .filter(|reason| !reason.is_empty())
    {
        return reason.to_string();
    }
    http::StatusCode::from_u16(code)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or_default()
        .to_string()
}
