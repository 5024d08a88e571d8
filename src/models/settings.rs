//! Monitor settings
//!
//! The operator-facing settings snapshot and its compiled, immutable form
//! used by the capture pipeline.

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Path fragment identifying the relay's own ingestion endpoints
pub const DEFAULT_FEEDBACK_ENDPOINT: &str = "/webhook";

/// Settings as delivered by the settings surface (full replacement on update)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorSettings {
    /// Destination for relayed requests
    pub webhook_url: String,
    /// Comma-separated domains, `*.` prefix for wildcard entries
    pub domain_scope: String,
    /// Exact HTTP method to capture, empty for any
    pub method_filter: String,
    /// Regex applied to the URL path, empty for any
    pub path_regex: String,
    pub is_enabled: bool,
    /// Override for the feedback endpoint fragment; empty disables the check
    pub feedback_endpoint: Option<String>,
    /// Origin the monitoring process itself issues requests from
    pub self_origin: Option<String>,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid webhook URL {url:?}: {source}")]
    InvalidWebhookUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("webhook URL {0:?} must use http or https")]
    UnsupportedWebhookScheme(String),
    #[error("invalid path regex {pattern:?}: {source}")]
    InvalidPathRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

impl MonitorSettings {
    /// Validate settings before they are accepted from an operator.
    ///
    /// The pipeline never calls this: it degrades an invalid regex to "no
    /// path filter" instead of refusing the update.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let webhook = self.webhook_url.trim();
        if self.is_enabled && !webhook.is_empty() {
            let parsed =
                url::Url::parse(webhook).map_err(|source| SettingsError::InvalidWebhookUrl {
                    url: webhook.to_string(),
                    source,
                })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(SettingsError::UnsupportedWebhookScheme(webhook.to_string()));
            }
        }
        let pattern = self.path_regex.trim();
        if !pattern.is_empty() {
            Regex::new(pattern).map_err(|source| SettingsError::InvalidPathRegex {
                pattern: pattern.to_string(),
                source,
            })?;
        }
        Ok(())
    }

    /// Compile into the snapshot consumed by every pipeline stage
    pub fn compile(&self) -> CaptureConfig {
        let pattern = self.path_regex.trim();
        let path_pattern = if pattern.is_empty() {
            None
        } else {
            match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(err) => {
                    tracing::warn!(
                        "Ignoring invalid path regex {:?}, capturing all paths: {}",
                        pattern,
                        err
                    );
                    None
                }
            }
        };

        let method = self.method_filter.trim();
        CaptureConfig {
            enabled: self.is_enabled,
            webhook_url: self.webhook_url.trim().to_string(),
            domains: parse_domain_scope(&self.domain_scope),
            method_filter: (!method.is_empty()).then(|| method.to_string()),
            path_pattern,
            feedback_endpoint: self
                .feedback_endpoint
                .as_deref()
                .unwrap_or(DEFAULT_FEEDBACK_ENDPOINT)
                .trim()
                .to_ascii_lowercase(),
            self_origin: self
                .self_origin
                .as_deref()
                .map(|o| o.trim().trim_end_matches('/').to_string())
                .filter(|o| !o.is_empty()),
        }
    }
}

/// Split the comma-separated scope list, dropping blank entries
pub fn parse_domain_scope(scope: &str) -> Vec<String> {
    scope
        .split(',')
        .map(|d| d.trim().to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .collect()
}

/// Immutable capture configuration; replaced wholesale on every update
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub enabled: bool,
    pub webhook_url: String,
    pub domains: Vec<String>,
    pub method_filter: Option<String>,
    pub path_pattern: Option<Regex>,
    /// Lowercased feedback endpoint fragment
    pub feedback_endpoint: String,
    pub self_origin: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        MonitorSettings::default().compile()
    }
}

impl CaptureConfig {
    /// Monitoring needs both the toggle and a destination
    pub fn is_active(&self) -> bool {
        self.enabled && !self.webhook_url.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_camel_case_with_defaults() {
        let settings: MonitorSettings = serde_json::from_str(
            r#"{"webhookUrl":"https://hook.test/in","domainScope":"a.com, *.b.com","isEnabled":true}"#,
        )
        .unwrap();
        assert_eq!(settings.webhook_url, "https://hook.test/in");
        assert!(settings.method_filter.is_empty());
        assert!(settings.feedback_endpoint.is_none());

        let config = settings.compile();
        assert!(config.is_active());
        assert_eq!(config.domains, vec!["a.com", "*.b.com"]);
        assert_eq!(config.feedback_endpoint, DEFAULT_FEEDBACK_ENDPOINT);
    }

    #[test]
    fn blank_scope_entries_are_dropped() {
        assert_eq!(parse_domain_scope(" , Example.COM ,,"), vec!["example.com"]);
        assert!(parse_domain_scope("").is_empty());
    }

    #[test]
    fn invalid_regex_compiles_to_no_path_filter() {
        let settings = MonitorSettings {
            path_regex: "^/api/(".into(),
            ..Default::default()
        };
        assert!(settings.compile().path_pattern.is_none());
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidPathRegex { .. })
        ));
    }

    #[test]
    fn validate_rejects_bad_webhook_only_when_enabled() {
        let mut settings = MonitorSettings {
            webhook_url: "not a url".into(),
            is_enabled: false,
            ..Default::default()
        };
        assert!(settings.validate().is_ok());

        settings.is_enabled = true;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidWebhookUrl { .. })
        ));

        settings.webhook_url = "ftp://hook.test/in".into();
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::UnsupportedWebhookScheme(_))
        ));
    }

    #[test]
    fn monitoring_requires_a_webhook() {
        let config = MonitorSettings {
            is_enabled: true,
            ..Default::default()
        }
        .compile();
        assert!(!config.is_active());
    }

    #[test]
    fn method_filter_is_trimmed_but_case_is_kept() {
        let config = MonitorSettings {
            method_filter: " post ".into(),
            ..Default::default()
        }
        .compile();
        assert_eq!(config.method_filter.as_deref(), Some("post"));
    }
}
