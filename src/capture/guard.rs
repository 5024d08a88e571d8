//! Self-traffic guard
//!
//! Keeps the relay from capturing its own deliveries and requests issued by
//! the monitoring process, which would otherwise loop back into the webhook.

use url::Url;

use crate::models::{CaptureConfig, PendingRequest, TAB_ID_NONE};

const EXTENSION_ORIGIN_PREFIXES: &[&str] = &[
    "chrome-extension://",
    "moz-extension://",
    "safari-web-extension://",
    "extension://",
];

/// The parts of a request the guard looks at
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub url: &'a str,
    pub tab_id: i64,
    pub initiator: Option<&'a str>,
}

impl<'a> From<&'a PendingRequest> for Candidate<'a> {
    fn from(req: &'a PendingRequest) -> Self {
        Self {
            url: &req.url,
            tab_id: req.tab_id,
            initiator: req.initiator.as_deref(),
        }
    }
}

/// True when the candidate must never be relayed
pub fn should_ignore(candidate: &Candidate<'_>, config: &CaptureConfig) -> bool {
    if candidate.tab_id == TAB_ID_NONE {
        return true;
    }
    if candidate
        .initiator
        .is_some_and(|origin| is_own_origin(origin, config))
    {
        return true;
    }
    if hits_feedback_endpoint(candidate.url, &config.feedback_endpoint) {
        return true;
    }
    targets_webhook(candidate.url, config)
}

fn normalize(url: &str) -> &str {
    url.trim().trim_end_matches('/')
}

fn is_own_origin(origin: &str, config: &CaptureConfig) -> bool {
    let origin = normalize(origin);
    let lowered = origin.to_ascii_lowercase();
    if EXTENSION_ORIGIN_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
    {
        return true;
    }
    config
        .self_origin
        .as_deref()
        .is_some_and(|own| own.eq_ignore_ascii_case(origin))
}

fn hits_feedback_endpoint(url: &str, endpoint: &str) -> bool {
    if endpoint.is_empty() {
        return false;
    }
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_ascii_lowercase(),
        Err(_) => url.to_ascii_lowercase(),
    };
    path.contains(endpoint)
}

fn targets_webhook(url: &str, config: &CaptureConfig) -> bool {
    let webhook = normalize(&config.webhook_url);
    if webhook.is_empty() {
        return false;
    }
    let candidate = normalize(url);

    let (candidate_url, webhook_url) = match (Url::parse(candidate), Url::parse(webhook)) {
        (Ok(c), Ok(w)) => (c, w),
        _ => return candidate.contains(webhook),
    };

    if candidate == webhook || is_within(candidate, webhook) {
        return true;
    }

    if candidate_url.origin() != webhook_url.origin() {
        return false;
    }
    let candidate_path = normalize(candidate_url.path());
    let webhook_path = normalize(webhook_url.path());
    if is_within(candidate_path, webhook_path) || is_within(webhook_path, candidate_path) {
        return true;
    }
    let base = base_path(webhook_path, &config.feedback_endpoint);
    !base.is_empty() && is_within(candidate_path, base)
}

/// `path` equals `ancestor` or sits below it. Both are slash-trimmed, so the
/// root path is the empty string.
fn is_within(path: &str, ancestor: &str) -> bool {
    path == ancestor
        || path
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// The webhook path cut at its feedback-endpoint segment, or at its last
/// segment when it has none.
fn base_path<'a>(webhook_path: &'a str, endpoint: &str) -> &'a str {
    if !endpoint.is_empty() {
        if let Some(pos) = webhook_path.to_ascii_lowercase().find(endpoint) {
            return normalize(&webhook_path[..pos]);
        }
    }
    match webhook_path.rfind('/') {
        Some(pos) => &webhook_path[..pos],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MonitorSettings;

    fn config(webhook: &str) -> CaptureConfig {
        MonitorSettings {
            webhook_url: webhook.into(),
            is_enabled: true,
            ..Default::default()
        }
        .compile()
    }

    fn page(url: &str) -> Candidate<'_> {
        Candidate {
            url,
            tab_id: 12,
            initiator: Some("https://app.example.com"),
        }
    }

    #[test]
    fn webhook_descendants_are_ignored() {
        let cfg = config("https://relay.test/ingest");
        assert!(should_ignore(&page("https://relay.test/ingest/extra"), &cfg));
        assert!(should_ignore(&page("https://relay.test/ingest/"), &cfg));
        assert!(should_ignore(&page("https://relay.test/ingest?x=1"), &cfg));
        assert!(!should_ignore(&page("https://api.example.com/ingest"), &cfg));
    }

    #[test]
    fn same_origin_ancestors_and_siblings_under_base_are_ignored() {
        let cfg = config("https://relay.test/hooks/v1/catch/123");
        assert!(should_ignore(&page("https://relay.test/hooks/v1"), &cfg));
        assert!(should_ignore(&page("https://relay.test/hooks/v1/catch/456"), &cfg));
        assert!(!should_ignore(&page("https://relay.test/docs"), &cfg));
        assert!(!should_ignore(&page("http://relay.test/docs"), &cfg));
    }

    #[test]
    fn base_path_is_cut_at_feedback_segment() {
        assert_eq!(base_path("/api/webhook/abc", "/webhook"), "/api");
        assert_eq!(base_path("/hooks/v1/catch", "/webhook"), "/hooks/v1");
        assert_eq!(base_path("/ingest", "/webhook"), "");
        assert_eq!(base_path("/api/WebHook/abc", "/webhook"), "/api");
    }

    #[test]
    fn feedback_endpoint_matches_case_insensitively() {
        let cfg = config("https://relay.test/in");
        assert!(should_ignore(&page("https://other.test/api/WebHook/abc"), &cfg));

        let disabled = MonitorSettings {
            webhook_url: "https://relay.test/in".into(),
            feedback_endpoint: Some(String::new()),
            ..Default::default()
        }
        .compile();
        assert!(!should_ignore(&page("https://other.test/api/webhook/abc"), &disabled));
    }

    #[test]
    fn background_and_extension_traffic_is_ignored() {
        let cfg = config("https://relay.test/in");
        let background = Candidate {
            url: "https://api.example.com/x",
            tab_id: TAB_ID_NONE,
            initiator: None,
        };
        assert!(should_ignore(&background, &cfg));

        let extension = Candidate {
            url: "https://api.example.com/x",
            tab_id: 4,
            initiator: Some("chrome-extension://abcdefghijklmnop"),
        };
        assert!(should_ignore(&extension, &cfg));
    }

    #[test]
    fn configured_self_origin_is_ignored() {
        let cfg = MonitorSettings {
            webhook_url: "https://relay.test/in".into(),
            self_origin: Some("https://monitor.local/".into()),
            ..Default::default()
        }
        .compile();
        let own = Candidate {
            url: "https://api.example.com/x",
            tab_id: 4,
            initiator: Some("https://MONITOR.local"),
        };
        assert!(should_ignore(&own, &cfg));
    }

    #[test]
    fn unparsable_urls_fall_back_to_substring_match() {
        let cfg = config("relay.test/ingest");
        assert!(should_ignore(&page("see relay.test/ingest/x"), &cfg));
        assert!(!should_ignore(&page("https://api.example.com/x"), &cfg));
    }

    #[test]
    fn empty_webhook_only_applies_remaining_rules() {
        let cfg = config("");
        assert!(!should_ignore(&page("https://api.example.com/x"), &cfg));
    }
}
