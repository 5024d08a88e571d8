//! Scope filtering
//!
//! Decides whether a request falls inside the operator's chosen domains,
//! method and path. Every check fails closed on unparsable URLs.

use url::Url;

use crate::models::CaptureConfig;

/// Domain allow-list check. An empty list admits every URL.
pub fn in_scope(url: &str, config: &CaptureConfig) -> bool {
    if config.domains.is_empty() {
        return true;
    }
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let Some(hostname) = parsed.host_str() else {
        return false;
    };
    let hostname = hostname.to_ascii_lowercase();
    config
        .domains
        .iter()
        .any(|domain| host_matches(&hostname, domain))
}

fn host_matches(hostname: &str, domain: &str) -> bool {
    let base = domain.strip_prefix("*.").unwrap_or(domain);
    if base.is_empty() {
        return false;
    }
    hostname == base
        || hostname
            .strip_suffix(base)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Method filter; exact and case-sensitive when configured
pub fn method_allowed(method: &str, config: &CaptureConfig) -> bool {
    match &config.method_filter {
        Some(filter) => filter == method,
        None => true,
    }
}

/// Path regex filter, matched against the URL path only
pub fn path_allowed(url: &str, config: &CaptureConfig) -> bool {
    let Some(pattern) = &config.path_pattern else {
        return true;
    };
    match Url::parse(url) {
        Ok(parsed) => pattern.is_match(parsed.path()),
        Err(_) => false,
    }
}

/// All scope rules combined
pub fn accepts(method: &str, url: &str, config: &CaptureConfig) -> bool {
    method_allowed(method, config) && in_scope(url, config) && path_allowed(url, config)
}
