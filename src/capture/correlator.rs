//! Request correlation table
//!
//! Assembles the three lifecycle events of a request into one record keyed by
//! the provider's ephemeral request id.

use dashmap::DashMap;
use std::time::Duration;

use crate::models::{CompletedRequest, HeaderEntry, PendingRequest, ResponseMeta};

/// Records older than this never completed and are evicted by the sweep
pub const DEFAULT_MAX_REQUEST_AGE: Duration = Duration::from_secs(60);

#[derive(Default)]
pub struct Correlator {
    entries: DashMap<String, PendingRequest>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a request. Returns false if the id was already tracked
    /// and the stale record got replaced.
    pub fn track(&self, request: PendingRequest) -> bool {
        let id = request.request_id.clone();
        match self.entries.insert(id, request) {
            Some(previous) => {
                tracing::debug!(
                    "Request id {} reused before completion, replacing {} {}",
                    previous.request_id,
                    previous.method,
                    previous.url
                );
                false
            }
            None => true,
        }
    }

    /// Merge request headers into a tracked record; unknown ids are a no-op
    pub fn attach_headers(&self, request_id: &str, headers: Vec<HeaderEntry>) -> bool {
        match self.entries.get_mut(request_id) {
            Some(mut entry) => {
                entry.request_headers = Some(headers);
                true
            }
            None => false,
        }
    }

    /// Take the record out of the table and attach the response.
    ///
    /// Removal is atomic, so of two racing completions for one id only one
    /// gets the record.
    pub fn complete(&self, request_id: &str, response: ResponseMeta) -> Option<CompletedRequest> {
        self.entries
            .remove(request_id)
            .map(|(_, pending)| pending.complete(response))
    }

    /// Drop a record without relaying it
    pub fn discard(&self, request_id: &str) -> Option<PendingRequest> {
        self.entries.remove(request_id).map(|(_, pending)| pending)
    }

    /// Remove every record older than `max_age` as of `now_ms`
    pub fn evict_stale(&self, max_age: Duration, now_ms: i64) -> usize {
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let mut evicted = 0;
        self.entries.retain(|_, pending| {
            let keep = pending.age_ms(now_ms) <= max_age_ms;
            if !keep {
                tracing::debug!(
                    "Evicting stale request {} {} {}",
                    pending.request_id,
                    pending.method,
                    pending.url
                );
                evicted += 1;
            }
            keep
        });
        evicted
    }

    /// Abandon every in-flight record
    pub fn clear(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RequestState;

    impl Correlator {
        fn get(&self, request_id: &str) -> Option<PendingRequest> {
            self.entries.get(request_id).map(|entry| entry.value().clone())
        }
    }

    fn pending(id: &str, captured_at: i64) -> PendingRequest {
        PendingRequest {
            request_id: id.into(),
            method: "POST".into(),
            url: "https://api.example.com/items".into(),
            body: None,
            captured_at,
            tab_id: 1,
            initiator: None,
            request_headers: None,
        }
    }

    fn ok() -> ResponseMeta {
        ResponseMeta {
            status_code: 200,
            status_line: None,
            headers: Vec::new(),
        }
    }

    #[test]
    fn lifecycle_assembles_one_record() {
        let table = Correlator::new();
        assert!(table.track(pending("7", 1_000)));
        assert!(table.attach_headers("7", vec![HeaderEntry::new("X-A", "1")]));
        assert_eq!(
            table.get("7").map(|p| p.state()),
            Some(RequestState::HeadersAttached)
        );

        let done = table.complete("7", ok()).expect("record present");
        assert_eq!(done.request.request_headers.unwrap().len(), 1);
        assert_eq!(done.response.status_code, 200);
        assert!(table.is_empty());
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let table = Correlator::new();
        assert!(!table.attach_headers("missing", Vec::new()));
        assert!(table.complete("missing", ok()).is_none());
        assert!(table.discard("missing").is_none());
    }

    #[test]
    fn second_completion_finds_nothing() {
        let table = Correlator::new();
        table.track(pending("9", 0));
        assert!(table.complete("9", ok()).is_some());
        assert!(table.complete("9", ok()).is_none());
    }

    #[test]
    fn eviction_removes_only_stale_records() {
        let table = Correlator::new();
        let now = 1_700_000_100_000;
        table.track(pending("old", now - 61_000));
        table.track(pending("edge", now - 60_000));
        table.track(pending("fresh", now - 5_000));

        let evicted = table.evict_stale(DEFAULT_MAX_REQUEST_AGE, now);
        assert_eq!(evicted, 1);
        assert!(!table.contains("old"));
        assert!(table.contains("edge"));
        assert!(table.contains("fresh"));
    }

    #[test]
    fn reused_id_replaces_record() {
        let table = Correlator::new();
        assert!(table.track(pending("3", 0)));
        assert!(!table.track(pending("3", 50)));
        assert_eq!(table.get("3").unwrap().captured_at, 50);
        assert_eq!(table.clear(), 1);
    }
}
