//! Capture pipeline
//!
//! Drives lifecycle events through the correlator, the guard and scope
//! filters, the dedup ledger, the translator and the relay. Also owns the
//! maintenance sweep for the correlator table and the ledger.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::capture::correlator::{Correlator, DEFAULT_MAX_REQUEST_AGE};
use crate::capture::guard::{self, Candidate};
use crate::capture::scope;
use crate::capture::signature::RequestSignature;
use crate::export::to_postman_item;
use crate::models::{
    headers_from_details, BeforeRequestEvent, BeforeSendHeadersEvent, CaptureConfig,
    CompletedEvent, ErrorOccurredEvent, MonitorSettings, ProviderMessage,
};
use crate::relay::{Relay, RelayEnvelope};
use crate::storage::{DedupLedger, DEFAULT_MEMORY_GRACE};

pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Age thresholds used by the pipeline
#[derive(Debug, Clone, Copy)]
pub struct PipelineTimings {
    /// Records older than this are evicted by the sweep
    pub max_request_age: Duration,
    /// How long a relayed signature stays in the ledger's memory tier
    pub memory_grace: Duration,
}

impl Default for PipelineTimings {
    fn default() -> Self {
        Self {
            max_request_age: DEFAULT_MAX_REQUEST_AGE,
            memory_grace: DEFAULT_MEMORY_GRACE,
        }
    }
}

/// Result of an initiation event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Tracked,
    /// Monitoring is off or has no webhook
    Inactive,
    /// Rejected by the self-traffic guard
    Ignored,
    /// Rejected by domain, method or path rules
    OutOfScope,
}

/// Result of a completion event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Handed to the relay
    Dispatched,
    /// No record for this id (filtered out, evicted or already completed)
    Untracked,
    Inactive,
    Ignored,
    /// Settings changed while in flight and the request no longer matches
    OutOfScope,
    /// Signature already forwarded
    Duplicate,
    Untranslatable,
}

#[derive(Default)]
struct PipelineCounters {
    tracked: AtomicU64,
    filtered: AtomicU64,
    ignored: AtomicU64,
    duplicates: AtomicU64,
    dispatched: AtomicU64,
    relayed: AtomicU64,
    relay_failures: AtomicU64,
    evicted: AtomicU64,
}

/// Counters since startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub tracked: u64,
    pub filtered: u64,
    pub ignored: u64,
    pub duplicates: u64,
    pub dispatched: u64,
    pub relayed: u64,
    pub relay_failures: u64,
    pub evicted: u64,
}

impl PipelineCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            tracked: self.tracked.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            relay_failures: self.relay_failures.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

/// What one maintenance pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub evicted_requests: usize,
    pub pruned_signatures: u64,
}

pub struct Pipeline {
    config: RwLock<Arc<CaptureConfig>>,
    correlator: Correlator,
    ledger: Arc<DedupLedger>,
    relay: Arc<dyn Relay>,
    timings: PipelineTimings,
    counters: Arc<PipelineCounters>,
}

impl Pipeline {
    pub fn new(
        settings: &MonitorSettings,
        ledger: Arc<DedupLedger>,
        relay: Arc<dyn Relay>,
        timings: PipelineTimings,
    ) -> Self {
        Self {
            config: RwLock::new(Arc::new(settings.compile())),
            correlator: Correlator::new(),
            ledger,
            relay,
            timings,
            counters: Arc::new(PipelineCounters::default()),
        }
    }

    /// Current configuration snapshot
    pub fn snapshot(&self) -> Arc<CaptureConfig> {
        match self.config.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the configuration. Turning monitoring off abandons every
    /// in-flight record and the ledger's memory tier.
    pub fn apply_settings(&self, settings: &MonitorSettings) {
        let next = Arc::new(settings.compile());
        let active = next.is_active();
        match self.config.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }

        if active {
            tracing::info!(
                "Monitoring enabled (webhook={}, scope={:?}, method={:?})",
                settings.webhook_url.trim(),
                settings.domain_scope,
                settings.method_filter
            );
        } else {
            let dropped = self.correlator.clear();
            let forgotten = self.ledger.clear_memory();
            tracing::info!(
                "Monitoring disabled; dropped {} in-flight requests and {} cached signatures",
                dropped,
                forgotten
            );
        }
    }

    pub fn on_before_request(&self, event: BeforeRequestEvent) -> Admission {
        let config = self.snapshot();
        if !config.is_active() {
            return Admission::Inactive;
        }

        let candidate = Candidate {
            url: &event.url,
            tab_id: event.tab_id,
            initiator: event.initiator.as_deref(),
        };
        if guard::should_ignore(&candidate, &config) {
            PipelineCounters::bump(&self.counters.ignored);
            tracing::trace!("Ignoring own traffic {} {}", event.method, event.url);
            return Admission::Ignored;
        }
        if !scope::accepts(&event.method, &event.url, &config) {
            PipelineCounters::bump(&self.counters.filtered);
            return Admission::OutOfScope;
        }

        let pending = event.into_pending(now_ms());
        tracing::debug!(
            "Tracking request {} {} {}",
            pending.request_id,
            pending.method,
            pending.url
        );
        self.correlator.track(pending);
        PipelineCounters::bump(&self.counters.tracked);
        Admission::Tracked
    }

    /// Returns true if the headers landed on a tracked record
    pub fn on_before_send_headers(&self, event: BeforeSendHeadersEvent) -> bool {
        self.correlator
            .attach_headers(&event.request_id, headers_from_details(event.request_headers))
    }

    pub async fn on_completed(&self, event: CompletedEvent) -> CompletionOutcome {
        let request_id = event.request_id.clone();
        let Some(record) = self.correlator.complete(&request_id, event.response_meta()) else {
            return CompletionOutcome::Untracked;
        };

        let config = self.snapshot();
        if !config.is_active() {
            return CompletionOutcome::Inactive;
        }
        if guard::should_ignore(&Candidate::from(&record.request), &config) {
            PipelineCounters::bump(&self.counters.ignored);
            return CompletionOutcome::Ignored;
        }
        if !scope::accepts(&record.request.method, &record.request.url, &config) {
            PipelineCounters::bump(&self.counters.filtered);
            tracing::debug!(
                "Dropping request {} {} {}: no longer in scope",
                request_id,
                record.request.method,
                record.request.url
            );
            return CompletionOutcome::OutOfScope;
        }

        let signature = RequestSignature::compute(&record.request);
        if !self.ledger.claim(&signature).await {
            PipelineCounters::bump(&self.counters.duplicates);
            tracing::debug!("Dropping duplicate request {} ({})", request_id, signature);
            return CompletionOutcome::Duplicate;
        }

        let item = match to_postman_item(&record) {
            Ok(item) => item,
            Err(err) => {
                tracing::warn!("Skipping request {}: {}", request_id, err);
                return CompletionOutcome::Untranslatable;
            }
        };

        PipelineCounters::bump(&self.counters.dispatched);
        self.spawn_delivery(config.webhook_url.clone(), RelayEnvelope::new(item), signature);
        CompletionOutcome::Dispatched
    }

    /// Provider gave up on the request; forget it without relaying
    pub fn on_error_occurred(&self, event: ErrorOccurredEvent) -> bool {
        match self.correlator.discard(&event.request_id) {
            Some(pending) => {
                tracing::debug!(
                    "Request {} {} failed before completion: {}",
                    pending.method,
                    pending.url,
                    event.error
                );
                true
            }
            None => false,
        }
    }

    /// Route one provider message
    pub async fn handle(&self, message: ProviderMessage) {
        if let Some(request_id) = message.request_id() {
            tracing::trace!("Provider event for request {}", request_id);
        }
        match message {
            ProviderMessage::BeforeRequest(event) => {
                self.on_before_request(event);
            }
            ProviderMessage::BeforeSendHeaders(event) => {
                self.on_before_send_headers(event);
            }
            ProviderMessage::Completed(event) => {
                self.on_completed(event).await;
            }
            ProviderMessage::ErrorOccurred(event) => {
                self.on_error_occurred(event);
            }
            ProviderMessage::UpdateSettings { settings } => self.apply_settings(&settings),
        }
    }

    fn spawn_delivery(&self, webhook_url: String, envelope: RelayEnvelope, signature: RequestSignature) {
        let relay = Arc::clone(&self.relay);
        let ledger = Arc::clone(&self.ledger);
        let counters = Arc::clone(&self.counters);
        let grace = self.timings.memory_grace;
        tokio::spawn(async move {
            match relay.deliver(&webhook_url, &envelope).await {
                Ok(()) => {
                    PipelineCounters::bump(&counters.relayed);
                    tracing::debug!("Relayed {}", envelope.request.name);
                }
                Err(err) => {
                    PipelineCounters::bump(&counters.relay_failures);
                    tracing::warn!("Failed to relay {}: {}", envelope.request.name, err);
                }
            }
            ledger.release_after(signature, grace);
        });
    }

    /// Evict stale records and prune the ledger
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        self.run_maintenance_at(now_ms()).await
    }

    pub async fn run_maintenance_at(&self, now: i64) -> MaintenanceReport {
        let evicted_requests = self
            .correlator
            .evict_stale(self.timings.max_request_age, now);
        self.counters
            .evicted
            .fetch_add(evicted_requests as u64, Ordering::Relaxed);

        let pruned_signatures = match self.ledger.prune_at(now).await {
            Ok(count) => count,
            Err(err) => {
                tracing::error!("Ledger prune failed: {:#}", err);
                0
            }
        };

        if evicted_requests > 0 {
            tracing::debug!("Evicted {} stale requests", evicted_requests);
        }
        MaintenanceReport {
            evicted_requests,
            pruned_signatures,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.correlator.len()
    }

    pub fn is_tracking(&self, request_id: &str) -> bool {
        self.correlator.contains(request_id)
    }

    pub fn ledger(&self) -> &Arc<DedupLedger> {
        &self.ledger
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }
}

/// Run maintenance on a fixed cadence until the task is aborted
pub fn spawn_maintenance(pipeline: Arc<Pipeline>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            pipeline.run_maintenance().await;
        }
    })
}
