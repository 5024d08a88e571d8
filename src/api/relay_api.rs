//! Relay API
//!
//! Process-level entry points: logging setup, runtime start/stop, message
//! dispatch and status.

use once_cell::sync::OnceCell;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::level_filters::LevelFilter;

use crate::capture::{
    spawn_maintenance, MaintenanceReport, Pipeline, PipelineStats, PipelineTimings,
    DEFAULT_MAINTENANCE_INTERVAL, DEFAULT_MAX_REQUEST_AGE,
};
use crate::models::{MonitorSettings, ProviderMessage, SettingsError};
use crate::relay::{Relay, WebhookRelay, DEFAULT_RELAY_TIMEOUT};
use crate::storage::{self, DedupLedger, DEFAULT_MEMORY_GRACE, DEFAULT_RETENTION};

/// Storage directory used when the host does not pick one
pub const DEFAULT_STORAGE_PATH: &str = "./reqmapper_data";
const LOG_FILE_PREFIX: &str = "reqmapper_relay";

/// Set once logging is installed; holds the log directory in release builds
static LOGGING: OnceCell<Option<PathBuf>> = OnceCell::new();

/// Get the version of the ReqMapper core library
pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Install logging. Safe to call more than once; later calls are no-ops.
///
/// Debug builds log to stderr. Release builds write a daily file under
/// `<storage_path>/logs`, next to the ledger database, since the relay
/// usually runs with stdout and stderr attached to the browser host.
pub fn init_core(storage_path: Option<String>) -> Result<bool, String> {
    LOGGING
        .get_or_try_init(|| install_subscriber(storage_path.as_deref()))
        .map(|_| true)
}

/// Directory receiving log files, if logging goes to disk
pub fn log_dir() -> Option<PathBuf> {
    LOGGING.get().cloned().flatten()
}

#[cfg(debug_assertions)]
fn install_subscriber(_storage_path: Option<&str>) -> Result<Option<PathBuf>, String> {
    let _ = tracing_subscriber::fmt()
        .with_max_level(resolve_log_level())
        .with_writer(std::io::stderr)
        .try_init();
    tracing::info!("ReqMapper core v{} logging to stderr", env!("CARGO_PKG_VERSION"));
    Ok(None)
}

#[cfg(not(debug_assertions))]
fn install_subscriber(storage_path: Option<&str>) -> Result<Option<PathBuf>, String> {
    let dir = PathBuf::from(storage_path.unwrap_or(DEFAULT_STORAGE_PATH)).join("logs");
    std::fs::create_dir_all(&dir)
        .map_err(|e| format!("Failed to create log directory {}: {}", dir.display(), e))?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX));
    // The writer must outlive every relay task
    std::mem::forget(guard);

    let _ = tracing_subscriber::fmt()
        .with_max_level(resolve_log_level())
        .with_ansi(false)
        .with_writer(writer)
        .try_init();
    tracing::info!(
        "ReqMapper core v{} logging to {}",
        env!("CARGO_PKG_VERSION"),
        dir.display()
    );
    Ok(Some(dir))
}

/// Level from `RUST_LOG`. Accepts a bare level or a comma list of
/// `target=level` directives, in which case the `reqmapper` directive wins.
/// Anything unrecognised falls back to `info`.
pub fn resolve_log_level() -> LevelFilter {
    let Ok(value) = std::env::var("RUST_LOG") else {
        return LevelFilter::INFO;
    };
    let mut bare = None;
    for directive in value.split(',').map(str::trim) {
        match directive.split_once('=') {
            Some((target, level)) if target.trim() == "reqmapper" => {
                if let Some(level) = parse_level(level) {
                    return level;
                }
            }
            Some(_) => {}
            None => bare = bare.or_else(|| parse_level(directive)),
        }
    }
    bare.unwrap_or(LevelFilter::INFO)
}

fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" => Some(LevelFilter::INFO),
        "warn" | "warning" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        "off" => Some(LevelFilter::OFF),
        _ => None,
    }
}

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory holding the ledger database; `None` keeps the ledger in memory
    pub storage_path: Option<String>,
    /// Cadence of the correlator/ledger sweep
    pub maintenance_interval: Duration,
    /// Age after which an uncompleted request is evicted
    pub max_request_age: Duration,
    /// How long a forwarded signature blocks duplicates
    pub ledger_retention: Duration,
    /// How long a signature stays in memory after its relay settled
    pub memory_grace: Duration,
    /// Per-delivery timeout
    pub relay_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            storage_path: Some(DEFAULT_STORAGE_PATH.to_string()),
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            max_request_age: DEFAULT_MAX_REQUEST_AGE,
            ledger_retention: DEFAULT_RETENTION,
            memory_grace: DEFAULT_MEMORY_GRACE,
            relay_timeout: DEFAULT_RELAY_TIMEOUT,
        }
    }
}

/// Runtime status information
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    /// Monitoring is enabled and has a webhook
    pub is_monitoring: bool,
    pub webhook_url: String,
    /// Requests awaiting completion
    pub in_flight: usize,
    /// Signatures held in the ledger's memory tier
    pub cached_signatures: usize,
    pub stats: PipelineStats,
}

/// A running pipeline plus its maintenance task
pub struct RelayRuntime {
    pipeline: Arc<Pipeline>,
    maintenance: JoinHandle<()>,
}

/// Start the runtime with the HTTP webhook relay
pub async fn start_runtime(
    config: RuntimeConfig,
    settings: MonitorSettings,
) -> anyhow::Result<RelayRuntime> {
    let relay = WebhookRelay::new(config.relay_timeout)?;
    start_runtime_with_relay(config, settings, Arc::new(relay)).await
}

/// Start the runtime with a caller-supplied relay
pub async fn start_runtime_with_relay(
    config: RuntimeConfig,
    settings: MonitorSettings,
    relay: Arc<dyn Relay>,
) -> anyhow::Result<RelayRuntime> {
    let ledger = match config.storage_path.as_deref() {
        Some(path) => storage::open_and_prune(path, config.ledger_retention).await?,
        None => DedupLedger::in_memory(config.ledger_retention)?,
    };
    tracing::info!(
        "Starting relay runtime (ledger={}, sweep every {:?})",
        ledger
            .db_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "memory".to_string()),
        config.maintenance_interval
    );
    if let Err(err) = settings.validate() {
        tracing::warn!("Starting with invalid settings: {}", err);
    }

    let pipeline = Arc::new(Pipeline::new(
        &settings,
        Arc::new(ledger),
        relay,
        PipelineTimings {
            max_request_age: config.max_request_age,
            memory_grace: config.memory_grace,
        },
    ));
    let maintenance = spawn_maintenance(Arc::clone(&pipeline), config.maintenance_interval);
    Ok(RelayRuntime {
        pipeline,
        maintenance,
    })
}

impl RelayRuntime {
    /// Feed one provider message through the pipeline
    pub async fn dispatch(&self, message: ProviderMessage) {
        self.pipeline.handle(message).await;
    }

    /// Parse and dispatch one JSON-encoded provider message
    pub async fn dispatch_json(&self, line: &str) -> anyhow::Result<()> {
        let message: ProviderMessage = serde_json::from_str(line)
            .map_err(|e| anyhow::anyhow!("Invalid provider message: {}", e))?;
        self.dispatch(message).await;
        Ok(())
    }

    /// Validate and apply new settings; invalid settings leave the current
    /// ones in place
    pub fn update_settings(&self, settings: MonitorSettings) -> Result<(), SettingsError> {
        settings.validate()?;
        self.pipeline.apply_settings(&settings);
        Ok(())
    }

    pub fn status(&self) -> RelayStatus {
        let config = self.pipeline.snapshot();
        RelayStatus {
            is_monitoring: config.is_active(),
            webhook_url: config.webhook_url.clone(),
            in_flight: self.pipeline.in_flight(),
            cached_signatures: self.pipeline.ledger().memory_len(),
            stats: self.pipeline.stats(),
        }
    }

    /// Run one maintenance pass now
    pub async fn sweep(&self) -> MaintenanceReport {
        self.pipeline.run_maintenance().await
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Stop the maintenance task. Deliveries already spawned run to completion.
    pub async fn shutdown(self) {
        tracing::info!("Stopping relay runtime");
        self.maintenance.abort();
        let _ = self.maintenance.await;
        self.pipeline.run_maintenance().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{RelayEnvelope, RelayError};
    use futures::future::BoxFuture;
    use serial_test::serial;

    struct NullRelay;

    impl Relay for NullRelay {
        fn deliver<'a>(
            &'a self,
            _webhook_url: &'a str,
            _envelope: &'a RelayEnvelope,
        ) -> BoxFuture<'a, Result<(), RelayError>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn memory_config() -> RuntimeConfig {
        RuntimeConfig {
            storage_path: None,
            ..Default::default()
        }
    }

    fn enabled_settings() -> MonitorSettings {
        MonitorSettings {
            webhook_url: "https://hook.test/in".into(),
            is_enabled: true,
            ..Default::default()
        }
    }

    #[test]
    #[serial]
    fn log_level_follows_rust_log() {
        let previous = std::env::var_os("RUST_LOG");
        std::env::set_var("RUST_LOG", "WARNING");
        assert_eq!(resolve_log_level(), LevelFilter::WARN);
        std::env::set_var("RUST_LOG", "reqmapper=debug");
        assert_eq!(resolve_log_level(), LevelFilter::DEBUG);
        std::env::set_var("RUST_LOG", "hyper=trace,error,reqmapper=warn");
        assert_eq!(resolve_log_level(), LevelFilter::WARN);
        std::env::set_var("RUST_LOG", "hyper=trace,error");
        assert_eq!(resolve_log_level(), LevelFilter::ERROR);
        std::env::set_var("RUST_LOG", "verbose");
        assert_eq!(resolve_log_level(), LevelFilter::INFO);
        std::env::remove_var("RUST_LOG");
        assert_eq!(resolve_log_level(), LevelFilter::INFO);
        if let Some(value) = previous {
            std::env::set_var("RUST_LOG", value);
        }
    }

    #[test]
    #[serial]
    fn init_core_is_idempotent() {
        assert_eq!(init_core(None), Ok(true));
        assert_eq!(init_core(Some("/nonexistent/elsewhere".into())), Ok(true));
        #[cfg(debug_assertions)]
        assert_eq!(log_dir(), None);
    }

    #[test]
    fn version_matches_package() {
        assert_eq!(get_version(), crate::VERSION);
    }

    #[test]
    fn default_config_carries_the_documented_windows() {
        let config = RuntimeConfig::default();
        assert_eq!(config.maintenance_interval, Duration::from_secs(30));
        assert_eq!(config.max_request_age, Duration::from_secs(60));
        assert_eq!(config.ledger_retention, Duration::from_secs(300));
        assert_eq!(config.memory_grace, Duration::from_secs(120));
    }

    #[tokio::test]
    async fn invalid_settings_update_keeps_current_snapshot() {
        let runtime =
            start_runtime_with_relay(memory_config(), enabled_settings(), Arc::new(NullRelay))
                .await
                .expect("runtime starts");

        let bad = MonitorSettings {
            webhook_url: "ftp://hook.test/in".into(),
            ..enabled_settings()
        };
        let err = tokio_test::assert_err!(runtime.update_settings(bad));
        assert!(matches!(err, SettingsError::UnsupportedWebhookScheme(_)));
        let status = runtime.status();
        assert!(status.is_monitoring);
        assert_eq!(status.webhook_url, "https://hook.test/in");

        tokio_test::assert_ok!(runtime.update_settings(MonitorSettings {
            is_enabled: false,
            ..enabled_settings()
        }));
        assert!(!runtime.status().is_monitoring);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn dispatch_json_rejects_garbage() {
        let runtime = start_runtime_with_relay(memory_config(), enabled_settings(), Arc::new(NullRelay))
            .await
            .unwrap();
        assert!(runtime.dispatch_json("{not json").await.is_err());
        assert!(runtime
            .dispatch_json(r#"{"type":"beforeRequest","requestId":"1","method":"GET","url":"https://a.test/x","tabId":1}"#)
            .await
            .is_ok());
        assert_eq!(runtime.status().in_flight, 1);

        // No tabId means no page issued it
        assert!(runtime
            .dispatch_json(r#"{"type":"beforeRequest","requestId":"2","method":"GET","url":"https://a.test/y"}"#)
            .await
            .is_ok());
        assert_eq!(runtime.status().in_flight, 1);
        assert_eq!(runtime.status().stats.ignored, 1);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn ledger_file_lives_under_storage_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig {
            storage_path: Some(dir.path().to_string_lossy().into_owned()),
            ..Default::default()
        };
        let runtime = start_runtime_with_relay(config, enabled_settings(), Arc::new(NullRelay))
            .await
            .unwrap();
        let db_path = runtime.pipeline().ledger().db_path().unwrap().to_path_buf();
        assert!(db_path.starts_with(dir.path()));
        runtime.shutdown().await;
    }
}
