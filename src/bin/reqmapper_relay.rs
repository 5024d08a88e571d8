//! Standalone relay binary for ReqMapper.
//!
//! Reads provider messages as newline-delimited JSON on stdin and forwards
//! each unique completed request to the configured webhook.
//!
//! Usage:
//! ```
//! cargo run --bin reqmapper_relay -- --storage-path ./reqmapper_data --settings settings.json
//! ```

use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;

use reqmapper::api::relay_api::{self, RelayRuntime, RuntimeConfig};
use reqmapper::models::MonitorSettings;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tracing_subscriber::FmtSubscriber;

struct RelayArgs {
    storage_path: PathBuf,
    settings_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = parse_args();

    let settings = match &args.settings_path {
        Some(path) => load_settings(path)?,
        None => MonitorSettings::default(),
    };
    let config = RuntimeConfig {
        storage_path: Some(args.storage_path.to_string_lossy().into_owned()),
        ..Default::default()
    };
    let relay_timeout = config.relay_timeout;

    tracing::info!("Starting ReqMapper relay v{}", relay_api::get_version());
    let runtime = relay_api::start_runtime(config, settings).await?;

    let mut lines = BufReader::new(stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(e) = runtime.dispatch_json(line).await {
            tracing::warn!("{:#}", e);
        }
    }

    tracing::info!("Input closed; waiting for pending deliveries");
    drain(&runtime, relay_timeout).await;
    let status = runtime.status();
    tracing::info!(
        "Relayed {} requests ({} failed, {} duplicates dropped)",
        status.stats.relayed,
        status.stats.relay_failures,
        status.stats.duplicates
    );
    runtime.shutdown().await;
    Ok(())
}

/// Wait until every dispatched delivery has settled or `limit` passes
async fn drain(runtime: &RelayRuntime, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let stats = runtime.status().stats;
        if stats.relayed + stats.relay_failures >= stats.dispatched
            || tokio::time::Instant::now() >= deadline
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn load_settings(path: &PathBuf) -> anyhow::Result<MonitorSettings> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file {}", path.display()))?;
    let settings: MonitorSettings = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid settings file {}", path.display()))?;
    settings.validate()?;
    Ok(settings)
}

fn init_tracing() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(relay_api::resolve_log_level())
        .with_writer(std::io::stderr) // stdout is left to the caller
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn parse_args() -> RelayArgs {
    let mut args = std::env::args().skip(1);
    let mut storage_path = PathBuf::from("./reqmapper_data");
    let mut settings_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--storage-path" => {
                if let Some(path) = args.next() {
                    storage_path = PathBuf::from(path);
                }
            }
            "--settings" => {
                settings_path = args.next().map(PathBuf::from);
            }
            "--help" | "-h" => {
                eprintln!("ReqMapper Relay");
                eprintln!();
                eprintln!("Usage: reqmapper_relay [OPTIONS] < events.ndjson");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --storage-path <PATH>   Directory for the dedup ledger (default: ./reqmapper_data)");
                eprintln!("  --settings <FILE>       Monitor settings as JSON (camelCase keys)");
                eprintln!("  --help, -h              Show this help");
                eprintln!();
                eprintln!("Each stdin line is one provider message, e.g.");
                eprintln!(r#"  {{"type":"beforeRequest","requestId":"1","method":"GET","url":"https://example.com/"}}"#);
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {arg}");
            }
        }
    }

    RelayArgs {
        storage_path,
        settings_path,
    }
}
