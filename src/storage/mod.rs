//! Dedup ledger storage

mod ledger;

pub use ledger::*;

use std::time::Duration;

/// Open the ledger and drop whatever expired while the process was down
/// (call this on startup)
pub async fn open_and_prune(storage_path: &str, retention: Duration) -> anyhow::Result<DedupLedger> {
    let ledger = DedupLedger::open(storage_path, retention)?;
    let pruned = ledger.prune().await?;
    if pruned > 0 {
        tracing::info!("Pruned {} expired signatures on startup", pruned);
    }
    Ok(ledger)
}
