use anyhow::{anyhow, Context};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::capture::RequestSignature;

/// How long a sent signature is remembered
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(5 * 60);
/// How long a signature stays in memory after its relay call settled
pub const DEFAULT_MEMORY_GRACE: Duration = Duration::from_secs(2 * 60);

const LEDGER_FILE_NAME: &str = "reqmapper_ledger.sqlite";

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Write-through record of forwarded requests: an in-memory map consulted
/// first and a SQLite table that survives restarts.
pub struct DedupLedger {
    memory: DashMap<String, i64>,
    db: Arc<Mutex<Connection>>,
    db_path: Option<PathBuf>,
    retention: Duration,
}

impl DedupLedger {
    /// Open (or create) the durable ledger under `base_path`
    pub fn open(base_path: &str, retention: Duration) -> anyhow::Result<Self> {
        let dir = Path::new(base_path);
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating storage directory {:?}", dir))?;
        }
        let db_path = dir.join(LEDGER_FILE_NAME);
        let conn = Connection::open(&db_path)
            .with_context(|| format!("opening ledger at {:?}", db_path))?;
        Self::with_connection(conn, Some(db_path), retention)
    }

    /// Ledger whose durable tier lives only as long as the process
    pub fn in_memory(retention: Duration) -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory ledger")?;
        Self::with_connection(conn, None, retention)
    }

    fn with_connection(
        conn: Connection,
        db_path: Option<PathBuf>,
        retention: Duration,
    ) -> anyhow::Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sent_signatures (
                signature TEXT PRIMARY KEY,
                sent_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sent_signatures_sent_at
                ON sent_signatures(sent_at);
            ",
        )
        .context("creating ledger schema")?;

        Ok(Self {
            memory: DashMap::new(),
            db: Arc::new(Mutex::new(conn)),
            db_path,
            retention,
        })
    }

    fn cutoff(&self, now: i64) -> i64 {
        now.saturating_sub(duration_ms(self.retention))
    }

    /// Has this signature been forwarded within the retention window?
    ///
    /// Storage failures are logged and read as "not sent".
    pub async fn already_sent(&self, signature: &RequestSignature) -> bool {
        if self.memory.contains_key(signature.as_str()) {
            return true;
        }
        let now = now_ms();
        match self.durable_contains(signature.as_str(), now).await {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!("Ledger read failed, treating {} as unsent: {:#}", signature, err);
                false
            }
        }
    }

    /// Record the signature in both tiers
    pub async fn mark_sent(&self, signature: &RequestSignature) {
        let now = now_ms();
        self.memory.insert(signature.as_str().to_string(), now);
        if let Err(err) = self.durable_insert(signature.as_str(), now).await {
            tracing::error!("Failed to persist sent signature {}: {:#}", signature, err);
        }
    }

    /// Check and mark in one step. Returns true if the caller now owns the
    /// signature and should relay it; false if it was already sent.
    ///
    /// The memory tier is claimed before any storage await, so two
    /// concurrent completions with one signature cannot both win.
    pub async fn claim(&self, signature: &RequestSignature) -> bool {
        let now = now_ms();
        match self.memory.entry(signature.as_str().to_string()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(now);
            }
        }

        match self.durable_contains(signature.as_str(), now).await {
            Ok(true) => {
                tracing::debug!("Signature {} found in durable ledger", signature);
                return false;
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!("Ledger read failed, treating {} as unsent: {:#}", signature, err);
            }
        }

        if let Err(err) = self.durable_insert(signature.as_str(), now).await {
            tracing::error!("Failed to persist sent signature {}: {:#}", signature, err);
        }
        true
    }

    /// Forget the in-memory entry; the durable entry stays until it expires
    pub fn release(&self, signature: &RequestSignature) {
        self.memory.remove(signature.as_str());
    }

    /// Release the in-memory entry once `grace` has passed
    pub fn release_after(
        self: &Arc<Self>,
        signature: RequestSignature,
        grace: Duration,
    ) -> JoinHandle<()> {
        let ledger = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            ledger.release(&signature);
        })
    }

    /// Drop expired entries from both tiers
    pub async fn prune(&self) -> anyhow::Result<u64> {
        self.prune_at(now_ms()).await
    }

    pub async fn prune_at(&self, now: i64) -> anyhow::Result<u64> {
        let cutoff = self.cutoff(now);
        self.memory.retain(|_, sent_at| *sent_at >= cutoff);

        let db = Arc::clone(&self.db);
        let deleted = tokio::task::spawn_blocking(move || -> anyhow::Result<u64> {
            let conn = db.lock().map_err(|e| anyhow!("db mutex poisoned: {e}"))?;
            let count = conn.execute(
                "DELETE FROM sent_signatures WHERE sent_at < ?1",
                params![cutoff],
            )?;
            Ok(count as u64)
        })
        .await??;

        if deleted > 0 {
            tracing::debug!("Pruned {} expired signatures from ledger", deleted);
        }
        Ok(deleted)
    }

    /// Forget the in-memory tier (monitoring toggled off)
    pub fn clear_memory(&self) -> usize {
        let count = self.memory.len();
        self.memory.clear();
        count
    }

    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    pub async fn durable_len(&self) -> anyhow::Result<u64> {
        let db = Arc::clone(&self.db);
        let count = tokio::task::spawn_blocking(move || -> anyhow::Result<u64> {
            let conn = db.lock().map_err(|e| anyhow!("db mutex poisoned: {e}"))?;
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM sent_signatures", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await??;
        Ok(count)
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    async fn durable_contains(&self, signature: &str, now: i64) -> anyhow::Result<bool> {
        let db = Arc::clone(&self.db);
        let signature = signature.to_string();
        let cutoff = self.cutoff(now);
        tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
            let conn = db.lock().map_err(|e| anyhow!("db mutex poisoned: {e}"))?;
            conn.execute(
                "DELETE FROM sent_signatures WHERE sent_at < ?1",
                params![cutoff],
            )
            .context("pruning ledger")?;
            let found = conn
                .query_row(
                    "SELECT 1 FROM sent_signatures WHERE signature = ?1",
                    params![signature],
                    |_| Ok(()),
                )
                .optional()
                .context("reading ledger")?;
            Ok(found.is_some())
        })
        .await?
    }

    async fn durable_insert(&self, signature: &str, now: i64) -> anyhow::Result<()> {
        let db = Arc::clone(&self.db);
        let signature = signature.to_string();
        let cutoff = self.cutoff(now);
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = db.lock().map_err(|e| anyhow!("db mutex poisoned: {e}"))?;
            conn.execute(
                "DELETE FROM sent_signatures WHERE sent_at < ?1",
                params![cutoff],
            )
            .context("pruning ledger")?;
            conn.execute(
                "INSERT OR IGNORE INTO sent_signatures (signature, sent_at) VALUES (?1, ?2)",
                params![signature, now],
            )
            .context("inserting signature")?;
            Ok(())
        })
        .await?
    }

    #[cfg(test)]
    async fn insert_durable_at(&self, signature: &str, sent_at: i64) -> anyhow::Result<()> {
        let db = Arc::clone(&self.db);
        let signature = signature.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = db.lock().map_err(|e| anyhow!("db mutex poisoned: {e}"))?;
            conn.execute(
                "INSERT OR REPLACE INTO sent_signatures (signature, sent_at) VALUES (?1, ?2)",
                params![signature, sent_at],
            )?;
            Ok(())
        })
        .await?
    }

    #[cfg(test)]
    async fn break_durable_tier(&self) -> anyhow::Result<()> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = db.lock().map_err(|e| anyhow!("db mutex poisoned: {e}"))?;
            conn.execute_batch("DROP TABLE sent_signatures;")?;
            Ok(())
        })
        .await?
    }
}
