//! # ReqMapper Core
//!
//! Request correlation, dedup and webhook relay for the ReqMapper traffic
//! mapper. A browser-side provider reports each request's lifecycle; this
//! crate assembles those events into complete exchanges, drops the ones the
//! operator did not ask for, and forwards each unique exchange once as a
//! Postman collection item.
//!
//! ## Features
//!
//! - Correlation of lifecycle events by request id, with stale eviction
//! - Domain, method and path scoping
//! - Self-traffic guard against feedback loops
//! - Write-through dedup ledger (memory + SQLite)
//! - Fire-and-forget webhook delivery
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │             Browser provider (lifecycle events)          │
//! ├─────────────────────────────────────────────────────────┤
//! │           reqmapper_relay (NDJSON on stdin)              │
//! ├─────────────────────────────────────────────────────────┤
//! │                   ReqMapper Core (Rust)                  │
//! │  ┌────────────┐  ┌─────────┐  ┌────────┐  ┌─────────┐   │
//! │  │ Correlator │──│ Guard + │──│ Ledger │──│ Postman │──▶ webhook
//! │  │            │  │  Scope  │  │(SQLite)│  │ + Relay │   │
//! │  └────────────┘  └─────────┘  └────────┘  └─────────┘   │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod capture;
pub mod export;
pub mod models;
pub mod relay;
pub mod storage;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
