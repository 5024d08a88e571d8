//! Request capture
//!
//! Correlates lifecycle events into complete request records, filters them
//! by scope and self-traffic rules, and hands unique ones to the relay.

pub mod correlator;
pub mod guard;
pub mod pipeline;
pub mod scope;
mod signature;

pub use correlator::{Correlator, DEFAULT_MAX_REQUEST_AGE};
pub use pipeline::{
    spawn_maintenance, Admission, CompletionOutcome, MaintenanceReport, Pipeline, PipelineStats,
    PipelineTimings, DEFAULT_MAINTENANCE_INTERVAL,
};
pub use signature::{body_hash, RequestSignature};
