//! Batch pipeline and interactive services built on top of the storage
//! crate. The transport collaborator calls into this crate with plain data
//! (feed batches, eligibility requests) and receives plain data back; no
//! HTTP concerns live here.

pub mod deriver;
pub mod eligibility;
pub mod importer;
pub mod jobs;
pub mod listing;
pub mod reconciler;
pub mod telemetry;

use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Clock injected into pipeline stages so tests can pin time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Returns the wall clock used in production.
pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}
