use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::importer::ImportReport;
use crate::Clock;

/// Identifier handed back to the caller of an import request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct JobId(Uuid);

impl JobId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(value)?))
    }
}

/// Lifecycle state of an import job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState {
    Processing,
    Done { data: ImportReport },
    Failed,
}

impl JobState {
    /// Returns the canonical status label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Done { .. } => "done",
            Self::Failed => "failed",
        }
    }

    fn is_terminal(&self) -> bool {
        !matches!(self, Self::Processing)
    }
}

/// Snapshot of a job as seen by a status query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    #[serde(flatten)]
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct JobEntry {
    state: JobState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Process-lifetime store for import jobs.
///
/// Jobs are created when an import starts, move to `Done`/`Failed` exactly
/// once, and are dropped by [`JobStore::sweep_expired`] after they have been
/// terminal for longer than the configured TTL. Nothing here survives a
/// restart; the storage layer holds the durable results.
#[derive(Clone)]
pub struct JobStore {
    entries: Arc<Mutex<HashMap<JobId, JobEntry>>>,
    ttl: Duration,
    clock: Clock,
}

impl JobStore {
    pub fn new(ttl_hours: i64) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl: Duration::hours(ttl_hours),
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Registers a new job in the `Processing` state.
    pub fn create(&self) -> JobId {
        let id = JobId::generate();
        let now = self.now();
        let mut entries = self.entries.lock().expect("job store poisoned");
        entries.insert(
            id,
            JobEntry {
                state: JobState::Processing,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    /// Marks a job as completed, attaching the import report.
    pub fn complete(&self, id: JobId, data: ImportReport) {
        self.transition(id, JobState::Done { data });
    }

    /// Marks a job as failed. The cause is logged by the importer; callers
    /// only see the generic failure state.
    pub fn fail(&self, id: JobId) {
        self.transition(id, JobState::Failed);
    }

    fn transition(&self, id: JobId, state: JobState) {
        let now = self.now();
        let mut entries = self.entries.lock().expect("job store poisoned");
        if let Some(entry) = entries.get_mut(&id) {
            entry.state = state;
            entry.updated_at = now;
        }
    }

    /// Looks up a job by id.
    pub fn get(&self, id: JobId) -> Option<JobSnapshot> {
        let entries = self.entries.lock().expect("job store poisoned");
        entries.get(&id).map(|entry| JobSnapshot {
            id,
            state: entry.state.clone(),
            created_at: entry.created_at,
            updated_at: entry.updated_at,
        })
    }

    /// Drops terminal jobs whose last update is older than the TTL and
    /// returns how many were removed. In-flight jobs are never swept.
    pub fn sweep_expired(&self) -> usize {
        let threshold = self.now() - self.ttl;
        let mut entries = self.entries.lock().expect("job store poisoned");
        let before = entries.len();
        entries.retain(|_, entry| !entry.state.is_terminal() || entry.updated_at >= threshold);
        let removed = before - entries.len();
        if removed > 0 {
            metrics::counter!("jobs_expired_total").increment(removed as u64);
            tracing::info!(stage = "jobs", removed, "expired job sweep completed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("job store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> ImportReport {
        ImportReport {
            accepted: 2,
            skipped: 1,
        }
    }

    #[test]
    fn job_moves_through_lifecycle() {
        let store = JobStore::new(24);
        let id = store.create();

        let snapshot = store.get(id).expect("job exists");
        assert_eq!(snapshot.state, JobState::Processing);

        store.complete(id, report());
        let snapshot = store.get(id).expect("job exists");
        assert_eq!(snapshot.state.as_str(), "done");
        assert_eq!(snapshot.state, JobState::Done { data: report() });
    }

    #[test]
    fn unknown_job_is_absent() {
        let store = JobStore::new(24);
        let id = store.create();
        store.fail(id);

        assert!(store.get(id).is_some());
        let other = "7e2f8a8c-6f0e-4d0e-9c54-2b9d2c1a0b9d".parse().expect("uuid");
        assert!(store.get(other).is_none());
    }

    #[test]
    fn sweep_removes_only_expired_terminal_jobs() {
        let base = Utc::now();
        let store = JobStore::new(1).with_clock(Arc::new(move || base));

        let stale_done = store.create();
        store.complete(stale_done, report());
        let stale_processing = store.create();

        let later = base + Duration::hours(2);
        let store_later = store.clone().with_clock(Arc::new(move || later));
        let fresh_done = store_later.create();
        store_later.complete(fresh_done, report());

        let removed = store_later.sweep_expired();
        assert_eq!(removed, 1);
        assert!(store_later.get(stale_done).is_none());
        // Still processing, so the sweep must leave it alone.
        assert!(store_later.get(stale_processing).is_some());
        assert!(store_later.get(fresh_done).is_some());
    }

    #[test]
    fn job_id_round_trips_through_display() {
        let store = JobStore::new(24);
        let id = store.create();
        let parsed: JobId = id.to_string().parse().expect("parse");
        assert_eq!(parsed, id);
    }
}
