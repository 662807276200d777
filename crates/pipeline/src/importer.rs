use std::time::Instant;

use metrics::{counter, histogram};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info};

use benelink_core::types::{CaseStatus, EnrollmentRow, FeedSource, SocialServicesRow, UnknownSource};
use benelink_storage::{Database, RawFeedError, RawInsertOutcome};

use crate::deriver::{DeriveError, DeriveSettings, Deriver};
use crate::jobs::{JobId, JobStore};
use crate::reconciler::{ReconcileError, Reconciler};
use crate::Clock;

/// Status stamped on cases opened by the post-import derivation stage.
const DERIVE_STATUS: CaseStatus = CaseStatus::Eligible;

/// Row counts returned to the caller of an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub accepted: usize,
    pub skipped: usize,
}

/// Errors raised while importing a feed batch.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("unknown feed source: {0}")]
    UnknownSource(String),
    #[error("row {index} is not a valid {feed} row: {cause}")]
    InvalidRow {
        feed: FeedSource,
        index: usize,
        #[source]
        cause: serde_json::Error,
    },
    #[error("failed to store feed row: {0}")]
    Feed(#[from] RawFeedError),
    #[error("reconciliation failed: {0}")]
    Reconcile(#[from] ReconcileError),
    #[error("derivation failed: {0}")]
    Derive(#[from] DeriveError),
}

/// Accepts feed batches, deduplicates them against the raw stores, and runs
/// the reconcile + derive stages for each accepted batch.
///
/// Batch imports assume single-writer semantics: the caller keeps at most
/// one import in flight per store. Every stage is idempotent on its natural
/// key, so a failed batch can simply be retried whole.
#[derive(Clone)]
pub struct Importer {
    database: Database,
    jobs: JobStore,
    clock: Clock,
    reconciler: Reconciler,
    deriver: Deriver,
}

impl Importer {
    pub fn new(database: Database, jobs: JobStore, clock: Clock, settings: DeriveSettings) -> Self {
        let reconciler = Reconciler::new(database.clone(), clock.clone());
        let deriver = Deriver::new(database.clone(), clock.clone(), settings);
        Self {
            database,
            jobs,
            clock,
            reconciler,
            deriver,
        }
    }

    /// Imports one batch for a known source and synchronously runs the rest
    /// of the pipeline. Rows are validated against the source schema before
    /// anything is inserted; re-importing the same batch accepts nothing
    /// and changes nothing.
    pub async fn import(
        &self,
        source: FeedSource,
        rows: &[Value],
    ) -> Result<ImportReport, ImportError> {
        let start = Instant::now();
        let imported_at = (self.clock)();
        let mut report = ImportReport::default();

        match source {
            FeedSource::Enrollment => {
                let parsed: Vec<EnrollmentRow> = parse_rows(source, rows)?;
                let repo = self.database.enrollment();
                for row in &parsed {
                    match repo.insert(row, imported_at).await? {
                        RawInsertOutcome::Inserted => report.accepted += 1,
                        RawInsertOutcome::Duplicate => report.skipped += 1,
                    }
                }
            }
            FeedSource::SocialServices => {
                let parsed: Vec<SocialServicesRow> = parse_rows(source, rows)?;
                let repo = self.database.social_services();
                for row in &parsed {
                    match repo.insert(row, imported_at).await? {
                        RawInsertOutcome::Inserted => report.accepted += 1,
                        RawInsertOutcome::Duplicate => report.skipped += 1,
                    }
                }
            }
        }

        counter!("feed_rows_accepted_total", "source" => source.as_str())
            .increment(report.accepted as u64);
        counter!("feed_rows_skipped_total", "source" => source.as_str())
            .increment(report.skipped as u64);

        // Reconciliation and derivation are the next stages of the same
        // batch; every step is idempotent, so a retried batch is safe.
        self.reconciler.run().await?;
        self.deriver.run(DERIVE_STATUS).await?;

        histogram!("import_batch_seconds", "source" => source.as_str())
            .record(start.elapsed().as_secs_f64());
        info!(
            stage = "ingest",
            source = %source,
            accepted = report.accepted,
            skipped = report.skipped,
            "import batch completed"
        );

        Ok(report)
    }

    /// Job-wrapped import used by the transport collaborator. The job is
    /// registered before the batch runs and ends up `Done` with the report
    /// or `Failed`; the failure cause is logged here, not exposed.
    pub async fn import_job(&self, source: &str, rows: &[Value]) -> Result<JobId, ImportError> {
        let source: FeedSource = source
            .parse()
            .map_err(|UnknownSource(label)| ImportError::UnknownSource(label))?;

        let job_id = self.jobs.create();
        counter!("import_jobs_total", "source" => source.as_str()).increment(1);

        match self.import(source, rows).await {
            Ok(report) => {
                self.jobs.complete(job_id, report);
                Ok(job_id)
            }
            Err(err) => {
                error!(
                    stage = "ingest",
                    source = %source,
                    job = %job_id,
                    error = %err,
                    "import batch failed"
                );
                self.jobs.fail(job_id);
                Err(err)
            }
        }
    }

    /// Job store shared with the status endpoint.
    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }
}

fn parse_rows<T: DeserializeOwned>(source: FeedSource, rows: &[Value]) -> Result<Vec<T>, ImportError> {
    rows.iter()
        .enumerate()
        .map(|(index, value)| {
            serde_json::from_value(value.clone()).map_err(|cause| ImportError::InvalidRow {
                feed: source,
                index,
                cause,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use crate::jobs::JobState;

    async fn setup_importer() -> Importer {
        let db = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        let clock: Clock = Arc::new(|| Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap());
        Importer::new(db, JobStore::new(24), clock, DeriveSettings::default())
    }

    fn enrollment_batch() -> Vec<Value> {
        vec![
            json!({
                "student_id": "S-1",
                "first_name": "Ana",
                "last_name": "Reyes",
                "dob": "2015-06-15",
                "address": "12 School St",
                "school_name": "Jefferson Elementary",
                "grade": 4,
                "meal_status": "Free",
            }),
            json!({
                "student_id": "S-2",
                "first_name": "Cara",
                "last_name": "Lim",
                "dob": "2014-09-01",
                "meal_status": "Reduced",
            }),
        ]
    }

    fn social_batch() -> Vec<Value> {
        vec![json!({
            "case_number": "C-1",
            "first_name": "Ana",
            "last_name": "Reyes",
            "dob": "2015-06-15",
            "address": "9 County Rd",
            "program_type": "CalFresh",
        })]
    }

    #[tokio::test]
    async fn import_runs_the_whole_pipeline() {
        let importer = setup_importer().await;
        let report = importer
            .import(FeedSource::Enrollment, &enrollment_batch())
            .await
            .expect("import");
        assert_eq!(report, ImportReport { accepted: 2, skipped: 0 });

        // Both rows were reconciled and, carrying meal statuses, got cases.
        assert_eq!(importer.database.beneficiaries().count().await.expect("count"), 2);
        assert_eq!(importer.database.cases().count().await.expect("count"), 2);
    }

    #[tokio::test]
    async fn reimporting_a_batch_is_idempotent() {
        let importer = setup_importer().await;
        importer
            .import(FeedSource::Enrollment, &enrollment_batch())
            .await
            .expect("first import");

        let report = importer
            .import(FeedSource::Enrollment, &enrollment_batch())
            .await
            .expect("second import");
        assert_eq!(report, ImportReport { accepted: 0, skipped: 2 });

        assert_eq!(importer.database.enrollment().count().await.expect("count"), 2);
        assert_eq!(importer.database.beneficiaries().count().await.expect("count"), 2);
        assert_eq!(importer.database.cases().count().await.expect("count"), 2);
    }

    #[tokio::test]
    async fn both_feeds_merge_into_one_beneficiary() {
        let importer = setup_importer().await;
        importer
            .import(FeedSource::Enrollment, &enrollment_batch()[..1].to_vec())
            .await
            .expect("enrollment import");
        importer
            .import(FeedSource::SocialServices, &social_batch())
            .await
            .expect("social import");

        assert_eq!(importer.database.beneficiaries().count().await.expect("count"), 1);
        assert_eq!(importer.database.cases().count().await.expect("count"), 1);

        let cases = importer
            .database
            .cases()
            .list_with_beneficiary()
            .await
            .expect("list");
        // Enrollment signal wins the reason coalesce.
        assert_eq!(cases[0].eligibility_reason.as_deref(), Some("Free"));
    }

    #[tokio::test]
    async fn rows_without_natural_key_are_always_accepted() {
        let importer = setup_importer().await;
        let batch = vec![json!({
            "first_name": "Dev",
            "last_name": "Patel",
            "dob": "2016-01-20",
            "meal_status": "Free",
        })];

        let first = importer
            .import(FeedSource::Enrollment, &batch)
            .await
            .expect("first");
        let second = importer
            .import(FeedSource::Enrollment, &batch)
            .await
            .expect("second");
        assert_eq!(first.accepted, 1);
        assert_eq!(second.accepted, 1);
        // Identical identity, so reconciliation still holds one beneficiary.
        assert_eq!(importer.database.beneficiaries().count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn invalid_rows_reject_the_batch_before_any_insert() {
        let importer = setup_importer().await;
        let batch = vec![
            json!({"student_id": "S-1", "first_name": "Ana", "last_name": "Reyes", "dob": "2015-06-15"}),
            json!({"student_id": "S-2", "dob": "not-a-date"}),
        ];

        let err = importer
            .import(FeedSource::Enrollment, &batch)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImportError::InvalidRow { index: 1, feed: FeedSource::Enrollment, .. }
        ));
        assert_eq!(importer.database.enrollment().count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn unknown_source_is_rejected_without_a_job() {
        let importer = setup_importer().await;
        let err = importer
            .import_job("payroll", &enrollment_batch())
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::UnknownSource(label) if label == "payroll"));
        assert!(importer.jobs().is_empty());
    }

    #[tokio::test]
    async fn import_job_completes_with_report() {
        let importer = setup_importer().await;
        let job_id = importer
            .import_job("enrollment", &enrollment_batch())
            .await
            .expect("job");

        let snapshot = importer.jobs().get(job_id).expect("job exists");
        assert_eq!(
            snapshot.state,
            JobState::Done {
                data: ImportReport { accepted: 2, skipped: 0 }
            }
        );
    }

    #[tokio::test]
    async fn failed_import_marks_the_job_failed() {
        let importer = setup_importer().await;
        let batch = vec![json!({"dob": "not-a-date"})];

        let err = importer.import_job("enrollment", &batch).await.unwrap_err();
        assert!(matches!(err, ImportError::InvalidRow { .. }));

        // The only job in the store is the failed one.
        assert_eq!(importer.jobs().len(), 1);
    }
}
