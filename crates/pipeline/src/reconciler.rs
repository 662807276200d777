use metrics::counter;
use thiserror::Error;
use tracing::{info, warn};

use benelink_core::reconcile::full_outer_join;
use benelink_storage::{BeneficiaryError, Database, NewBeneficiary, RawFeedError};

use crate::Clock;

/// Upserts one canonical beneficiary per reconciled identity.
#[derive(Clone)]
pub struct Reconciler {
    database: Database,
    clock: Clock,
}

/// Counters describing one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Beneficiaries created this pass.
    pub created: usize,
    /// Identities that already had a beneficiary row.
    pub existing: usize,
    /// Raw rows skipped because identity components were missing.
    pub incomplete: usize,
    /// Same-source duplicate rows collapsed by the join.
    pub collapsed: usize,
}

/// Errors raised while reconciling the raw stores.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to load raw feed rows: {0}")]
    Feed(#[from] RawFeedError),
    #[error("failed to upsert beneficiary: {0}")]
    Beneficiary(#[from] BeneficiaryError),
}

impl Reconciler {
    pub fn new(database: Database, clock: Clock) -> Self {
        Self { database, clock }
    }

    /// Recomputes the full outer join of both raw stores and inserts any
    /// identity that does not yet have a beneficiary. Safe to re-run: an
    /// unchanged store produces no net change.
    pub async fn run(&self) -> Result<ReconcileReport, ReconcileError> {
        let enrollment = self.database.enrollment().list().await?;
        let social = self.database.social_services().list().await?;
        let join = full_outer_join(&enrollment, &social);

        let mut report = ReconcileReport {
            incomplete: join.incomplete,
            collapsed: join.collapsed,
            ..ReconcileReport::default()
        };

        if join.incomplete > 0 {
            warn!(
                stage = "reconcile",
                incomplete = join.incomplete,
                "rows without a complete identity were skipped"
            );
        }

        let repo = self.database.beneficiaries();
        let now = (self.clock)();
        for reconciled in &join.identities {
            let outcome = repo
                .insert_if_absent(&NewBeneficiary {
                    first_name: &reconciled.identity.first_name,
                    last_name: &reconciled.identity.last_name,
                    dob: reconciled.identity.dob,
                    student_id: reconciled.student_id.as_deref(),
                    address: reconciled.address.as_deref(),
                    created_at: now,
                })
                .await?;

            if outcome.is_new() {
                report.created += 1;
            } else {
                report.existing += 1;
            }
        }

        counter!("beneficiaries_created_total").increment(report.created as u64);
        info!(
            stage = "reconcile",
            created = report.created,
            existing = report.existing,
            collapsed = report.collapsed,
            "reconciliation pass completed"
        );

        Ok(report)
    }
}
