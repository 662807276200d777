use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;
use metrics::counter;
use thiserror::Error;
use tracing::{info, warn};

use benelink_core::reconcile::full_outer_join;
use benelink_core::types::{Case, CaseStatus};
use benelink_storage::{
    BeneficiaryError, CaseError, Database, EligibilityFlagError, NewCase, RawFeedError,
};

use crate::Clock;

/// Policy knobs for case derivation.
#[derive(Debug, Clone)]
pub struct DeriveSettings {
    /// When `true`, a case is opened only for identities carrying at least
    /// one eligibility signal. When `false`, every resolved identity gets a
    /// case even if the reason coalesces to nothing.
    pub require_signal: bool,
    /// IANA timezone used to compute the program year embedded in case ids.
    pub agency_timezone: String,
}

impl Default for DeriveSettings {
    fn default() -> Self {
        Self {
            require_signal: true,
            agency_timezone: "UTC".to_string(),
        }
    }
}

/// Counters describing one derivation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeriveReport {
    /// Cases opened this pass.
    pub opened: usize,
    /// Beneficiaries that already had a case.
    pub existing: usize,
    /// Identities with no resolvable beneficiary row.
    pub unresolved: usize,
    /// Identities skipped because both signal fields were null.
    pub no_signal: usize,
}

/// Errors raised while deriving cases.
#[derive(Debug, Error)]
pub enum DeriveError {
    #[error("failed to load raw feed rows: {0}")]
    Feed(#[from] RawFeedError),
    #[error("failed to resolve beneficiary: {0}")]
    Beneficiary(#[from] BeneficiaryError),
    #[error("failed to open case: {0}")]
    Case(#[from] CaseError),
    #[error("failed to record eligibility flag: {0}")]
    Flag(#[from] EligibilityFlagError),
    #[error("invalid agency timezone: {0}")]
    InvalidTimezone(String),
}

/// Opens at most one case per beneficiary from the reconciled identities.
#[derive(Clone)]
pub struct Deriver {
    database: Database,
    clock: Clock,
    settings: DeriveSettings,
}

impl Deriver {
    pub fn new(database: Database, clock: Clock, settings: DeriveSettings) -> Self {
        Self {
            database,
            clock,
            settings,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Recomputes the reconciliation join, resolves each identity to its
    /// beneficiary, and opens a case with the supplied status where none
    /// exists. Re-running never opens a second case for a beneficiary.
    pub async fn run(&self, status: CaseStatus) -> Result<DeriveReport, DeriveError> {
        let enrollment = self.database.enrollment().list().await?;
        let social = self.database.social_services().list().await?;
        let join = full_outer_join(&enrollment, &social);

        let now = self.now();
        let year = program_year(now, &self.settings.agency_timezone)?;
        let beneficiaries = self.database.beneficiaries();
        let cases = self.database.cases();
        let flags = self.database.eligibility_flags();
        let mut report = DeriveReport::default();

        for reconciled in &join.identities {
            let Some(beneficiary_id) = beneficiaries.find_id(&reconciled.identity).await? else {
                // Without a canonical identity there is nothing to attach a
                // case to; reconciliation has to catch up first.
                report.unresolved += 1;
                warn!(
                    stage = "derive",
                    name = %reconciled.identity.full_name(),
                    "identity has no beneficiary row, skipping"
                );
                continue;
            };

            let reason = reconciled.eligibility_reason();
            if reason.is_none() && self.settings.require_signal {
                report.no_signal += 1;
                continue;
            }

            let outcome = cases
                .insert_if_absent(&NewCase {
                    case_id: Case::make_id(beneficiary_id, year),
                    beneficiary_id,
                    status,
                    created_at: now,
                    eligibility_reason: reason,
                })
                .await?;

            if outcome.is_new() {
                report.opened += 1;
            } else {
                report.existing += 1;
            }

            if let Some(student_id) = reconciled.student_id.as_deref() {
                flags
                    .upsert(student_id, reason.is_some(), reason, now)
                    .await?;
            }
        }

        counter!("cases_opened_total").increment(report.opened as u64);
        info!(
            stage = "derive",
            opened = report.opened,
            existing = report.existing,
            unresolved = report.unresolved,
            no_signal = report.no_signal,
            status = %status,
            "derivation pass completed"
        );

        Ok(report)
    }
}

/// Returns the calendar year at the agency's timezone for the given instant.
pub fn program_year(now: DateTime<Utc>, timezone: &str) -> Result<i32, DeriveError> {
    let tz: Tz = timezone
        .parse()
        .map_err(|_| DeriveError::InvalidTimezone(timezone.to_string()))?;
    Ok(now.with_timezone(&tz).year())
}
