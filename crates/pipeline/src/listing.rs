use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;

use benelink_core::reconcile::full_outer_join;
use benelink_storage::{CaseError, Database, EligibilityFlagError, RawFeedError};

/// One row of the case listing shown to caseworkers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseListItem {
    pub case_id: String,
    /// Beneficiary full name; absent if the row was orphaned.
    pub name: Option<String>,
    pub status: String,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eligibility_reason: Option<String>,
    pub documents: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// One row of the results listing: a reconciled identity joined to any
/// persisted per-student eligibility flag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultListItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_number: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub dob: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meal_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_eligible: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Errors raised while building listings.
#[derive(Debug, Error)]
pub enum ListingError {
    #[error("failed to load cases: {0}")]
    Case(#[from] CaseError),
    #[error("failed to load raw feed rows: {0}")]
    Feed(#[from] RawFeedError),
    #[error("failed to load eligibility flags: {0}")]
    Flag(#[from] EligibilityFlagError),
}

/// Returns one row per case joined to the beneficiary full name.
pub async fn list_cases(database: &Database) -> Result<Vec<CaseListItem>, ListingError> {
    let rows = database.cases().list_with_beneficiary().await?;
    Ok(rows
        .into_iter()
        .map(|row| CaseListItem {
            case_id: row.case_id,
            name: row.beneficiary_name,
            status: row.status,
            created: row.created_at,
            last_modified: row.last_modified,
            eligibility_reason: row.eligibility_reason,
            documents: row.documents,
            notes: row.notes,
        })
        .collect())
}

/// Returns one row per reconciled identity, left-joined to the persisted
/// eligibility flag for its student id.
pub async fn list_results(database: &Database) -> Result<Vec<ResultListItem>, ListingError> {
    let enrollment = database.enrollment().list().await?;
    let social = database.social_services().list().await?;
    let join = full_outer_join(&enrollment, &social);

    let flags: HashMap<String, _> = database
        .eligibility_flags()
        .list()
        .await?
        .into_iter()
        .map(|flag| (flag.student_id.clone(), flag))
        .collect();

    Ok(join
        .identities
        .into_iter()
        .map(|reconciled| {
            let flag = reconciled
                .student_id
                .as_deref()
                .and_then(|student_id| flags.get(student_id));
            ResultListItem {
                is_eligible: flag.map(|flag| flag.is_eligible),
                reason: flag.and_then(|flag| flag.reason.clone()),
                student_id: reconciled.student_id,
                case_number: reconciled.case_number,
                first_name: reconciled.identity.first_name,
                last_name: reconciled.identity.last_name,
                dob: reconciled.identity.dob,
                address: reconciled.address,
                meal_status: reconciled.meal_status,
                program_type: reconciled.program_type,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use benelink_core::types::{CaseStatus, EnrollmentRow, SocialServicesRow};
    use chrono::{NaiveDate, TimeZone, Utc};

    use crate::deriver::{DeriveSettings, Deriver};
    use crate::reconciler::Reconciler;
    use crate::Clock;

    async fn setup_db() -> Database {
        let db = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        db
    }

    fn fixed_clock() -> Clock {
        Arc::new(|| Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap())
    }

    async fn seed_and_derive(db: &Database) {
        db.enrollment()
            .insert(
                &EnrollmentRow {
                    student_id: Some("S-1".to_string()),
                    first_name: Some("Ana".to_string()),
                    last_name: Some("Reyes".to_string()),
                    dob: NaiveDate::from_ymd_opt(2015, 6, 15),
                    meal_status: Some("Free".to_string()),
                    ..EnrollmentRow::default()
                },
                Utc::now(),
            )
            .await
            .expect("insert enrollment");
        db.social_services()
            .insert(
                &SocialServicesRow {
                    case_number: Some("C-7".to_string()),
                    first_name: Some("Ben".to_string()),
                    last_name: Some("Okafor".to_string()),
                    dob: NaiveDate::from_ymd_opt(2013, 2, 1),
                    address: Some("9 County Rd".to_string()),
                    program_type: Some("CalFresh".to_string()),
                },
                Utc::now(),
            )
            .await
            .expect("insert social");

        Reconciler::new(db.clone(), fixed_clock())
            .run()
            .await
            .expect("reconcile");
        Deriver::new(db.clone(), fixed_clock(), DeriveSettings::default())
            .run(CaseStatus::Eligible)
            .await
            .expect("derive");
    }

    #[tokio::test]
    async fn case_listing_carries_full_names() {
        let db = setup_db().await;
        seed_and_derive(&db).await;

        let rows = list_cases(&db).await.expect("list");
        assert_eq!(rows.len(), 2);
        let names: Vec<_> = rows.iter().filter_map(|row| row.name.as_deref()).collect();
        assert!(names.contains(&"Ana Reyes"));
        assert!(names.contains(&"Ben Okafor"));
        assert!(rows.iter().all(|row| row.status == "eligible"));
    }

    #[tokio::test]
    async fn results_listing_joins_flags_by_student_id() {
        let db = setup_db().await;
        seed_and_derive(&db).await;

        let rows = list_results(&db).await.expect("list");
        assert_eq!(rows.len(), 2);

        let ana = rows
            .iter()
            .find(|row| row.student_id.as_deref() == Some("S-1"))
            .expect("ana row");
        assert_eq!(ana.is_eligible, Some(true));
        assert_eq!(ana.reason.as_deref(), Some("Free"));

        // No student id, so no flag can be joined.
        let ben = rows
            .iter()
            .find(|row| row.case_number.as_deref() == Some("C-7"))
            .expect("ben row");
        assert!(ben.is_eligible.is_none());
        assert_eq!(ben.program_type.as_deref(), Some("CalFresh"));
    }

    #[tokio::test]
    async fn listings_are_empty_on_a_fresh_store() {
        let db = setup_db().await;
        assert!(list_cases(&db).await.expect("cases").is_empty());
        assert!(list_results(&db).await.expect("results").is_empty());
    }
}
