use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upstream systems whose records are reconciled by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedSource {
    /// School-enrollment feed. Natural key: `student_id`.
    Enrollment,
    /// Social-services feed. Natural key: `case_number`.
    SocialServices,
}

impl FeedSource {
    /// Returns the canonical name used across logs and metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enrollment => "enrollment",
            Self::SocialServices => "social_services",
        }
    }

    /// Name of the field carrying the source's natural key.
    pub fn natural_key_field(self) -> &'static str {
        match self {
            Self::Enrollment => "student_id",
            Self::SocialServices => "case_number",
        }
    }
}

impl fmt::Display for FeedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when an inbound source label does not name a known feed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown feed source: {0}")]
pub struct UnknownSource(pub String);

impl FromStr for FeedSource {
    type Err = UnknownSource;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "enrollment" => Ok(Self::Enrollment),
            "social_services" | "social-services" => Ok(Self::SocialServices),
            _ => Err(UnknownSource(value.to_string())),
        }
    }
}

/// Inbound enrollment-feed row. Unknown fields in the source payload are
/// dropped during deserialization; only this schema is ever persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentRow {
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub dob: Option<NaiveDate>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub school_name: Option<String>,
    #[serde(default)]
    pub grade: Option<i64>,
    #[serde(default)]
    pub meal_status: Option<String>,
}

/// Inbound social-services-feed row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SocialServicesRow {
    #[serde(default)]
    pub case_number: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub dob: Option<NaiveDate>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub program_type: Option<String>,
}

/// Stored enrollment row, as returned by the raw store.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrollmentRecord {
    pub id: i64,
    pub student_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub dob: Option<NaiveDate>,
    pub address: Option<String>,
    pub school_name: Option<String>,
    pub grade: Option<i64>,
    pub meal_status: Option<String>,
    pub imported_at: DateTime<Utc>,
}

/// Stored social-services row, as returned by the raw store.
#[derive(Debug, Clone, PartialEq)]
pub struct SocialServicesRecord {
    pub id: i64,
    pub case_number: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub dob: Option<NaiveDate>,
    pub address: Option<String>,
    pub program_type: Option<String>,
    pub imported_at: DateTime<Utc>,
}

/// Join key shared by both feeds. Two rows describe the same person exactly
/// when their identities are equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub first_name: String,
    pub last_name: String,
    pub dob: NaiveDate,
}

impl Identity {
    /// Builds an identity from optional row fields, returning `None` when
    /// any component is missing. Incomplete identities can never join and
    /// would violate the one-beneficiary-per-identity invariant.
    pub fn from_parts(
        first_name: Option<&str>,
        last_name: Option<&str>,
        dob: Option<NaiveDate>,
    ) -> Option<Self> {
        Some(Self {
            first_name: first_name?.to_string(),
            last_name: last_name?.to_string(),
            dob: dob?,
        })
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Canonical beneficiary record produced by reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beneficiary {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub dob: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Beneficiary {
    pub fn identity(&self) -> Identity {
        Identity {
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            dob: self.dob,
        }
    }
}

/// Lifecycle status of a benefit case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pending,
    Eligible,
    Approved,
    Denied,
    Closed,
}

impl CaseStatus {
    /// Returns the canonical database representation for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Eligible => "eligible",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaseStatus {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "eligible" => Ok(Self::Eligible),
            "approved" => Ok(Self::Approved),
            "denied" => Ok(Self::Denied),
            "closed" => Ok(Self::Closed),
            _ => Err(()),
        }
    }
}

/// Benefit case opened for a beneficiary. At most one case exists per
/// beneficiary; the id embeds the program year it was opened in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub case_id: String,
    pub beneficiary_id: i64,
    pub status: CaseStatus,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eligibility_reason: Option<String>,
    pub documents: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Case {
    /// Case ids embed the beneficiary id and the program year.
    pub fn make_id(beneficiary_id: i64, program_year: i32) -> String {
        format!("{beneficiary_id}-{program_year}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_source_parses_known_labels() {
        assert_eq!("enrollment".parse(), Ok(FeedSource::Enrollment));
        assert_eq!("Social-Services".parse(), Ok(FeedSource::SocialServices));
        assert_eq!("social_services".parse(), Ok(FeedSource::SocialServices));
    }

    #[test]
    fn feed_source_rejects_unknown_labels() {
        let err = "payroll".parse::<FeedSource>().unwrap_err();
        assert_eq!(err, UnknownSource("payroll".to_string()));
    }

    #[test]
    fn identity_requires_all_components() {
        let dob = NaiveDate::from_ymd_opt(2015, 4, 2).unwrap();
        assert!(Identity::from_parts(Some("Ana"), Some("Reyes"), Some(dob)).is_some());
        assert!(Identity::from_parts(None, Some("Reyes"), Some(dob)).is_none());
        assert!(Identity::from_parts(Some("Ana"), Some("Reyes"), None).is_none());
    }

    #[test]
    fn enrollment_row_ignores_unknown_fields() {
        let row: EnrollmentRow = serde_json::from_value(serde_json::json!({
            "student_id": "S-100",
            "first_name": "Ana",
            "free_text_column": "ignored",
        }))
        .expect("row deserializes");
        assert_eq!(row.student_id.as_deref(), Some("S-100"));
        assert!(row.meal_status.is_none());
    }

    #[test]
    fn case_id_embeds_program_year() {
        assert_eq!(Case::make_id(42, 2025), "42-2025");
    }
}
