use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, Row, SqlitePool};
use thiserror::Error;

use benelink_core::types::{
    Beneficiary, Case, CaseStatus, EnrollmentRecord, EnrollmentRow, Identity, SocialServicesRecord,
    SocialServicesRow,
};

/// SQLite error code raised on unique-constraint violations.
const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";
/// SQLite error code raised on primary-key violations.
const SQLITE_CONSTRAINT_PRIMARYKEY: &str = "1555";

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for the enrollment-feed raw store.
    pub fn enrollment(&self) -> EnrollmentRepository {
        EnrollmentRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the social-services-feed raw store.
    pub fn social_services(&self) -> SocialServicesRepository {
        SocialServicesRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the canonical beneficiary table.
    pub fn beneficiaries(&self) -> BeneficiaryRepository {
        BeneficiaryRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to operate on benefit cases.
    pub fn cases(&self) -> CaseRepository {
        CaseRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for persisted eligibility applications.
    pub fn applications(&self) -> ApplicationRepository {
        ApplicationRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for per-student eligibility flags.
    pub fn eligibility_flags(&self) -> EligibilityFlagRepository {
        EligibilityFlagRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result of attempting to insert into a raw feed store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawInsertOutcome {
    Inserted,
    Duplicate,
}

impl RawInsertOutcome {
    pub fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// Error type shared by the raw feed repositories.
#[derive(Debug, Error)]
pub enum RawFeedError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            Some(SQLITE_CONSTRAINT_UNIQUE) | Some(SQLITE_CONSTRAINT_PRIMARYKEY)
        ),
        _ => false,
    }
}

/// Repository for the `enrollment_raw` table.
#[derive(Clone)]
pub struct EnrollmentRepository {
    pool: SqlitePool,
}

impl EnrollmentRepository {
    /// Appends a validated enrollment row, deduplicating on the student id.
    pub async fn insert(
        &self,
        row: &EnrollmentRow,
        imported_at: DateTime<Utc>,
    ) -> Result<RawInsertOutcome, RawFeedError> {
        let result = sqlx::query(
            "INSERT INTO enrollment_raw \
             (student_id, first_name, last_name, dob, address, school_name, grade, meal_status, imported_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.student_id)
        .bind(&row.first_name)
        .bind(&row.last_name)
        .bind(row.dob)
        .bind(&row.address)
        .bind(&row.school_name)
        .bind(row.grade)
        .bind(&row.meal_status)
        .bind(to_rfc3339(imported_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(RawInsertOutcome::Inserted),
            Err(err) if unique_violation(&err) => Ok(RawInsertOutcome::Duplicate),
            Err(err) => Err(RawFeedError::Database(err)),
        }
    }

    /// Lists every stored row ordered by store id.
    pub async fn list(&self) -> Result<Vec<EnrollmentRecord>, RawFeedError> {
        let rows = sqlx::query_as::<_, EnrollmentRowDb>(
            "SELECT id, student_id, first_name, last_name, dob, address, school_name, grade, meal_status, imported_at \
             FROM enrollment_raw ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(EnrollmentRowDb::into_domain).collect())
    }

    pub async fn count(&self) -> Result<i64, RawFeedError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM enrollment_raw")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EnrollmentRowDb {
    id: i64,
    student_id: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    dob: Option<NaiveDate>,
    address: Option<String>,
    school_name: Option<String>,
    grade: Option<i64>,
    meal_status: Option<String>,
    imported_at: DateTime<Utc>,
}

impl EnrollmentRowDb {
    fn into_domain(self) -> EnrollmentRecord {
        EnrollmentRecord {
            id: self.id,
            student_id: self.student_id,
            first_name: self.first_name,
            last_name: self.last_name,
            dob: self.dob,
            address: self.address,
            school_name: self.school_name,
            grade: self.grade,
            meal_status: self.meal_status,
            imported_at: self.imported_at,
        }
    }
}

/// Repository for the `social_services_raw` table.
#[derive(Clone)]
pub struct SocialServicesRepository {
    pool: SqlitePool,
}

impl SocialServicesRepository {
    /// Appends a validated social-services row, deduplicating on the case number.
    pub async fn insert(
        &self,
        row: &SocialServicesRow,
        imported_at: DateTime<Utc>,
    ) -> Result<RawInsertOutcome, RawFeedError> {
        let result = sqlx::query(
            "INSERT INTO social_services_raw \
             (case_number, first_name, last_name, dob, address, program_type, imported_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.case_number)
        .bind(&row.first_name)
        .bind(&row.last_name)
        .bind(row.dob)
        .bind(&row.address)
        .bind(&row.program_type)
        .bind(to_rfc3339(imported_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(RawInsertOutcome::Inserted),
            Err(err) if unique_violation(&err) => Ok(RawInsertOutcome::Duplicate),
            Err(err) => Err(RawFeedError::Database(err)),
        }
    }

    /// Lists every stored row ordered by store id.
    pub async fn list(&self) -> Result<Vec<SocialServicesRecord>, RawFeedError> {
        let rows = sqlx::query_as::<_, SocialServicesRowDb>(
            "SELECT id, case_number, first_name, last_name, dob, address, program_type, imported_at \
             FROM social_services_raw ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(SocialServicesRowDb::into_domain)
            .collect())
    }

    pub async fn count(&self) -> Result<i64, RawFeedError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM social_services_raw")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SocialServicesRowDb {
    id: i64,
    case_number: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    dob: Option<NaiveDate>,
    address: Option<String>,
    program_type: Option<String>,
    imported_at: DateTime<Utc>,
}

impl SocialServicesRowDb {
    fn into_domain(self) -> SocialServicesRecord {
        SocialServicesRecord {
            id: self.id,
            case_number: self.case_number,
            first_name: self.first_name,
            last_name: self.last_name,
            dob: self.dob,
            address: self.address,
            program_type: self.program_type,
            imported_at: self.imported_at,
        }
    }
}

/// Data required to create a beneficiary row.
pub struct NewBeneficiary<'a> {
    pub first_name: &'a str,
    pub last_name: &'a str,
    pub dob: NaiveDate,
    pub student_id: Option<&'a str>,
    pub address: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

/// Result of attempting to insert a beneficiary, carrying the row id of
/// either the new row or the pre-existing one for the same identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeneficiaryInsertOutcome {
    Inserted(i64),
    Existing(i64),
}

impl BeneficiaryInsertOutcome {
    pub fn id(self) -> i64 {
        match self {
            Self::Inserted(id) | Self::Existing(id) => id,
        }
    }

    pub fn is_new(self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Errors raised by the beneficiary repository.
#[derive(Debug, Error)]
pub enum BeneficiaryError {
    #[error("beneficiary row vanished after unique-key conflict")]
    ConflictWithoutRow,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the canonical `beneficiaries` table.
#[derive(Clone)]
pub struct BeneficiaryRepository {
    pool: SqlitePool,
}

impl BeneficiaryRepository {
    /// Inserts a beneficiary unless one already exists for the identity.
    pub async fn insert_if_absent(
        &self,
        record: &NewBeneficiary<'_>,
    ) -> Result<BeneficiaryInsertOutcome, BeneficiaryError> {
        let result = sqlx::query(
            "INSERT INTO beneficiaries (first_name, last_name, dob, student_id, address, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.first_name)
        .bind(record.last_name)
        .bind(record.dob)
        .bind(record.student_id)
        .bind(record.address)
        .bind(to_rfc3339(record.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(BeneficiaryInsertOutcome::Inserted(done.last_insert_rowid())),
            Err(err) if unique_violation(&err) => {
                let identity = Identity {
                    first_name: record.first_name.to_string(),
                    last_name: record.last_name.to_string(),
                    dob: record.dob,
                };
                match self.find_id(&identity).await? {
                    Some(id) => Ok(BeneficiaryInsertOutcome::Existing(id)),
                    None => Err(BeneficiaryError::ConflictWithoutRow),
                }
            }
            Err(err) => Err(BeneficiaryError::Database(err)),
        }
    }

    /// Resolves the beneficiary id for an identity, if one exists.
    pub async fn find_id(&self, identity: &Identity) -> Result<Option<i64>, BeneficiaryError> {
        let row = sqlx::query(
            "SELECT id FROM beneficiaries WHERE first_name = ? AND last_name = ? AND dob = ?",
        )
        .bind(&identity.first_name)
        .bind(&identity.last_name)
        .bind(identity.dob)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| row.get("id")))
    }

    /// Lists every beneficiary ordered by row id.
    pub async fn list(&self) -> Result<Vec<Beneficiary>, BeneficiaryError> {
        let rows = sqlx::query_as::<_, BeneficiaryRowDb>(
            "SELECT id, first_name, last_name, dob, student_id, address FROM beneficiaries ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(BeneficiaryRowDb::into_domain).collect())
    }

    pub async fn count(&self) -> Result<i64, BeneficiaryError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM beneficiaries")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BeneficiaryRowDb {
    id: i64,
    first_name: String,
    last_name: String,
    dob: NaiveDate,
    student_id: Option<String>,
    address: Option<String>,
}

impl BeneficiaryRowDb {
    fn into_domain(self) -> Beneficiary {
        Beneficiary {
            id: self.id,
            first_name: self.first_name,
            last_name: self.last_name,
            dob: self.dob,
            student_id: self.student_id,
            address: self.address,
        }
    }
}

/// Data required to open a benefit case.
pub struct NewCase<'a> {
    pub case_id: String,
    pub beneficiary_id: i64,
    pub status: CaseStatus,
    pub created_at: DateTime<Utc>,
    pub eligibility_reason: Option<&'a str>,
}

/// Result of attempting to open a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseInsertOutcome {
    Opened,
    Existing,
}

impl CaseInsertOutcome {
    pub fn is_new(self) -> bool {
        matches!(self, Self::Opened)
    }
}

/// Errors raised by the case repository.
#[derive(Debug, Error)]
pub enum CaseError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the `cases` table.
#[derive(Clone)]
pub struct CaseRepository {
    pool: SqlitePool,
}

impl CaseRepository {
    /// Opens a case unless the beneficiary already has one.
    pub async fn insert_if_absent(
        &self,
        record: &NewCase<'_>,
    ) -> Result<CaseInsertOutcome, CaseError> {
        let created = to_rfc3339(record.created_at);
        let result = sqlx::query(
            "INSERT INTO cases \
             (case_id, beneficiary_id, status, created_at, last_modified, eligibility_reason, documents) \
             VALUES (?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(&record.case_id)
        .bind(record.beneficiary_id)
        .bind(record.status.as_str())
        .bind(&created)
        .bind(&created)
        .bind(record.eligibility_reason)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(CaseInsertOutcome::Opened),
            Err(err) if unique_violation(&err) => Ok(CaseInsertOutcome::Existing),
            Err(err) => Err(CaseError::Database(err)),
        }
    }

    /// Lists cases joined to the beneficiary full name, newest first.
    pub async fn list_with_beneficiary(&self) -> Result<Vec<CaseWithBeneficiary>, CaseError> {
        let rows = sqlx::query_as::<_, CaseWithBeneficiary>(
            "SELECT c.case_id, \
                    b.first_name || ' ' || b.last_name AS beneficiary_name, \
                    c.beneficiary_id, c.status, c.created_at, c.last_modified, \
                    c.eligibility_reason, c.documents, c.notes \
             FROM cases AS c \
             LEFT JOIN beneficiaries AS b ON b.id = c.beneficiary_id \
             ORDER BY c.created_at DESC, c.case_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn count(&self) -> Result<i64, CaseError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM cases")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

/// Case row joined with the beneficiary's display name.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CaseWithBeneficiary {
    pub case_id: String,
    pub beneficiary_name: Option<String>,
    pub beneficiary_id: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub eligibility_reason: Option<String>,
    pub documents: i64,
    pub notes: Option<String>,
}

impl CaseWithBeneficiary {
    /// Converts the joined row into a domain case, dropping the name.
    pub fn into_domain(self) -> Case {
        let status = self.status.parse().unwrap_or(CaseStatus::Pending);
        Case {
            case_id: self.case_id,
            beneficiary_id: self.beneficiary_id,
            status,
            created_at: self.created_at,
            last_modified: self.last_modified,
            eligibility_reason: self.eligibility_reason,
            documents: self.documents,
            notes: self.notes,
        }
    }
}

/// Data persisted when an identified applicant submits an eligibility check.
pub struct NewApplication<'a> {
    pub customer_id: i64,
    pub household_size: i64,
    pub monthly_income: f64,
    pub has_disability: bool,
    pub is_pregnant: bool,
    pub is_homeless: bool,
    pub receives_snap: bool,
    pub receives_tanf: bool,
    pub receives_fdpir: bool,
    pub submitted_at: DateTime<Utc>,
    pub result: &'a str,
}

/// Errors raised by the application repository.
#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the `eligibility_applications` table.
#[derive(Clone)]
pub struct ApplicationRepository {
    pool: SqlitePool,
}

impl ApplicationRepository {
    /// Inserts a new application and returns its id.
    pub async fn insert(&self, record: &NewApplication<'_>) -> Result<i64, ApplicationError> {
        let done = sqlx::query(
            "INSERT INTO eligibility_applications \
             (customer_id, household_size, monthly_income, has_disability, is_pregnant, is_homeless, \
              receives_snap, receives_tanf, receives_fdpir, submitted_at, result) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.customer_id)
        .bind(record.household_size)
        .bind(record.monthly_income)
        .bind(record.has_disability)
        .bind(record.is_pregnant)
        .bind(record.is_homeless)
        .bind(record.receives_snap)
        .bind(record.receives_tanf)
        .bind(record.receives_fdpir)
        .bind(to_rfc3339(record.submitted_at))
        .bind(record.result)
        .execute(&self.pool)
        .await?;

        Ok(done.last_insert_rowid())
    }

    /// Fetches a persisted application by id.
    pub async fn fetch(&self, application_id: i64) -> Result<Option<ApplicationRow>, ApplicationError> {
        let row = sqlx::query_as::<_, ApplicationRow>(
            "SELECT application_id, customer_id, household_size, monthly_income, has_disability, \
                    is_pregnant, is_homeless, receives_snap, receives_tanf, receives_fdpir, \
                    submitted_at, result \
             FROM eligibility_applications WHERE application_id = ?",
        )
        .bind(application_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}

/// Persisted application row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApplicationRow {
    pub application_id: i64,
    pub customer_id: i64,
    pub household_size: i64,
    pub monthly_income: f64,
    pub has_disability: bool,
    pub is_pregnant: bool,
    pub is_homeless: bool,
    pub receives_snap: bool,
    pub receives_tanf: bool,
    pub receives_fdpir: bool,
    pub submitted_at: DateTime<Utc>,
    pub result: String,
}

/// Per-student eligibility flag surfaced by the results listing.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct EligibilityFlag {
    pub student_id: String,
    pub is_eligible: bool,
    pub reason: Option<String>,
}

/// Errors raised by the eligibility-flag repository.
#[derive(Debug, Error)]
pub enum EligibilityFlagError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the `eligibility_flags` table.
#[derive(Clone)]
pub struct EligibilityFlagRepository {
    pool: SqlitePool,
}

impl EligibilityFlagRepository {
    /// Inserts or refreshes the flag for a student.
    pub async fn upsert(
        &self,
        student_id: &str,
        is_eligible: bool,
        reason: Option<&str>,
        updated_at: DateTime<Utc>,
    ) -> Result<(), EligibilityFlagError> {
        sqlx::query(
            "INSERT INTO eligibility_flags (student_id, is_eligible, reason, updated_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(student_id) DO UPDATE \
             SET is_eligible = excluded.is_eligible, \
                 reason = excluded.reason, \
                 updated_at = excluded.updated_at",
        )
        .bind(student_id)
        .bind(is_eligible)
        .bind(reason)
        .bind(to_rfc3339(updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetches the flag for a student, if any.
    pub async fn fetch(
        &self,
        student_id: &str,
    ) -> Result<Option<EligibilityFlag>, EligibilityFlagError> {
        let row = sqlx::query_as::<_, EligibilityFlag>(
            "SELECT student_id, is_eligible, reason FROM eligibility_flags WHERE student_id = ?",
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Lists every stored flag.
    pub async fn list(&self) -> Result<Vec<EligibilityFlag>, EligibilityFlagError> {
        let rows = sqlx::query_as::<_, EligibilityFlag>(
            "SELECT student_id, is_eligible, reason FROM eligibility_flags ORDER BY student_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
