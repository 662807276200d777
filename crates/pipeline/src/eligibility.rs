use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use benelink_core::rules::{self, EligibilityRequest, EligibilityResult, RulesError};
use benelink_storage::{ApplicationError, Database, NewApplication};

use crate::Clock;

/// Guidance returned alongside an eligible result.
pub const ELIGIBLE_NEXT_STEPS: [&str; 4] = [
    "Complete the full application",
    "Upload required documents",
    "Wait for application review",
    "Receive your EBT card if approved",
];

/// Guidance returned alongside an ineligible result.
pub const NOT_ELIGIBLE_NEXT_STEPS: [&str; 3] = [
    "Check if you qualify for other programs",
    "Contact your local office for assistance",
    "Reapply if your circumstances change",
];

/// Interactive eligibility check as submitted by the transport layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EligibilityCheckRequest {
    #[serde(flatten)]
    pub application: EligibilityRequest,
    /// Present when the applicant is logged in; triggers persistence.
    #[serde(default)]
    pub customer_id: Option<i64>,
}

/// Response mirrored back to the applicant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EligibilityOutcome {
    #[serde(flatten)]
    pub result: EligibilityResult,
    pub next_steps: &'static [&'static str],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_id: Option<i64>,
}

/// Errors raised by the interactive eligibility service.
#[derive(Debug, Error)]
pub enum EligibilityServiceError {
    #[error("invalid application: {0}")]
    Validation(#[from] RulesError),
    #[error("failed to persist application: {0}")]
    Application(#[from] ApplicationError),
}

/// Self-service eligibility check. Evaluation is pure; persistence only
/// happens for identified applicants.
#[derive(Clone)]
pub struct EligibilityService {
    database: Database,
    clock: Clock,
}

impl EligibilityService {
    pub fn new(database: Database, clock: Clock) -> Self {
        Self { database, clock }
    }

    pub async fn check(
        &self,
        request: &EligibilityCheckRequest,
    ) -> Result<EligibilityOutcome, EligibilityServiceError> {
        let result = rules::evaluate(&request.application)?;
        counter!(
            "eligibility_checks_total",
            "eligible" => if result.eligible { "true" } else { "false" }
        )
        .increment(1);
        info!(
            stage = "rules",
            eligible = result.eligible,
            category = result.category.as_str(),
            "eligibility check evaluated"
        );

        let application_id = match request.customer_id {
            Some(customer_id) => {
                Some(self.persist(customer_id, &request.application, &result).await?)
            }
            None => None,
        };

        let next_steps: &'static [&'static str] = if result.eligible {
            &ELIGIBLE_NEXT_STEPS
        } else {
            &NOT_ELIGIBLE_NEXT_STEPS
        };

        Ok(EligibilityOutcome {
            result,
            next_steps,
            application_id,
        })
    }

    async fn persist(
        &self,
        customer_id: i64,
        application: &EligibilityRequest,
        result: &EligibilityResult,
    ) -> Result<i64, EligibilityServiceError> {
        // `evaluate` succeeded, so both required fields are present.
        let household_size = application
            .household_size
            .ok_or(RulesError::MissingField("household_size"))?;
        let monthly_income = application
            .monthly_income
            .ok_or(RulesError::MissingField("monthly_income"))?;

        let application_id = self
            .database
            .applications()
            .insert(&NewApplication {
                customer_id,
                household_size: i64::from(household_size),
                monthly_income,
                has_disability: application.has_disability,
                is_pregnant: application.is_pregnant,
                is_homeless: application.is_homeless,
                receives_snap: application.receives_snap,
                receives_tanf: application.receives_tanf,
                receives_fdpir: application.receives_fdpir,
                submitted_at: (self.clock)(),
                result: result.result_label(),
            })
            .await?;

        Ok(application_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;

    async fn setup_service() -> EligibilityService {
        let db = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        EligibilityService::new(db, Arc::new(Utc::now))
    }

    fn request(household_size: u32, monthly_income: f64) -> EligibilityCheckRequest {
        EligibilityCheckRequest {
            application: EligibilityRequest {
                household_size: Some(household_size),
                monthly_income: Some(monthly_income),
                ..EligibilityRequest::default()
            },
            customer_id: None,
        }
    }

    #[tokio::test]
    async fn anonymous_check_is_not_persisted() {
        let service = setup_service().await;
        let outcome = service.check(&request(4, 3250.0)).await.expect("check");

        assert!(outcome.result.eligible);
        assert_eq!(outcome.next_steps, &ELIGIBLE_NEXT_STEPS);
        assert!(outcome.application_id.is_none());
    }

    #[tokio::test]
    async fn identified_check_persists_an_application() {
        let service = setup_service().await;
        let mut req = request(4, 3251.0);
        req.customer_id = Some(31);
        req.application.receives_tanf = true;

        let outcome = service.check(&req).await.expect("check");
        assert!(outcome.result.eligible);

        let application_id = outcome.application_id.expect("application id");
        let row = service
            .database
            .applications()
            .fetch(application_id)
            .await
            .expect("fetch")
            .expect("row");
        assert_eq!(row.customer_id, 31);
        assert_eq!(row.household_size, 4);
        assert!(row.receives_tanf);
        assert_eq!(row.result, "Eligible");
    }

    #[tokio::test]
    async fn ineligible_check_returns_alternative_steps() {
        let service = setup_service().await;
        let outcome = service.check(&request(2, 9000.0)).await.expect("check");

        assert!(!outcome.result.eligible);
        assert_eq!(outcome.next_steps, &NOT_ELIGIBLE_NEXT_STEPS);
    }

    #[tokio::test]
    async fn missing_fields_surface_as_validation_errors() {
        let service = setup_service().await;
        let err = service
            .check(&EligibilityCheckRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EligibilityServiceError::Validation(RulesError::MissingField("household_size"))
        ));
    }

    #[tokio::test]
    async fn request_deserializes_flat_payload() {
        let req: EligibilityCheckRequest = serde_json::from_value(serde_json::json!({
            "household_size": 9,
            "monthly_income": 6000,
            "receives_snap": false,
            "customer_id": 12,
        }))
        .expect("deserialize");

        assert_eq!(req.application.household_size, Some(9));
        assert_eq!(req.customer_id, Some(12));

        let service = setup_service().await;
        let outcome = service.check(&req).await.expect("check");
        assert_eq!(outcome.result.income_limit, 6035.0);
        assert!(outcome.result.eligible);
    }
}
