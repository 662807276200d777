use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Monthly income limits for household sizes 1 through 8 (130% of the
/// federal poverty guideline, published yearly).
const INCOME_LIMITS: [f64; 8] = [
    1580.0, 2137.0, 2694.0, 3250.0, 3807.0, 4364.0, 4921.0, 5478.0,
];

/// Additional monthly allowance per household member beyond eight.
const EXTRA_MEMBER_ALLOWANCE: f64 = 557.0;

/// Applicant-supplied household data evaluated by the rules engine.
///
/// `household_size` and `monthly_income` are optional so that the engine,
/// not the caller, decides what a missing field means; everything else
/// defaults to `false` the way an unchecked form field does.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EligibilityRequest {
    #[serde(default)]
    pub household_size: Option<u32>,
    #[serde(default)]
    pub monthly_income: Option<f64>,
    #[serde(default)]
    pub receives_snap: bool,
    #[serde(default)]
    pub receives_tanf: bool,
    #[serde(default)]
    pub receives_fdpir: bool,
    #[serde(default)]
    pub is_homeless: bool,
    #[serde(default)]
    pub has_disability: bool,
    #[serde(default)]
    pub is_pregnant: bool,
}

impl EligibilityRequest {
    /// Returns `true` when any categorical program qualifies the household
    /// regardless of income.
    pub fn auto_qualifies(&self) -> bool {
        self.receives_snap || self.receives_tanf || self.receives_fdpir || self.is_homeless
    }
}

/// How an eligibility decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EligibilityCategory {
    /// Qualified through participation in another assistance program.
    Categorical,
    /// Decided by comparing household income against the published limit.
    Income,
}

impl EligibilityCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Categorical => "Categorical",
            Self::Income => "Income",
        }
    }
}

/// Outcome of a single rules-engine evaluation. Produced fresh on every
/// call; persisted only when an identified applicant submits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilityResult {
    pub eligible: bool,
    pub category: EligibilityCategory,
    pub reason: String,
    pub income_limit: f64,
    pub monthly_income: f64,
}

impl EligibilityResult {
    /// Label stored on persisted applications.
    pub fn result_label(&self) -> &'static str {
        if self.eligible {
            "Eligible"
        } else {
            "Not Eligible"
        }
    }
}

/// Validation failures reported before any rule is applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RulesError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("household_size must be at least 1")]
    InvalidHouseholdSize,
}

/// Returns the monthly income limit for the given household size. Sizes
/// beyond the published table extend linearly per additional member.
pub fn income_limit(household_size: u32) -> f64 {
    let size = household_size.max(1) as usize;
    if size <= INCOME_LIMITS.len() {
        INCOME_LIMITS[size - 1]
    } else {
        INCOME_LIMITS[INCOME_LIMITS.len() - 1]
            + (size - INCOME_LIMITS.len()) as f64 * EXTRA_MEMBER_ALLOWANCE
    }
}

/// Evaluates meal-program eligibility for one household.
///
/// Pure function: no I/O, safe to call concurrently. Categorical
/// participation wins over the income comparison.
pub fn evaluate(request: &EligibilityRequest) -> Result<EligibilityResult, RulesError> {
    let household_size = request
        .household_size
        .ok_or(RulesError::MissingField("household_size"))?;
    let monthly_income = request
        .monthly_income
        .ok_or(RulesError::MissingField("monthly_income"))?;
    if household_size < 1 {
        return Err(RulesError::InvalidHouseholdSize);
    }

    let income_limit = income_limit(household_size);

    if request.auto_qualifies() {
        return Ok(EligibilityResult {
            eligible: true,
            category: EligibilityCategory::Categorical,
            reason: "Automatically qualified based on program participation".to_string(),
            income_limit,
            monthly_income,
        });
    }

    if monthly_income <= income_limit {
        Ok(EligibilityResult {
            eligible: true,
            category: EligibilityCategory::Income,
            reason: format!(
                "Household income (${monthly_income}) is within limit (${income_limit})"
            ),
            income_limit,
            monthly_income,
        })
    } else {
        Ok(EligibilityResult {
            eligible: false,
            category: EligibilityCategory::Income,
            reason: format!(
                "Household income (${monthly_income}) exceeds limit (${income_limit})"
            ),
            income_limit,
            monthly_income,
        })
    }
}
