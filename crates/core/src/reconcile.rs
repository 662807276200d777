use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::types::{EnrollmentRecord, Identity, SocialServicesRecord};

/// One identity produced by the full outer join of the two raw stores,
/// with attributes coalesced across whichever sides were present.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciledIdentity {
    pub identity: Identity,
    pub student_id: Option<String>,
    pub case_number: Option<String>,
    pub address: Option<String>,
    pub meal_status: Option<String>,
    pub program_type: Option<String>,
}

impl ReconciledIdentity {
    /// Eligibility signal derived from the feeds: the enrollment meal
    /// status when present, otherwise the social-services program type.
    pub fn eligibility_reason(&self) -> Option<&str> {
        self.meal_status.as_deref().or(self.program_type.as_deref())
    }
}

/// Output of [`full_outer_join`], including counts for the rows the join
/// had to drop so callers can log them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinOutcome {
    pub identities: Vec<ReconciledIdentity>,
    /// Rows missing one or more identity components.
    pub incomplete: usize,
    /// Same-source rows collapsed onto an earlier row with the same identity.
    pub collapsed: usize,
}

/// Full outer join of the two raw stores on `(first_name, last_name, dob)`.
///
/// Rows present in only one feed still yield an identity. When several rows
/// of the same source share an identity, the earliest-imported row (lowest
/// store id) wins and the rest are counted as collapsed. Output order is
/// deterministic: enrollment rows by store id, then social-services-only
/// identities in identity order.
pub fn full_outer_join(
    enrollment: &[EnrollmentRecord],
    social: &[SocialServicesRecord],
) -> JoinOutcome {
    let mut outcome = JoinOutcome::default();

    let mut social_by_identity: BTreeMap<Identity, &SocialServicesRecord> = BTreeMap::new();
    let mut social_sorted: Vec<&SocialServicesRecord> = social.iter().collect();
    social_sorted.sort_by_key(|record| record.id);
    for record in social_sorted {
        let Some(identity) = Identity::from_parts(
            record.first_name.as_deref(),
            record.last_name.as_deref(),
            record.dob,
        ) else {
            outcome.incomplete += 1;
            continue;
        };
        if social_by_identity.contains_key(&identity) {
            outcome.collapsed += 1;
        } else {
            social_by_identity.insert(identity, record);
        }
    }

    let mut enrollment_sorted: Vec<&EnrollmentRecord> = enrollment.iter().collect();
    enrollment_sorted.sort_by_key(|record| record.id);
    let mut seen: BTreeSet<Identity> = BTreeSet::new();
    let mut matched: BTreeSet<Identity> = BTreeSet::new();
    for record in enrollment_sorted {
        let Some(identity) = Identity::from_parts(
            record.first_name.as_deref(),
            record.last_name.as_deref(),
            record.dob,
        ) else {
            outcome.incomplete += 1;
            continue;
        };
        if !seen.insert(identity.clone()) {
            outcome.collapsed += 1;
            continue;
        }
        let social_side = social_by_identity.get(&identity).copied();
        if social_side.is_some() {
            matched.insert(identity.clone());
        }
        outcome
            .identities
            .push(coalesce(identity, Some(record), social_side));
    }

    for (identity, record) in &social_by_identity {
        if matched.contains(identity) {
            continue;
        }
        outcome
            .identities
            .push(coalesce(identity.clone(), None, Some(*record)));
    }

    outcome
}

fn coalesce(
    identity: Identity,
    enrollment: Option<&EnrollmentRecord>,
    social: Option<&SocialServicesRecord>,
) -> ReconciledIdentity {
    ReconciledIdentity {
        student_id: enrollment.and_then(|record| record.student_id.clone()),
        case_number: social.and_then(|record| record.case_number.clone()),
        // The social-services address is preferred when both feeds carry one.
        address: social
            .and_then(|record| record.address.clone())
            .or_else(|| enrollment.and_then(|record| record.address.clone())),
        meal_status: enrollment.and_then(|record| record.meal_status.clone()),
        program_type: social.and_then(|record| record.program_type.clone()),
        identity,
    }
}
