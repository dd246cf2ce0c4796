//! Legality and field checks for residency-status transitions.
//!
//! Everything here is pure. `validate` never panics: a payload of the wrong
//! shape comes back as a [`ValidationError`] like any other rejected form.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde_json::{Map, Value};
use shared::{
    domain::{
        DeathRecord, ResidencyStatus, StatusDetail, TemporaryAbsence, TemporaryResidence,
    },
    protocol::{CacheKey, DetailForm},
};

use crate::error::ValidationError;

use ResidencyStatus::{Deceased, Resident, TempAbsent, TempResident};

pub const FIELD_START_DATE: &str = "startDate";
pub const FIELD_EXPECTED_END_DATE: &str = "expectedEndDate";
pub const FIELD_ADDRESS: &str = "address";
pub const FIELD_PRIOR_PERMANENT_ADDRESS: &str = "priorPermanentAddress";
pub const FIELD_REASON: &str = "reason";
pub const FIELD_DATE_OF_DEATH: &str = "dateOfDeath";
pub const FIELD_CAUSE: &str = "cause";
pub const FIELD_PLACE_OF_DEATH: &str = "placeOfDeath";
pub const FIELD_DEATH_CERTIFICATE_NUMBER: &str = "deathCertificateNumber";

const DATE_FORMAT: &str = "%Y-%m-%d";

const TEMP_ABSENT_FIELDS: &[&str] = &[
    FIELD_START_DATE,
    FIELD_EXPECTED_END_DATE,
    FIELD_ADDRESS,
    FIELD_REASON,
];
const TEMP_RESIDENT_FIELDS: &[&str] = &[
    FIELD_START_DATE,
    FIELD_EXPECTED_END_DATE,
    FIELD_PRIOR_PERMANENT_ADDRESS,
    FIELD_REASON,
];
const DECEASED_FIELDS: &[&str] = &[
    FIELD_DATE_OF_DEATH,
    FIELD_CAUSE,
    FIELD_PLACE_OF_DEATH,
    FIELD_DEATH_CERTIFICATE_NUMBER,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTransition {
    pub from: ResidencyStatus,
    pub to: ResidencyStatus,
    /// `None` exactly when `to` is RESIDENT.
    pub detail: Option<StatusDetail>,
}

pub type ValidationResult = Result<ValidatedTransition, ValidationError>;

pub fn is_legal(from: ResidencyStatus, to: ResidencyStatus) -> bool {
    matches!(
        (from, to),
        (Resident, TempAbsent)
            | (Resident, TempResident)
            | (Resident, Deceased)
            | (TempAbsent, Resident)
            | (TempAbsent, Deceased)
            | (TempResident, Resident)
            | (TempResident, Deceased)
    )
}

pub fn legal_targets(from: ResidencyStatus) -> Vec<ResidencyStatus> {
    ResidencyStatus::ALL
        .into_iter()
        .filter(|to| is_legal(from, *to))
        .collect()
}

pub fn is_cancellation(from: ResidencyStatus, to: ResidencyStatus) -> bool {
    to == Resident && matches!(from, TempAbsent | TempResident)
}

/// Cancels and death registrations are the transitions a user should confirm.
pub fn is_destructive(from: ResidencyStatus, to: ResidencyStatus) -> bool {
    is_cancellation(from, to) || to == Deceased
}

/// Aggregates whose inputs change when a citizen moves `from -> to`.
///
/// Gender and age statistics count living citizens, and fee liability is
/// owed per living member, so only a death moves any of them.
pub fn affected_aggregates(from: ResidencyStatus, to: ResidencyStatus) -> BTreeSet<CacheKey> {
    if from.is_living() && to == Deceased {
        CacheKey::ALL.into_iter().collect()
    } else {
        BTreeSet::new()
    }
}

pub fn validate(
    current: ResidencyStatus,
    requested: ResidencyStatus,
    detail: &DetailForm,
) -> ValidationResult {
    if !is_legal(current, requested) {
        return Err(ValidationError::InvalidTransition {
            from: current,
            to: requested,
        });
    }

    let form = FormFields::parse(detail)?;
    form.reject_unexpected(allowed_fields(requested))?;

    let detail = match requested {
        Resident => None,
        TempAbsent => {
            let start_date = form.required_date(FIELD_START_DATE)?;
            let address = form.required_text(FIELD_ADDRESS)?;
            let expected_end_date = form.optional_date(FIELD_EXPECTED_END_DATE)?;
            check_date_range(start_date, expected_end_date)?;
            Some(StatusDetail::TempAbsent(TemporaryAbsence {
                start_date,
                expected_end_date,
                address,
                reason: form.optional_text(FIELD_REASON)?,
            }))
        }
        TempResident => {
            let start_date = form.required_date(FIELD_START_DATE)?;
            let prior_permanent_address = form.required_text(FIELD_PRIOR_PERMANENT_ADDRESS)?;
            let expected_end_date = form.optional_date(FIELD_EXPECTED_END_DATE)?;
            check_date_range(start_date, expected_end_date)?;
            Some(StatusDetail::TempResident(TemporaryResidence {
                start_date,
                expected_end_date,
                prior_permanent_address,
                reason: form.optional_text(FIELD_REASON)?,
            }))
        }
        Deceased => Some(StatusDetail::Deceased(DeathRecord {
            date_of_death: form.required_date(FIELD_DATE_OF_DEATH)?,
            cause: form.required_text(FIELD_CAUSE)?,
            place_of_death: form.required_text(FIELD_PLACE_OF_DEATH)?,
            death_certificate_number: form.optional_text(FIELD_DEATH_CERTIFICATE_NUMBER)?,
        })),
    };

    Ok(ValidatedTransition {
        from: current,
        to: requested,
        detail,
    })
}

fn allowed_fields(target: ResidencyStatus) -> &'static [&'static str] {
    match target {
        Resident => &[],
        TempAbsent => TEMP_ABSENT_FIELDS,
        TempResident => TEMP_RESIDENT_FIELDS,
        Deceased => DECEASED_FIELDS,
    }
}

fn check_date_range(start: NaiveDate, end: Option<NaiveDate>) -> Result<(), ValidationError> {
    match end {
        Some(end) if start >= end => Err(ValidationError::InvalidDateRange { start, end }),
        _ => Ok(()),
    }
}

struct FormFields<'a> {
    fields: Option<&'a Map<String, Value>>,
}

impl<'a> FormFields<'a> {
    fn parse(form: &'a DetailForm) -> Result<Self, ValidationError> {
        match form.as_value() {
            Value::Null => Ok(Self { fields: None }),
            Value::Object(map) => Ok(Self { fields: Some(map) }),
            _ => Err(ValidationError::MalformedField {
                field: "detail".into(),
                reason: "expected an object".into(),
            }),
        }
    }

    fn reject_unexpected(&self, allowed: &[&str]) -> Result<(), ValidationError> {
        let Some(fields) = self.fields else {
            return Ok(());
        };
        match fields.keys().find(|key| !allowed.contains(&key.as_str())) {
            Some(key) => Err(ValidationError::UnexpectedField(key.clone())),
            None => Ok(()),
        }
    }

    /// Trimmed text; blank strings and JSON nulls count as absent.
    fn text(&self, field: &str) -> Result<Option<String>, ValidationError> {
        let Some(value) = self.fields.and_then(|fields| fields.get(field)) else {
            return Ok(None);
        };
        match value {
            Value::Null => Ok(None),
            Value::String(raw) => {
                let trimmed = raw.trim();
                Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
            }
            _ => Err(ValidationError::MalformedField {
                field: field.to_string(),
                reason: "expected a string".into(),
            }),
        }
    }

    fn optional_text(&self, field: &str) -> Result<Option<String>, ValidationError> {
        self.text(field)
    }

    fn required_text(&self, field: &str) -> Result<String, ValidationError> {
        self.text(field)?
            .ok_or_else(|| ValidationError::MissingField(field.to_string()))
    }

    fn optional_date(&self, field: &str) -> Result<Option<NaiveDate>, ValidationError> {
        self.text(field)?
            .map(|raw| {
                NaiveDate::parse_from_str(&raw, DATE_FORMAT).map_err(|_| {
                    ValidationError::MalformedField {
                        field: field.to_string(),
                        reason: format!("'{raw}' is not a YYYY-MM-DD date"),
                    }
                })
            })
            .transpose()
    }

    fn required_date(&self, field: &str) -> Result<NaiveDate, ValidationError> {
        self.optional_date(field)?
            .ok_or_else(|| ValidationError::MissingField(field.to_string()))
    }
}

#[cfg(test)]
#[path = "tests/validator_tests.rs"]
mod tests;
