use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(CitizenId);
id_newtype!(HouseholdId);
id_newtype!(FeePeriodId);
id_newtype!(FeeRecordId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Gender {
    #[serde(rename = "Nam")]
    Male,
    #[serde(rename = "Nữ")]
    Female,
}

impl Gender {
    pub fn as_str(self) -> &'static str {
        match self {
            Gender::Male => "Nam",
            Gender::Female => "Nữ",
        }
    }
}

impl FromStr for Gender {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Nam" => Ok(Gender::Male),
            "Nữ" => Ok(Gender::Female),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Administrative residency status of a citizen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResidencyStatus {
    Resident,
    TempAbsent,
    TempResident,
    Deceased,
}

impl ResidencyStatus {
    pub const ALL: [ResidencyStatus; 4] = [
        ResidencyStatus::Resident,
        ResidencyStatus::TempAbsent,
        ResidencyStatus::TempResident,
        ResidencyStatus::Deceased,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResidencyStatus::Resident => "RESIDENT",
            ResidencyStatus::TempAbsent => "TEMP_ABSENT",
            ResidencyStatus::TempResident => "TEMP_RESIDENT",
            ResidencyStatus::Deceased => "DECEASED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ResidencyStatus::Deceased)
    }

    pub fn is_living(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for ResidencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResidencyStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResidencyStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown variant '{0}'")]
pub struct UnknownVariant(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemporaryAbsence {
    pub start_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_end_date: Option<NaiveDate>,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemporaryResidence {
    pub start_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_end_date: Option<NaiveDate>,
    pub prior_permanent_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeathRecord {
    pub date_of_death: NaiveDate,
    pub cause: String,
    pub place_of_death: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub death_certificate_number: Option<String>,
}

/// Detail record attached to every non-resident status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusDetail {
    TempAbsent(TemporaryAbsence),
    TempResident(TemporaryResidence),
    Deceased(DeathRecord),
}

impl StatusDetail {
    pub fn status(&self) -> ResidencyStatus {
        match self {
            StatusDetail::TempAbsent(_) => ResidencyStatus::TempAbsent,
            StatusDetail::TempResident(_) => ResidencyStatus::TempResident,
            StatusDetail::Deceased(_) => ResidencyStatus::Deceased,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citizen {
    pub id: CitizenId,
    pub full_name: String,
    pub birth_date: NaiveDate,
    pub national_id: String,
    pub gender: Gender,
    pub household_id: HouseholdId,
    pub status: ResidencyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<StatusDetail>,
    pub version: u64,
}

impl Citizen {
    /// A newly registered citizen is always a permanent resident.
    pub fn new_resident(
        id: CitizenId,
        full_name: impl Into<String>,
        birth_date: NaiveDate,
        national_id: impl Into<String>,
        gender: Gender,
        household_id: HouseholdId,
    ) -> Self {
        Self {
            id,
            full_name: full_name.into(),
            birth_date,
            national_id: national_id.into(),
            gender,
            household_id,
            status: ResidencyStatus::Resident,
            detail: None,
            version: 0,
        }
    }

    /// Status and detail agree: RESIDENT carries nothing, every other
    /// status carries exactly its own variant.
    pub fn is_consistent(&self) -> bool {
        match (&self.status, &self.detail) {
            (ResidencyStatus::Resident, None) => true,
            (status, Some(detail)) => detail.status() == *status,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(pub String);

impl Actor {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub event_id: Uuid,
    pub citizen_id: CitizenId,
    pub sequence: u64,
    pub previous_status: ResidencyStatus,
    pub new_status: ResidencyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<StatusDetail>,
    pub recorded_at: DateTime<Utc>,
    pub actor: Actor,
}

impl StatusEvent {
    pub fn is_cancellation(&self) -> bool {
        self.new_status == ResidencyStatus::Resident
            && matches!(
                self.previous_status,
                ResidencyStatus::TempAbsent | ResidencyStatus::TempResident
            )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Household {
    pub id: HouseholdId,
    pub code: String,
    pub head_name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePeriod {
    pub id: FeePeriodId,
    pub name: String,
    pub amount_per_member: i64,
    pub starts_on: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_on: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "UNPAID",
            PaymentStatus::Paid => "PAID",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNPAID" => Ok(PaymentStatus::Unpaid),
            "PAID" => Ok(PaymentStatus::Paid),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRecord {
    pub id: FeeRecordId,
    pub period_id: FeePeriodId,
    pub household_id: HouseholdId,
    pub amount_paid: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collected_on: Option<NaiveDate>,
    pub status: PaymentStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    #[test]
    fn status_uses_screaming_snake_case_on_the_wire() {
        let json = serde_json::to_string(&ResidencyStatus::TempAbsent).expect("json");
        assert_eq!(json, "\"TEMP_ABSENT\"");
        assert_eq!(
            "TEMP_RESIDENT".parse::<ResidencyStatus>().expect("parse"),
            ResidencyStatus::TempResident
        );
        let err = "THUONG_TRU".parse::<ResidencyStatus>().expect_err("unknown");
        assert_eq!(err, UnknownVariant("THUONG_TRU".into()));
        assert_eq!(err.to_string(), "unknown variant 'THUONG_TRU'");
    }

    #[test]
    fn gender_round_trips_vietnamese_labels() {
        assert_eq!(serde_json::to_string(&Gender::Female).expect("json"), "\"Nữ\"");
        assert_eq!("Nam".parse::<Gender>().expect("parse"), Gender::Male);
    }

    #[test]
    fn resident_with_detail_is_inconsistent() {
        let mut citizen = Citizen::new_resident(
            CitizenId(1),
            "Nguyen Van A",
            date(1990, 1, 1),
            "001090000001",
            Gender::Male,
            HouseholdId(1),
        );
        assert!(citizen.is_consistent());

        citizen.detail = Some(StatusDetail::TempAbsent(TemporaryAbsence {
            start_date: date(2024, 1, 1),
            expected_end_date: None,
            address: "123 Main".into(),
            reason: None,
        }));
        assert!(!citizen.is_consistent());

        citizen.status = ResidencyStatus::TempAbsent;
        assert!(citizen.is_consistent());
    }
}
