use std::{collections::BTreeSet, fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    domain::{
        Actor, Citizen, CitizenId, FeePeriodId, Gender, Household, HouseholdId, PaymentStatus,
        ResidencyStatus, StatusEvent, UnknownVariant,
    },
    error::ApiError,
};

/// Loosely-typed status form as submitted by a UI collaborator. Field names
/// are camelCase (`startDate`, `address`, `dateOfDeath`, ...); nothing is
/// trusted until the validator has turned it into a `StatusDetail`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetailForm(pub Value);

impl DetailForm {
    pub fn empty() -> Self {
        Self(Value::Object(Map::new()))
    }

    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        if !self.0.is_object() {
            self.0 = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.0 {
            map.insert(field.to_string(), value.into());
        }
        self
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

impl From<Value> for DetailForm {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheKey {
    GenderStats,
    AgeStats,
    FeeStats,
}

impl CacheKey {
    pub const ALL: [CacheKey; 3] = [CacheKey::GenderStats, CacheKey::AgeStats, CacheKey::FeeStats];

    pub fn as_str(self) -> &'static str {
        match self {
            CacheKey::GenderStats => "gender-stats",
            CacheKey::AgeStats => "age-stats",
            CacheKey::FeeStats => "fee-stats",
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheKey {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CacheKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenderStats {
    pub male: u64,
    pub female: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AgeStats {
    pub children: u64,
    pub working: u64,
    pub retired: u64,
    pub child_age_threshold: u32,
    pub retirement_age: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeeStats {
    pub total_required: i64,
    pub total_collected: i64,
    /// Collected over required, in basis points.
    pub collection_rate_bp: u64,
    pub households_paid: u64,
    pub households_unpaid: u64,
    pub liable_members: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "stats", rename_all = "snake_case")]
pub enum AggregateData {
    Gender(GenderStats),
    Age(AgeStats),
    Fee(FeeStats),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub key: CacheKey,
    pub computed_at: DateTime<Utc>,
    pub registry_version: u64,
    pub data: AggregateData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    pub citizen: Citizen,
    pub event: StatusEvent,
    pub invalidated: BTreeSet<CacheKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionPreview {
    pub citizen_id: CitizenId,
    pub from: ResidencyStatus,
    pub to: ResidencyStatus,
    pub invalidates: BTreeSet<CacheKey>,
    /// Cancels and death registrations should be confirmed by the user
    /// before the transition is submitted.
    pub requires_confirmation: bool,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionReceipt {
    #[serde(flatten)]
    pub commit: CommitResult,
    /// False when the commit stands in the registry but the mirror write
    /// to persistence failed.
    pub persisted: bool,
}

/// Outcome of a change to a citizen's non-status fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitizenUpdateReceipt {
    pub citizen: Citizen,
    pub invalidated: BTreeSet<CacheKey>,
    pub persisted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRequestBody {
    pub target: ResidencyStatus,
    #[serde(default)]
    pub detail: DetailForm,
    pub actor: Actor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewRequestBody {
    pub target: ResidencyStatus,
    #[serde(default)]
    pub detail: DetailForm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HouseholdMoveRequest {
    pub household_id: HouseholdId,
    pub actor: Actor,
}

/// Identity corrections. Absent fields keep their stored value; status and
/// household have their own operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CitizenUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub national_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    pub actor: Actor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCitizen {
    pub full_name: String,
    pub birth_date: NaiveDate,
    pub national_id: String,
    pub gender: Gender,
    pub household_id: HouseholdId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewHousehold {
    pub code: String,
    pub head_name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFeePeriod {
    pub name: String,
    pub amount_per_member: i64,
    pub starts_on: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_on: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFeeRecord {
    pub period_id: FeePeriodId,
    pub household_id: HouseholdId,
    pub amount_paid: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collected_on: Option<NaiveDate>,
    pub status: PaymentStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CitizenQuery {
    /// Case-insensitive match against full name or national ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResidencyStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub household_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FeeRecordQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub household_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_id: Option<i64>,
}

/// A household that owes for a period and has no PAID record in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnpaidHousehold {
    #[serde(flatten)]
    pub household: Household,
    pub period_id: FeePeriodId,
    pub living_members: u64,
    pub amount_due: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HouseholdSummary {
    #[serde(flatten)]
    pub household: Household,
    pub member_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RegistryEvent {
    StatusChanged {
        event: StatusEvent,
    },
    HouseholdChanged {
        citizen_id: CitizenId,
        household_id: HouseholdId,
    },
    CitizenUpdated {
        citizen: Citizen,
    },
    AggregatesInvalidated {
        keys: BTreeSet<CacheKey>,
    },
    Error(ApiError),
}
