use chrono::NaiveDate;
use shared::domain::{CitizenId, FeeRecordId, ResidencyStatus};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("transition {from} -> {to} is not allowed")]
    InvalidTransition {
        from: ResidencyStatus,
        to: ResidencyStatus,
    },
    #[error("missing required field '{0}'")]
    MissingField(String),
    #[error("start date {start} must precede expected end date {end}")]
    InvalidDateRange { start: NaiveDate, end: NaiveDate },
    #[error("field '{field}' is malformed: {reason}")]
    MalformedField { field: String, reason: String },
    #[error("field '{0}' is not accepted for this transition")]
    UnexpectedField(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("citizen {0} is deceased; no further transitions are allowed")]
    TerminalState(CitizenId),
    #[error("citizen {0} not found")]
    NotFound(CitizenId),
    #[error("citizen {citizen_id} changed concurrently (expected version {expected}, found {found})")]
    ConcurrentModification {
        citizen_id: CitizenId,
        expected: u64,
        found: u64,
    },
    #[error("citizen {0} record does not match its status history")]
    InconsistentRecord(CitizenId),
    #[error("citizen {0} is already registered")]
    DuplicateCitizen(CitizenId),
    #[error("national id {0} belongs to another citizen")]
    NationalIdTaken(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregateError {
    #[error("fee record {record_id} is malformed: {reason}")]
    MalformedFeeRecord {
        record_id: FeeRecordId,
        reason: String,
    },
    #[error("fee totals overflowed while folding {0}")]
    Overflow(&'static str),
}
