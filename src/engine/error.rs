use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{BookingStatus, Span};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("{span} conflicts with bookings {bookings:?} and breaks {breaks:?}")]
    Conflict {
        span: Span,
        bookings: Vec<Ulid>,
        breaks: Vec<Ulid>,
    },
    #[error("booking {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("end must be strictly after start")]
    EndNotAfterStart,
    #[error("weekday {0} out of range 0..=6")]
    WeekdayOutOfRange(u8),
    #[error("start {0} is in the past")]
    StartInPast(i64),
    #[error("{field} = {value} outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("provider {0} is not active")]
    ProviderInactive(Ulid),
    #[error("daily limit of {limit} bookings reached on {date}")]
    DailyLimitReached { date: NaiveDate, limit: u32 },
    #[error("{0} too long")]
    TextTooLong(&'static str),
}
