//! Conversions between local calendar values and `Ms` instants.
//!
//! Weekly availability is expressed in local wall-clock time; everything the
//! engine stores is an absolute instant. All conversions go through the
//! tenant's IANA timezone.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;

use crate::model::{Ms, Span};

/// Weekday index with Monday = 0 .. Sunday = 6.
pub fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_monday() as u8
}

/// Instant of a local date + time-of-day. `None` when the wall-clock time
/// does not exist in `tz` (DST gap). Ambiguous times resolve to the earlier one.
pub fn to_ms(date: NaiveDate, time: NaiveTime, tz: Tz) -> Option<Ms> {
    tz.from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

/// Local calendar date an instant falls on.
pub fn local_date(ms: Ms, tz: Tz) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.with_timezone(&tz).date_naive())
}

/// The `[start, end)` window on `date` in `tz`, if both ends exist and are ordered.
pub fn day_window(date: NaiveDate, start: NaiveTime, end: NaiveTime, tz: Tz) -> Option<Span> {
    let s = to_ms(date, start, tz)?;
    let e = to_ms(date, end, tz)?;
    (s < e).then(|| Span::new(s, e))
}

pub fn format_date(ms: Ms, tz: Tz) -> String {
    match DateTime::from_timestamp_millis(ms) {
        Some(dt) => dt.with_timezone(&tz).format("%Y-%m-%d").to_string(),
        None => ms.to_string(),
    }
}

pub fn format_time(ms: Ms, tz: Tz) -> String {
    match DateTime::from_timestamp_millis(ms) {
        Some(dt) => dt.with_timezone(&tz).format("%H:%M").to_string(),
        None => ms.to_string(),
    }
}
