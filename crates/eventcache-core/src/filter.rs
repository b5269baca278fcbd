//! Past-item filter.
//!
//! Drops listings whose start time is known to be in the past. Anything that
//! cannot be parsed is kept: showing a listing that may already have started
//! is better than hiding one that has not.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::models::Record;

/// Naive date-time layouts accepted in addition to RFC 3339. Interpreted as UTC.
const NAIVE_DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartTime {
    At(DateTime<Utc>),
    Date(NaiveDate),
}

fn parse_start_time(raw: &str) -> Option<StartTime> {
    let raw = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(StartTime::At(dt.with_timezone(&Utc)));
    }

    // Some sources emit a trailing Z without seconds, e.g. "2026-05-01T19:00Z"
    let without_z = raw.strip_suffix('Z').unwrap_or(raw);
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(without_z, format) {
            return Some(StartTime::At(naive.and_utc()));
        }
    }

    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .ok()
        .map(StartTime::Date)
}

/// True iff the record's start time parsed and lies strictly before `now`.
/// Date-only values are compared by calendar day, so a listing dated today is
/// kept.
pub fn has_started(record: &Record, now: DateTime<Utc>) -> bool {
    match record.start_time().and_then(parse_start_time) {
        Some(StartTime::At(start)) => start < now,
        Some(StartTime::Date(day)) => day < now.date_naive(),
        None => false,
    }
}

/// Remove records that have already started, preserving order.
pub fn filter_past(records: Vec<Record>, now: DateTime<Utc>) -> Vec<Record> {
    records
        .into_iter()
        .filter(|record| !has_started(record, now))
        .collect()
}
