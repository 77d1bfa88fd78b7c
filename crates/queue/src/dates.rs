//! Normalisation of event dates that went through JSON.
//!
//! Producers serialize dates in several shapes: RFC 3339 strings, naive date-times,
//! epoch milliseconds, and document-store objects such as `{"$date": ...}` or
//! `{"seconds": ..., "nanoseconds": ...}`. Everything is turned back into a UTC
//! timestamp; unparseable input becomes "now" with a warning.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use tracing::warn;

/// Event keys that hold dates.
pub const DATE_KEYS: [&str; 6] = [
    "startTime",
    "endTime",
    "createdAt",
    "updatedAt",
    "deletedAt",
    "date",
];

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse a date in any supported shape.
#[must_use]
pub fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_date_str(s),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(DateTime::from_timestamp_millis),
        Value::Object(map) => {
            if let Some(inner) = map.get("$date") {
                return parse_date(inner);
            }
            if let Some(inner) = map.get("timestamp") {
                return parse_date(inner);
            }
            let seconds = map
                .get("seconds")
                .or_else(|| map.get("_seconds"))
                .and_then(Value::as_i64)?;
            let nanos = map
                .get("nanoseconds")
                .or_else(|| map.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            DateTime::from_timestamp(seconds, u32::try_from(nanos).ok()?)
        }
        _ => None,
    }
}

fn parse_date_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(ms) = s.parse::<i64>() {
        return DateTime::from_timestamp_millis(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Parse a date, falling back to now for unparseable input.
#[must_use]
pub fn normalize_date(value: &Value) -> DateTime<Utc> {
    parse_date(value).unwrap_or_else(|| {
        warn!(value = %value, "Unparseable date; using current time");
        Utc::now()
    })
}

/// Rewrite the known date keys of an event into RFC 3339 strings.
///
/// Absent and `null` keys are left alone so `deletedAt: null` keeps meaning "not
/// deleted".
pub fn normalize_event_dates(event: &mut Value) {
    let Some(map) = event.as_object_mut() else {
        return;
    };
    for key in DATE_KEYS {
        if let Some(value) = map.get_mut(key) {
            if value.is_null() {
                continue;
            }
            *value = Value::String(normalize_date(value).to_rfc3339());
        }
    }
}
