//! Wall-clock helpers and lenient timestamp parsing.
//!
//! Backend payloads carry timestamps in several shapes: epoch seconds, epoch
//! milliseconds, numeric strings, RFC 3339 with arbitrary sub-second digits,
//! and naive `YYYY-MM-DD HH:mm[:ss]` strings meant in the device's timezone.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone};
use serde_json::Value;

/// Magnitude below which an event timestamp is read as seconds.
pub const EVENT_SECONDS_THRESHOLD: f64 = 1e11;
/// Magnitude below which an expiry value is read as seconds.
pub const EXPIRY_SECONDS_THRESHOLD: f64 = 1e12;

/// Candidate fields for an event's effective timestamp, in priority order.
pub const EVENT_TIMESTAMP_FIELDS: &[&str] = &[
    "timestamp",
    "ts",
    "time",
    "createdAt",
    "updatedAt",
    "updateTime",
    "startTime",
    "startTimestamp",
];

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| i64::try_from(d.as_millis()).ok())
        .unwrap_or(i64::MAX)
}

/// Parses a JSON value into epoch milliseconds, reading numbers below
/// `seconds_threshold` as seconds.
pub fn parse_epoch_value(value: &Value, seconds_threshold: f64) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_f64().and_then(|n| scale_numeric(n, seconds_threshold)),
        Value::String(s) => parse_epoch_str(s, seconds_threshold),
        _ => None,
    }
}

fn parse_epoch_str(raw: &str, seconds_threshold: f64) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(n) = trimmed.parse::<f64>() {
        return scale_numeric(n, seconds_threshold);
    }
    parse_date_string(trimmed)
}

fn scale_numeric(n: f64, seconds_threshold: f64) -> Option<i64> {
    if !n.is_finite() || n <= 0.0 {
        return None;
    }
    let millis = if n < seconds_threshold { n * 1000.0 } else { n };
    Some(millis.round() as i64)
}

/// Parses a date string into epoch milliseconds.
///
/// Sub-second digits beyond milliseconds are dropped before parsing. Strings
/// without an offset are interpreted in the local timezone.
pub fn parse_date_string(raw: &str) -> Option<i64> {
    let s = truncate_fraction(raw.trim());

    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt.timestamp_millis());
    }

    const NAIVE_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
        "%Y/%m/%d %H:%M:%S",
        "%Y/%m/%d %H:%M",
    ];
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&s, fmt) {
            return Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.timestamp_millis());
        }
    }

    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|dt| dt.timestamp_millis())
}

/// Keeps at most three fractional-second digits.
fn truncate_fraction(s: &str) -> String {
    let Some(dot) = s.find('.') else {
        return s.to_string();
    };
    // Only a dot inside the time part counts.
    if dot < 10 {
        return s.to_string();
    }
    let digits = s[dot + 1..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits <= 3 {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    out.push_str(&s[..=dot + 3]);
    out.push_str(&s[dot + 1 + digits..]);
    out
}

/// Resolves an event's timestamp from the first candidate field that parses.
pub fn event_timestamp(event: &Value) -> Option<i64> {
    EVENT_TIMESTAMP_FIELDS.iter().find_map(|field| {
        event
            .get(*field)
            .and_then(|v| parse_epoch_value(v, EVENT_SECONDS_THRESHOLD))
    })
}

/// Parses an expiry value (seconds vs millis split at 1e12).
pub fn parse_expiry(value: &Value) -> Option<i64> {
    parse_epoch_value(value, EXPIRY_SECONDS_THRESHOLD)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn reference_utc() -> i64 {
        DateTime::parse_from_rfc3339("2024-06-15T12:30:45.123Z")
            .unwrap()
            .timestamp_millis()
    }

    #[test]
    fn test_expiry_epoch_seconds() {
        let parsed = parse_expiry(&json!(1_718_454_645)).unwrap();
        assert!((parsed - reference_utc()).abs() < 1000);
    }

    #[test]
    fn test_expiry_epoch_millis() {
        let parsed = parse_expiry(&json!(1_718_454_645_123_i64)).unwrap();
        assert_eq!(parsed, reference_utc());
    }

    #[test]
    fn test_expiry_numeric_string() {
        let parsed = parse_expiry(&json!("1718454645123")).unwrap();
        assert_eq!(parsed, reference_utc());
        let secs = parse_expiry(&json!(" 1718454645 ")).unwrap();
        assert!((secs - reference_utc()).abs() < 1000);
    }

    #[test]
    fn test_expiry_iso_with_microseconds() {
        let parsed = parse_expiry(&json!("2024-06-15T12:30:45.123456Z")).unwrap();
        assert_eq!(parsed, reference_utc());
        let nanos = parse_expiry(&json!("2024-06-15T14:30:45.123456789+02:00")).unwrap();
        assert_eq!(nanos, reference_utc());
    }

    #[test]
    fn test_expiry_local_form() {
        let expected = Local
            .with_ymd_and_hms(2024, 6, 15, 12, 30, 45)
            .earliest()
            .unwrap()
            .timestamp_millis();
        let parsed = parse_expiry(&json!("2024-06-15 12:30:45")).unwrap();
        assert!((parsed - expected).abs() < 1000);

        let no_seconds = parse_expiry(&json!("2024-06-15 12:30")).unwrap();
        assert!((no_seconds - (expected - 45_000)).abs() < 1000);
    }

    #[test]
    fn test_date_only_is_local_midnight() {
        let expected = Local
            .with_ymd_and_hms(2024, 6, 15, 0, 0, 0)
            .earliest()
            .unwrap()
            .timestamp_millis();
        assert_eq!(parse_date_string("2024-06-15"), Some(expected));
        assert_eq!(parse_expiry(&json!("2024-06-15")), Some(expected));
    }

    #[test]
    fn test_expiry_rejects_garbage() {
        assert_eq!(parse_expiry(&json!("soon")), None);
        assert_eq!(parse_expiry(&json!(null)), None);
        assert_eq!(parse_expiry(&json!(-5)), None);
        assert_eq!(parse_expiry(&json!("")), None);
    }

    #[test]
    fn test_event_threshold_differs_from_expiry() {
        // 5e11 is millis for events but seconds for expiry.
        assert_eq!(
            parse_epoch_value(&json!(500_000_000_000_i64), EVENT_SECONDS_THRESHOLD),
            Some(500_000_000_000)
        );
        assert_eq!(
            parse_expiry(&json!(500_000_000_000_i64)),
            Some(500_000_000_000_000)
        );
    }

    #[test]
    fn test_event_timestamp_first_parseable_field_wins() {
        let event = json!({
            "timestamp": "not a date",
            "ts": null,
            "createdAt": 1_718_454_645,
            "updatedAt": 1,
        });
        assert_eq!(event_timestamp(&event), Some(1_718_454_645_000));
        assert_eq!(event_timestamp(&json!({"type": "x"})), None);
    }

    #[test]
    fn test_truncate_fraction() {
        assert_eq!(
            truncate_fraction("2024-06-15T12:30:45.123456Z"),
            "2024-06-15T12:30:45.123Z"
        );
        assert_eq!(truncate_fraction("2024-06-15T12:30:45.1Z"), "2024-06-15T12:30:45.1Z");
        assert_eq!(truncate_fraction("12.5"), "12.5");
    }
}
