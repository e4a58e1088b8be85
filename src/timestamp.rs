//! Observation timestamp formatting.
//!
//! Observations are stored as local wall-clock ISO-8601 strings without an
//! offset (`2025-12-19T08:15:30`). Parsing also accepts RFC 3339 strings, in
//! which case the wall-clock time at the written offset is used.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone};

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Formats POSIX seconds as a local ISO-8601 timestamp.
pub fn format_timestamp(secs: u64) -> String {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX);
    match Local.timestamp_opt(secs, 0).earliest() {
        Some(dt) => dt.naive_local().format(ISO_FORMAT).to_string(),
        None => DateTime::from_timestamp(secs, 0)
            .unwrap_or_default()
            .naive_utc()
            .format(ISO_FORMAT)
            .to_string(),
    }
}

/// Parses a stored observation timestamp into its wall-clock time.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_local());
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").ok()
}

/// Calendar date of a stored observation timestamp.
pub fn observation_date(value: &str) -> Option<NaiveDate> {
    parse_timestamp(value).map(|dt| dt.date())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_format_round_trips_through_parse() {
        let formatted = format_timestamp(1_700_000_000);
        let parsed = parse_timestamp(&formatted).unwrap();
        assert_eq!(parsed.format(ISO_FORMAT).to_string(), formatted);
    }

    #[test]
    fn test_parse_naive_and_fractional() {
        let dt = parse_timestamp("2025-12-19T08:15:30").unwrap();
        assert_eq!(dt.hour(), 8);
        let dt = parse_timestamp("2025-12-19T23:59:59.250").unwrap();
        assert_eq!(dt.hour(), 23);
    }

    #[test]
    fn test_parse_rfc3339_keeps_wall_clock() {
        let dt = parse_timestamp("2025-12-19T08:15:30-05:00").unwrap();
        assert_eq!(dt.hour(), 8);
        assert_eq!(
            observation_date("2025-12-19T23:15:30+09:00"),
            NaiveDate::from_ymd_opt(2025, 12, 19)
        );
    }

    #[test]
    fn test_parse_garbage_is_none() {
        assert!(parse_timestamp("yesterday").is_none());
    }
}
