//! Timestamp parsing for transcript and companion-log lines.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Parse a transcript event timestamp.
///
/// RFC 3339 first, then a naive `YYYY-MM-DDTHH:MM:SS[.fff]` fallback
/// interpreted as UTC (some writers drop the zone suffix).
pub fn parse_event_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|ndt| ndt.and_utc())
        })
}

/// Parse the leading ISO timestamp of a companion UI log line, returning the
/// timestamp and the remainder of the line.
///
/// Line shape: `<ISO8601 timestamp>  INFO <message>`.
pub fn split_log_timestamp(line: &str) -> Option<(DateTime<Utc>, &str)> {
    let trimmed = line.trim_start();
    let (first, rest) = trimmed.split_once(char::is_whitespace)?;
    let ts = parse_event_timestamp(first)?;
    Some((ts, rest.trim_start()))
}
