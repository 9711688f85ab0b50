//! Timestamp formatting and relative-duration parsing

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Utc};

/// Format a timestamp the way it is stored: RFC 3339, microseconds, `Z` suffix.
///
/// The fixed width keeps stored timestamps lexicographically sortable.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an ISO 8601 timestamp that must be UTC.
///
/// Timestamps without an offset are taken as UTC; any non-zero offset is rejected.
pub fn parse_utc_timestamp(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        if parsed.offset().local_minus_utc() != 0 {
            return Err(Error::validation(format!(
                "timestamp must be utc iso valued string ({})",
                value
            )));
        }
        return Ok(parsed.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| Error::validation(format!("unparseable timestamp '{}': {}", value, e)))
}

/// Parse a relative duration such as `1d`, `36h` or `10m`
pub fn parse_since(since: &str) -> Result<Duration> {
    let unit = since
        .chars()
        .last()
        .ok_or_else(|| Error::validation("duration must not be empty"))?;
    let digits = &since[..since.len() - unit.len_utf8()];

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::validation(format!(
            "duration must be digits followed by a unit: '{}'",
            since
        )));
    }
    let amount: i64 = digits
        .parse()
        .map_err(|_| Error::validation(format!("duration out of range: '{}'", since)))?;

    let duration = match unit {
        'd' => Duration::try_days(amount),
        'h' => Duration::try_hours(amount),
        'm' => Duration::try_minutes(amount),
        other => {
            return Err(Error::validation(format!(
                "Unit must be 'd', 'h', or 'm'; got '{}'",
                other
            )))
        }
    };

    duration.ok_or_else(|| Error::validation(format!("duration out of range: '{}'", since)))
}
