//! Month and timestamp helpers
//!
//! Rule windows and report timestamps are all UTC.

use crate::error::{ModelError, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};

/// Report timestamp format: `2019-11-01T00:00:00Z`
pub const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub const HOUR_MILLIS: i64 = 3_600_000;

/// Parse `yyyy-MM`, `yyyy-MM-dd`, `yyyy-MM-ddTHH:mm:ssZ` or any RFC 3339 timestamp
pub fn parse_date(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return midnight(date, s);
    }
    if let Ok(date) = NaiveDate::parse_from_str(&format!("{}-01", s), "%Y-%m-%d") {
        return midnight(date, s);
    }
    Err(ModelError::invalid_date(s))
}

fn midnight(date: NaiveDate, original: &str) -> Result<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| ModelError::invalid_date(original))
}

/// Parse a date and truncate it to the first instant of its month
pub fn parse_month(s: &str) -> Result<DateTime<Utc>> {
    let dt = parse_date(s)?;
    Utc.with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
        .single()
        .ok_or_else(|| ModelError::invalid_date(s))
}

/// Number of hours in the month starting at `start`
pub fn hours_in_month(start: &DateTime<Utc>) -> usize {
    let (year, month) = if start.month() == 12 {
        (start.year() + 1, 1)
    } else {
        (start.year(), start.month() + 1)
    };
    match Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single() {
        Some(next) => ((next - *start).num_hours()).max(0) as usize,
        None => 31 * 24,
    }
}

/// Whole hours between `start` and `ts`, negative when `ts` precedes `start`
pub fn hour_index(start: &DateTime<Utc>, ts: &DateTime<Utc>) -> i64 {
    (ts.timestamp_millis() - start.timestamp_millis()).div_euclid(HOUR_MILLIS)
}

/// Timestamp of hour `hour` relative to `start`, formatted for reports
pub fn format_hour(start: &DateTime<Utc>, hour: usize) -> String {
    (*start + Duration::hours(hour as i64))
        .format(ISO_FORMAT)
        .to_string()
}

/// `yyyy-MM` label of a month
pub fn month_label(start: &DateTime<Utc>) -> String {
    start.format("%Y-%m").to_string()
}
