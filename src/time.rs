//! Wall-clock timestamps split into a date part and an intraday part.
//!
//! Every persisted time in the system is a pair `(date_part, intraday_part)`:
//! whole days since the Unix epoch and milliseconds within the UTC day. The
//! split keeps matching predicates on small integers and lets the store
//! range-query price history by day.

use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};

/// Milliseconds in one UTC day.
pub const MS_PER_DAY: i64 = 86_400_000;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Whole days since the Unix epoch.
pub fn date_part(ms: i64) -> i64 {
    ms.div_euclid(MS_PER_DAY)
}

/// Milliseconds within the UTC day.
pub fn intraday_part(ms: i64) -> i64 {
    ms.rem_euclid(MS_PER_DAY)
}

/// Recombine a `(date_part, intraday_part)` pair into epoch milliseconds.
pub fn combine(date: i64, intraday: i64) -> i64 {
    date * MS_PER_DAY + intraday
}

/// Format a `(date_part, intraday_part)` pair as `YYYY-MM-DD HH:MM:SS`.
pub fn format_parts(date: i64, intraday: i64) -> String {
    format_ms(combine(date, intraday))
}

/// Format epoch milliseconds as `YYYY-MM-DD HH:MM:SS`.
pub fn format_ms(ms: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => format!("@{ms}ms"),
    }
}

/// Parse a `YYYY-MM-DD` date into a date part (days since epoch).
pub fn parse_date(s: &str) -> Option<i64> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)?;
    Some((date - epoch).num_days())
}

/// Parse an `HH:MM:SS` time of day into an intraday part (ms within day).
pub fn parse_daily(s: &str) -> Option<i64> {
    let time = NaiveTime::parse_from_str(s, "%H:%M:%S").ok()?;
    Some(time.num_seconds_from_midnight() as i64 * 1000)
}
