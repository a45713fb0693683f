//! Clock helpers.
//!
//! Timestamps throughout the broker are epoch seconds; the "nice" form is
//! what ends up in stored messages and log lines.

use chrono::{Local, TimeZone, Utc};

/// Current time as epoch seconds.
pub fn now() -> i64 {
    Utc::now().timestamp()
}

/// Format epoch seconds as `YYYY-MM-DD HH:MM:SS` in local time.
///
/// Out-of-range timestamps format to an empty string instead of panicking.
pub fn nice_datetime(ts: i64) -> String {
    Local
        .timestamp_opt(ts, 0)
        .earliest()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}
