//! Day-bucket arithmetic.
//!
//! Events are keyed by an integer day number (milliseconds since the Unix
//! epoch divided by the day length, floored), never by a date string. Date
//! strings only appear in generated documents.

use chrono::{DateTime, Utc};

/// Length of one day bucket.
pub const MILLIS_PER_DAY: i64 = 86_400_000;

/// Earliest plausible last-ping time (2010-01-01T00:00:00Z). Older values
/// are treated as nonsense and dropped from generated documents.
pub const EARLIEST_PING_MILLIS: i64 = 1_262_304_000_000;

/// Day bucket containing the given wall-clock time.
pub fn day_of_millis(millis: i64) -> i64 {
    millis.div_euclid(MILLIS_PER_DAY)
}

/// Start of a day bucket in milliseconds since the epoch.
pub fn millis_of_day(day: i64) -> i64 {
    day * MILLIS_PER_DAY
}

/// Date string ("YYYY-MM-DD", UTC) for a day bucket.
pub fn date_string(day: i64) -> String {
    let dt = DateTime::<Utc>::from_timestamp(day * 86_400, 0).unwrap_or_default();
    dt.format("%Y-%m-%d").to_string()
}
