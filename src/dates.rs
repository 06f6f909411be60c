//! Timestamp helpers for message listings.
//!
//! The vendor sends `created_at` as `"Wed Aug 27 13:08:45 +0000 2008"`.

use chrono::{DateTime, Utc};

const VENDOR_TIME_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

/// Parse a vendor `created_at` string into UTC.
pub fn parse_created_at(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value.trim(), VENDOR_TIME_FORMAT)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Relative label for an optional `created_at`, `-` when absent or unparseable.
pub fn relative_created_at(created_at: Option<&str>, now: DateTime<Utc>) -> String {
    created_at
        .and_then(parse_created_at)
        .map(|dt| format_relative_date(dt.timestamp(), now.timestamp()))
        .unwrap_or_else(|| "-".to_string())
}

pub fn format_relative_date(timestamp: i64, now: i64) -> String {
    if now <= 0 || timestamp <= 0 {
        return "-".to_string();
    }
    let (delta, future) = if timestamp > now {
        (timestamp - now, true)
    } else {
        (now - timestamp, false)
    };
    if delta < 10 {
        return "now".to_string();
    }
    if delta < 60 {
        return format_relative_unit(delta, "s", future);
    }
    let minutes = delta / 60;
    if minutes < 60 {
        return format_relative_unit(minutes, "m", future);
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format_relative_unit(hours, "h", future);
    }
    let days = hours / 24;
    if days < 7 {
        return format_relative_unit(days, "d", future);
    }
    let weeks = days / 7;
    if weeks < 4 {
        return format_relative_unit(weeks, "w", future);
    }
    let months = days / 30;
    if months < 12 {
        return format_relative_unit(months, "mo", future);
    }
    let years = days / 365;
    format_relative_unit(years, "y", future)
}

fn format_relative_unit(value: i64, unit: &str, future: bool) -> String {
    if future {
        format!("in {value}{unit}")
    } else {
        format!("{value}{unit} ago")
    }
}
