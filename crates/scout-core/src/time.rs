//! Lightweight UTC timestamp utilities (no chrono dependency).
//!
//! Uses Howard Hinnant's civil_from_days / days_from_civil algorithms for
//! conversion between Unix seconds and calendar dates.

use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;

use crate::constants::SECS_PER_HOUR;
use crate::error::{CoreError, Result};

static ISO8601: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d{4})-(\d{2})-(\d{2})(?:[T ](\d{2}):(\d{2})(?::(\d{2})(?:\.\d+)?)?)?(Z|[+-]\d{2}:?\d{2})?$",
    )
    .expect("static ISO-8601 pattern")
});

/// Current UTC time as Unix seconds.
pub fn now_unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Convert Unix seconds to ISO-8601 UTC string.
pub fn unix_to_iso8601(secs: i64) -> String {
    let days = secs.div_euclid(86400);
    let time_of_day = secs.rem_euclid(86400);
    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;

    let (y, m, d) = civil_from_days(days);
    format!("{y:04}-{m:02}-{d:02}T{hours:02}:{minutes:02}:{seconds:02}Z")
}

/// Parse an ISO-8601 timestamp into Unix seconds.
///
/// Accepts a date, an optional `T`/space separated time with optional seconds
/// and fraction, and an optional `Z` or `±HH:MM` offset. No offset means UTC.
pub fn parse_iso8601(s: &str) -> Result<i64> {
    let bad = || CoreError::InvalidTimestamp(s.to_string());
    let caps = ISO8601.captures(s.trim()).ok_or_else(bad)?;
    let num = |i: usize| -> i64 {
        caps.get(i)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    };

    let (y, mo, d) = (num(1), num(2), num(3));
    let (h, mi, sec) = (num(4), num(5), num(6));
    if !(1..=12).contains(&mo) || !(1..=days_in_month(y, mo)).contains(&d) || h > 23 || mi > 59 || sec > 60 {
        return Err(bad());
    }

    let offset_secs = match caps.get(7).map(|m| m.as_str()) {
        None | Some("Z") => 0,
        Some(off) => {
            let sign = if off.starts_with('-') { -1 } else { 1 };
            let digits: String = off[1..].chars().filter(char::is_ascii_digit).collect();
            let oh: i64 = digits[..2].parse().map_err(|_| bad())?;
            let om: i64 = digits[2..].parse().map_err(|_| bad())?;
            sign * (oh * 3600 + om * 60)
        }
    };

    Ok(days_from_civil(y, mo as u64, d as u64) * 86400 + h * 3600 + mi * 60 + sec - offset_secs)
}

/// Hours elapsed from `timestamp` to `reference` (both Unix seconds).
/// Future timestamps clamp to age 0.
pub fn age_hours(timestamp: i64, reference: i64) -> f64 {
    ((reference - timestamp) as f64 / SECS_PER_HOUR).max(0.0)
}

fn is_leap(y: i64) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

fn days_in_month(y: i64, m: i64) -> i64 {
    match m {
        2 if is_leap(y) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

/// Howard Hinnant's civil_from_days: Unix epoch days → (year, month, day).
fn civil_from_days(days: i64) -> (i64, u64, u64) {
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

/// Inverse of `civil_from_days`: (year, month, day) → Unix epoch days.
fn days_from_civil(y: i64, m: u64, d: u64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u64;
    let mp = if m > 2 { m - 3 } else { m + 9 };
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe as i64 - 719468
}
