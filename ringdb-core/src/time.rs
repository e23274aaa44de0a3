//! Timestamp and duration text formats
//!
//! Timestamps are written as `YYYYMMDDThhmmss[.fraction]` (up to nine
//! fraction digits) and printed with exactly nine. Durations are an integer
//! followed by an optional unit; a bare integer is nanoseconds.

use crate::{Result, RingError, Timestamp};
use chrono::{DateTime, NaiveDateTime};

const BASE_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Parse `YYYYMMDDThhmmss[.fraction]` into nanoseconds since the epoch
pub fn parse_timestamp(s: &str) -> Result<Timestamp> {
    let bad = || RingError::InvalidFormat(format!("bad timestamp `{}`", s));

    let (base, fraction) = match s.split_once('.') {
        Some((base, fraction)) => (base, fraction),
        None => (s, ""),
    };
    if base.len() != 15 || fraction.len() > 9 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }

    let dt = NaiveDateTime::parse_from_str(base, BASE_FORMAT).map_err(|_| bad())?;
    let seconds = dt.and_utc().timestamp();

    let mut nanos: i64 = 0;
    for (i, digit) in fraction.bytes().enumerate() {
        nanos += i64::from(digit - b'0') * 10_i64.pow(8 - i as u32);
    }

    seconds
        .checked_mul(1_000_000_000)
        .and_then(|ns| ns.checked_add(nanos))
        .ok_or_else(bad)
}

/// Print a timestamp as `YYYYMMDDThhmmss.nnnnnnnnn`
pub fn format_timestamp(ts: Timestamp) -> String {
    let secs = ts.div_euclid(1_000_000_000);
    let nanos = ts.rem_euclid(1_000_000_000) as u32;
    match DateTime::from_timestamp(secs, nanos) {
        Some(dt) => format!("{}.{:09}", dt.format(BASE_FORMAT), nanos),
        None => ts.to_string(),
    }
}

/// Parse a duration such as `10s`, `1ms`, `5min` or `250` (nanoseconds)
pub fn parse_duration(s: &str) -> Result<i64> {
    let bad = || RingError::InvalidFormat(format!("bad duration `{}`", s));

    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return Err(bad());
    }
    let n: i64 = digits.parse().map_err(|_| bad())?;

    let multiplier: i64 = match unit {
        "" | "n" | "ns" => 1,
        "us" => 1_000,
        "ms" => 1_000_000,
        "s" | "sec" => 1_000_000_000,
        "m" | "min" => 60 * 1_000_000_000,
        "h" => 3_600 * 1_000_000_000,
        "d" => 86_400 * 1_000_000_000,
        _ => return Err(bad()),
    };

    n.checked_mul(multiplier).ok_or_else(bad)
}
