/// Timestamps are always UTC.  Inputs may carry any offset but are converted on the way in, so that
/// hourly buckets and window comparisons agree no matter where the log was written.
use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Timelike, Utc};
use serde::Serializer;
use std::str::FromStr;

pub type Timestamp = DateTime<Utc>;

pub fn now() -> Timestamp {
    Utc::now()
}

// Formats accepted for timestamps that carry no offset.  These are taken to be UTC.
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

pub fn parse_timestamp(s: &str) -> Result<Timestamp> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    // Offsets without the colon, eg 2025-01-15T10:00:00+0100.
    if let Ok(t) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Ok(t.with_timezone(&Utc));
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&t));
        }
    }
    bail!("Unparseable timestamp {s}")
}

pub fn timestamp_from_ymdhms(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
) -> Option<Timestamp> {
    let d = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)?;
    Some(Utc.from_utc_datetime(&d))
}

pub fn hour_of_day(t: Timestamp) -> usize {
    t.hour() as usize
}

pub fn format_timestamp(t: Timestamp) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub fn serialize_timestamp<S: Serializer>(t: &Timestamp, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_timestamp(*t))
}

pub fn serialize_opt_timestamp<S: Serializer>(
    t: &Option<Timestamp>,
    s: S,
) -> Result<S::Ok, S::Error> {
    match t {
        Some(t) => s.serialize_str(&format_timestamp(*t)),
        None => s.serialize_none(),
    }
}

// This is WwDdHhMmSs with all parts optional but at least one part required.  The parts can be in
// any order, but each may appear only once.
pub fn parse_duration(s: &str) -> Result<chrono::Duration> {
    let mut seen = [false; 5];
    let mut total_secs = 0u64;
    let mut ds = "".to_string();
    for ch in s.chars() {
        if ch.is_ascii_digit() {
            ds.push(ch);
            continue;
        }
        let (slot, scale) = match ch {
            'w' => (0, 7 * 24 * 60 * 60),
            'd' => (1, 24 * 60 * 60),
            'h' => (2, 60 * 60),
            'm' => (3, 60),
            's' => (4, 1),
            _ => bail!("Bad suffix"),
        };
        if ds.is_empty() || seen[slot] {
            bail!("Bad suffix")
        }
        seen[slot] = true;
        let Ok(val) = u64::from_str(&ds) else {
            bail!("Bad number")
        };
        let Some(t) = val.checked_mul(scale).and_then(|x| total_secs.checked_add(x)) else {
            bail!("Duration too large")
        };
        total_secs = t;
        ds.clear();
    }
    if !ds.is_empty() || !seen.iter().any(|x| *x) {
        bail!("Inconsistent")
    }
    Ok(chrono::Duration::from_std(std::time::Duration::from_secs(
        total_secs,
    ))?)
}

#[test]
fn test_parse_timestamp() {
    let t = parse_timestamp("2025-01-15T10:00:00Z").unwrap();
    assert!(t == timestamp_from_ymdhms(2025, 1, 15, 10, 0, 0).unwrap());

    // Offsets are folded into UTC.
    let t = parse_timestamp("2025-01-15T11:30:00+01:00").unwrap();
    assert!(t == timestamp_from_ymdhms(2025, 1, 15, 10, 30, 0).unwrap());
    let t = parse_timestamp("2025-01-15T05:00:00-0500").unwrap();
    assert!(t == timestamp_from_ymdhms(2025, 1, 15, 10, 0, 0).unwrap());

    // No offset means UTC, fractional seconds are fine.
    let t = parse_timestamp("2025-01-15T10:00:00.250").unwrap();
    assert!(t - timestamp_from_ymdhms(2025, 1, 15, 10, 0, 0).unwrap() == chrono::Duration::milliseconds(250));
    assert!(parse_timestamp("2025-01-15 23:59:59").is_ok());

    assert!(parse_timestamp("bad-ts").is_err());
    assert!(parse_timestamp("").is_err());
    assert!(parse_timestamp("2025-13-15T10:00:00Z").is_err());
}

#[test]
fn test_hours() {
    let t = parse_timestamp("2025-01-15T23:59:59+00:00").unwrap();
    assert!(hour_of_day(t) == 23);
    let t = parse_timestamp("2025-01-16T00:30:00+01:00").unwrap();
    assert!(hour_of_day(t) == 23);
    assert!(format_timestamp(t) == "2025-01-15T23:30:00Z");
}

#[test]
fn test_parse_duration() {
    assert!(parse_duration("3").is_err());
    assert!(parse_duration("3y").is_err());
    assert!(parse_duration("m").is_err());
    assert!(parse_duration("3m3m").is_err());
    assert!(parse_duration("").is_err());

    let x = parse_duration("5m").unwrap();
    assert!(x.num_seconds() == 300);

    let x = parse_duration("1h30m").unwrap();
    assert!(x.num_minutes() == 90);

    let x = parse_duration("45s").unwrap();
    assert!(x.num_seconds() == 45);

    let x = parse_duration("1w2d").unwrap();
    assert!(x.num_days() == 9);

    assert!(parse_duration("100000000000000000w").is_err());
    assert!(parse_duration("18446744073709551615s").is_err());
}
