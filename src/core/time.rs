//! Shared UTC timestamp helpers.
//!
//! Every persisted timestamp in tradebot is timezone-aware UTC ISO-8601 with
//! a trailing `Z`. Parsers accept `Z` or `±HH:MM` offsets; naive strings are
//! interpreted as UTC. Local time exists only for operator display.

use crate::core::error::TbotError;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Now as `YYYY-MM-DDTHH:MM:SSZ` (second precision, the log-line form).
pub fn now_iso_z() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Compact timestamp for snapshot filenames: `YYYYMMDDTHHMMSSZ`.
pub fn now_compact_z() -> String {
    Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

pub fn iso_z(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub fn iso_millis_z(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Parse str to an aware UTC datetime. Accepts `Z`, explicit offsets, and
/// naive strings (interpreted as UTC). Returns None on garbage.
pub fn parse_to_utc(s: &str) -> Option<DateTime<Utc>> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Some(dt.with_timezone(&Utc));
    }
    // Naive "YYYY-MM-DDTHH:MM:SS[.fff]" interpreted as UTC
    if let Ok(naive) = NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    // Bare date: midnight UTC
    if let Ok(d) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
    }
    None
}

/// UTC midnight of the given instant's calendar date.
pub fn utc_midnight(dt: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(dt.year(), dt.month(), dt.day(), 0, 0, 0)
        .single()
        .unwrap_or(dt)
}

/// Parse `HH:MM` into (hour, minute); rejects out-of-range values.
pub fn parse_hhmm(s: &str) -> Result<(u32, u32), TbotError> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    if parts.len() != 2 {
        return Err(TbotError::Validation(format!("invalid HH:MM '{}'", s)));
    }
    let hh: u32 = parts[0]
        .parse()
        .map_err(|_| TbotError::Validation(format!("invalid HH:MM '{}'", s)))?;
    let mm: u32 = parts[1]
        .parse()
        .map_err(|_| TbotError::Validation(format!("invalid HH:MM '{}'", s)))?;
    if hh > 23 || mm > 59 {
        return Err(TbotError::Validation(format!("invalid HH:MM '{}'", s)));
    }
    Ok((hh, mm))
}

/// Today's UTC date at the given wall-clock time.
pub fn today_utc_at(hour: u32, minute: u32) -> DateTime<Utc> {
    let now = Utc::now();
    Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), hour, minute, 0)
        .single()
        .expect("valid UTC wall-clock time")
}

/// `YYYYMMDD` of the date portion of an ISO timestamp (or today if absent).
pub fn yyyymmdd_from_iso(iso: Option<&str>) -> String {
    if let Some(s) = iso {
        if let Some(date_part) = s.split('T').next() {
            if date_part.len() == 10 {
                return date_part.replace('-', "");
            }
        }
    }
    Utc::now().format("%Y%m%d").to_string()
}

/// Same UTC calendar day predicate for idempotency stamps.
pub fn same_utc_day(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.date_naive() == b.date_naive()
}

/// Lowercase three-letter weekday name (`mon`..`sun`).
pub fn weekday_name(d: NaiveDate) -> &'static str {
    ["mon", "tue", "wed", "thu", "fri", "sat", "sun"][d.weekday().num_days_from_monday() as usize]
}
