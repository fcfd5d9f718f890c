//! Deadline parsing and comparison.
//!
//! The CRM reports deadlines in several textual forms, sometimes with an
//! offset and sometimes without. All of them are read as wall-clock values in
//! the bot's home timezone: any offset marker is discarded, never applied.

use chrono::{NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;

static TZ_MARKER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\s*[Zz]|\s*[+-]\d{2}:?\d{2})$").expect("timezone marker regex must compile")
});
static FRACTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{2}:\d{2}:\d{2})\.\d+").expect("fraction regex must compile"));

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d.%m.%Y"];

/// Parse a deadline into a home-timezone wall-clock value.
pub fn parse(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    // Plain dates are never followed by an offset, and "2025-01-10" would
    // otherwise look like it ends in one.
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    let without_tz = TZ_MARKER_RE.replace(trimmed, "");
    let cleaned = FRACTION_RE.replace(without_tz.trim(), "$1");
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&cleaned, fmt).ok())
}

/// Canonical form used in dedup keys. Unparseable input is kept verbatim (trimmed).
pub fn normalize(raw: &str) -> String {
    match parse(raw) {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M").to_string(),
        None => raw.trim().to_string(),
    }
}

/// Whether two deadline texts denote the same instant.
///
/// Falls back to comparing the trimmed text when either side cannot be parsed.
pub fn same_instant(a: &str, b: &str) -> bool {
    match (parse(a), parse(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a.trim() == b.trim(),
    }
}

/// `Some(true)` when the deadline is strictly before `now`; `None` when it cannot be parsed.
pub fn is_past(raw: &str, now: NaiveDateTime) -> Option<bool> {
    parse(raw).map(|dt| dt < now)
}

/// Whole hours left until the deadline, never negative.
pub fn hours_until(raw: &str, now: NaiveDateTime) -> Option<i64> {
    parse(raw).map(|dt| (dt - now).num_hours().max(0))
}

/// Human-readable form, e.g. `10.01.2025 18:00`.
pub fn display(raw: &str) -> String {
    match parse(raw) {
        Some(dt) => dt.format("%d.%m.%Y %H:%M").to_string(),
        None => raw.trim().to_string(),
    }
}
