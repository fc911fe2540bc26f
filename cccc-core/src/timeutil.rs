use chrono::{DateTime, SecondsFormat, Utc};

/// Current UTC time as an ISO-8601 string with a `Z` suffix.
///
/// This is the timestamp format used everywhere in the ledger and in state
/// documents; microsecond precision keeps single-writer event order stable.
pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a UTC ISO-8601 timestamp. Accepts `Z` or numeric offsets and
/// naive timestamps (treated as UTC). Returns `None` on anything malformed.
pub fn parse_utc_iso(ts: &str) -> Option<DateTime<Utc>> {
    let s = ts.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Naive fallback, e.g. "2026-01-01T00:00:00".
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
    }
    None
}

/// Compact UTC stamp for archive/snapshot file names (`20260801T093000Z`).
pub fn utc_stamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_round_trips() {
        let now = utc_now_iso();
        assert!(now.ends_with('Z'));
        assert!(parse_utc_iso(&now).is_some());
    }

    #[test]
    fn parses_offset_and_naive_forms() {
        assert!(parse_utc_iso("2026-08-01T10:00:00Z").is_some());
        assert!(parse_utc_iso("2026-08-01T10:00:00+02:00").is_some());
        assert!(parse_utc_iso("2026-08-01T10:00:00.123456").is_some());
        assert!(parse_utc_iso("").is_none());
        assert!(parse_utc_iso("not-a-date").is_none());
    }

    #[test]
    fn ordering_follows_wall_clock() {
        let a = parse_utc_iso("2026-08-01T10:00:00Z").unwrap();
        let b = parse_utc_iso("2026-08-01T10:00:01Z").unwrap();
        assert!(a < b);
    }
}
