//! Time utilities: timezone-aware conversion of SMS export timestamps.

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Formats seen in phone SMS exports, tried in order.
const LOCAL_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d-%b-%Y %H:%M",
];

/// Parse a local timestamp like "2026-02-20 23:59" in an IANA tz like
/// "Asia/Kolkata", returning UTC. Bare epoch milliseconds are accepted as-is.
pub fn parse_local_to_utc(local: &str, tz: &str) -> Result<DateTime<Utc>> {
    let local = local.trim();

    if let Ok(ms) = local.parse::<i64>() {
        return DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| anyhow::anyhow!("epoch millis out of range: {ms}"));
    }

    let tz: Tz = tz
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid timezone: {tz}"))?;

    let ndt = LOCAL_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(local, fmt).ok())
        .ok_or_else(|| anyhow::anyhow!("invalid local datetime '{local}'"))?;

    let local_dt = tz
        .from_local_datetime(&ndt)
        .single()
        .ok_or_else(|| anyhow::anyhow!("ambiguous or invalid local time (DST?): {local} {tz}"))?;

    Ok(local_dt.with_timezone(&Utc))
}

/// Helper: format a UTC time into RFC3339.
pub fn to_rfc3339_utc(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kolkata_timestamp() {
        // IST is UTC+5:30 all year
        let utc = parse_local_to_utc("2026-02-20 23:59", "Asia/Kolkata").unwrap();
        assert_eq!(to_rfc3339_utc(utc), "2026-02-20T18:29:00+00:00");
    }

    #[test]
    fn test_parse_day_first_format() {
        let utc = parse_local_to_utc("05/03/2026 10:00:00", "UTC").unwrap();
        assert_eq!(to_rfc3339_utc(utc), "2026-03-05T10:00:00+00:00");
    }

    #[test]
    fn test_epoch_millis_passthrough() {
        let utc = parse_local_to_utc("1767225600000", "Asia/Kolkata").unwrap();
        assert_eq!(to_rfc3339_utc(utc), "2026-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_rejects_bad_timezone() {
        assert!(parse_local_to_utc("2026-02-20 10:00", "Mars/Olympus").is_err());
    }
}
