//! Read phone SMS backups exported as CSV.
//!
//! Export tools write a header row followed by one row per message:
//! address,date,body
//! Extra columns are ignored and column order may vary. Dates are either
//! epoch milliseconds or local wall-clock time in the phone's timezone.

use anyhow::{Context, Result};
use std::io::Read;
use std::path::Path;
use tally_core::SmsMessage;
use tally_core::time::parse_local_to_utc;
use tracing::{debug, warn};

const SENDER_COLUMNS: &[&str] = &["address", "sender", "from"];
const DATE_COLUMNS: &[&str] = &["date", "received_at", "timestamp"];
const BODY_COLUMNS: &[&str] = &["body", "message", "text"];

fn column(headers: &csv::StringRecord, names: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| names.iter().any(|n| h.trim().eq_ignore_ascii_case(n)))
}

/// Parse an SMS export file. `tz` is the IANA timezone of local timestamps.
pub fn read_sms_export(path: impl AsRef<Path>, tz: &str) -> Result<Vec<SmsMessage>> {
    let file = std::fs::File::open(path.as_ref())
        .with_context(|| format!("opening {}", path.as_ref().display()))?;
    parse_sms_export(file, tz).with_context(|| format!("reading {}", path.as_ref().display()))
}

/// Parse SMS export rows from any reader.
/// Rows with an empty body or an unparseable date are skipped.
pub fn parse_sms_export<R: Read>(reader: R, tz: &str) -> Result<Vec<SmsMessage>> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    let sender_col = column(&headers, SENDER_COLUMNS).context("missing address column")?;
    let date_col = column(&headers, DATE_COLUMNS).context("missing date column")?;
    let body_col = column(&headers, BODY_COLUMNS).context("missing body column")?;

    let mut messages = Vec::new();
    for (row, result) in rdr.records().enumerate() {
        let record = result?;
        let body = record.get(body_col).unwrap_or("").trim();
        if body.is_empty() {
            debug!(row, "skipping row without body");
            continue;
        }

        let raw_date = record.get(date_col).unwrap_or("");
        let received_at = match parse_local_to_utc(raw_date, tz) {
            Ok(ts) => ts,
            Err(e) => {
                warn!(row, error = %e, "skipping row with unreadable date");
                continue;
            }
        };

        let sender = record.get(sender_col).unwrap_or("").trim();
        messages.push(SmsMessage::new(sender, body, received_at));
    }

    Ok(messages)
}
