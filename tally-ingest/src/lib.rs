//! tally-ingest: turn bank SMS notifications into transactions
//!
//! Rules carry templates with placeholder keys (`AMOUNT`, `CURRENCY`,
//! `MERCHANT`, `DATE`). The parser matches a message body against a rule and
//! decodes the captured fields; the ingestor records matches in the store.

pub mod ingest;
pub mod parser;
pub mod placeholder;
pub mod sms_export;

pub use ingest::{IngestOutcome, IngestSummary, SmsIngestor};
pub use parser::{
    CompiledRule, DuplicatePolicy, ParseRule, ParsedData, RuleError, SmsParser, parse,
};
pub use placeholder::{FieldValue, PlaceholderKey};
pub use sms_export::{parse_sms_export, read_sms_export};
