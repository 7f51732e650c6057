//! Placeholder keys usable inside SMS rule templates.
//!
//! A key is written literally in a template (e.g. `AMOUNT`) and stands for a
//! fixed regex fragment. Fragments only use non-capturing groups.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlaceholderKey {
    Currency,
    Merchant,
    Amount,
    Date,
}

/// A decoded placeholder capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Amount(Decimal),
    Date(NaiveDate),
    Text(String),
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d-%m-%Y", "%d/%m/%Y", "%d-%m-%y", "%d/%m/%y"];

impl PlaceholderKey {
    /// Substitution order. Group names are lowercase so no key name can
    /// reappear inside an already substituted group.
    pub const ALL: [PlaceholderKey; 4] = [
        PlaceholderKey::Currency,
        PlaceholderKey::Merchant,
        PlaceholderKey::Amount,
        PlaceholderKey::Date,
    ];

    /// Literal text that marks the placeholder in a template.
    pub fn name(&self) -> &'static str {
        match self {
            PlaceholderKey::Currency => "CURRENCY",
            PlaceholderKey::Merchant => "MERCHANT",
            PlaceholderKey::Amount => "AMOUNT",
            PlaceholderKey::Date => "DATE",
        }
    }

    /// Regex fragment the placeholder matches.
    pub fn pattern(&self) -> &'static str {
        match self {
            PlaceholderKey::Currency => r"[A-Z]{3}|Rs\.?|\$|€|£",
            PlaceholderKey::Merchant => r"[A-Za-z0-9&'.\- ]+?",
            PlaceholderKey::Amount => r"(?:\d{1,3}(?:,\d{3})+|\d+)\.\d{2}",
            PlaceholderKey::Date => r"\d{2}[-/]\d{2}[-/]\d{2,4}|\d{4}-\d{2}-\d{2}",
        }
    }

    /// Capture group name for the `occurrence`-th appearance in a template.
    pub fn group_name(&self, occurrence: usize) -> String {
        format!("{}_{}", self.name().to_ascii_lowercase(), occurrence)
    }

    /// Decode captured text. `None` when the text is not a valid value.
    pub fn decode(&self, raw: &str) -> Option<FieldValue> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match self {
            PlaceholderKey::Amount => Decimal::from_str(&raw.replace(',', ""))
                .ok()
                .map(FieldValue::Amount),
            PlaceholderKey::Date => DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
                .map(FieldValue::Date),
            PlaceholderKey::Currency | PlaceholderKey::Merchant => {
                Some(FieldValue::Text(raw.to_string()))
            }
        }
    }
}
