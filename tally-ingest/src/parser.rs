//! Template-driven SMS parser.
//!
//! A rule template is a regex with placeholder keys written literally in it,
//! e.g. `Rs\. AMOUNT debited at MERCHANT`. Every occurrence of a key becomes a
//! named capture group, the body is matched once (unanchored), and every
//! captured field is decoded. Any failure along the way yields `None`.
//!
//! Key names are substituted verbatim: a key name that is part of literal
//! template text (`UPDATED` contains `DATE`) is substituted too.

use chrono::NaiveDate;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::str::FromStr;
use tally_core::{SmsRule, TransactionKind};
use thiserror::Error;
use tracing::{debug, warn};

use crate::placeholder::{FieldValue, PlaceholderKey};

/// What the parser needs from a user rule
#[derive(Debug, Clone, PartialEq)]
pub struct ParseRule {
    pub owner_id: String,
    pub template: String,
    pub field_kind: TransactionKind,
}

impl ParseRule {
    pub fn new(
        owner_id: impl Into<String>,
        template: impl Into<String>,
        field_kind: TransactionKind,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            template: template.into(),
            field_kind,
        }
    }
}

impl From<&SmsRule> for ParseRule {
    fn from(rule: &SmsRule) -> Self {
        Self::new(rule.owner_id.clone(), rule.template.clone(), rule.kind)
    }
}

/// Fields extracted from one SMS body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedData {
    pub amount: Decimal,
    pub kind: TransactionKind,
    pub currency: Option<String>,
    pub merchant: Option<String>,
    pub date: Option<NaiveDate>,
}

/// How to resolve a key that appears more than once in a template
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    #[default]
    LastWins,
    FirstWins,
    /// All occurrences must decode to the same value
    RequireConsistent,
}

impl FromStr for DuplicatePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last-wins" | "last" => Ok(DuplicatePolicy::LastWins),
            "first-wins" | "first" => Ok(DuplicatePolicy::FirstWins),
            "require-consistent" | "consistent" => Ok(DuplicatePolicy::RequireConsistent),
            other => anyhow::bail!("unknown duplicate policy: {other}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("template contains no placeholder keys")]
    Inert,

    #[error("template does not compile: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// A placeholder occurrence and the capture group holding it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub key: PlaceholderKey,
    pub group: String,
}

/// Replace every key occurrence in `template` with a named group.
///
/// Bindings are ordered by key, then by position in the template.
pub fn substitute(template: &str) -> (String, Vec<Binding>) {
    PlaceholderKey::ALL
        .iter()
        .fold((template.to_string(), Vec::new()), |(pattern, mut bindings), key| {
            if !pattern.contains(key.name()) {
                return (pattern, bindings);
            }

            let mut out = String::with_capacity(pattern.len() * 2);
            for (i, piece) in pattern.split(key.name()).enumerate() {
                if i > 0 {
                    let group = key.group_name(i - 1);
                    out.push_str(&format!("(?P<{group}>{})", key.pattern()));
                    bindings.push(Binding { key: *key, group });
                }
                out.push_str(piece);
            }
            (out, bindings)
        })
}

/// A rule whose template has been substituted and compiled
#[derive(Debug, Clone)]
pub struct CompiledRule {
    regex: Regex,
    bindings: Vec<Binding>,
    kind: TransactionKind,
}

impl CompiledRule {
    pub fn compile(rule: &ParseRule) -> Result<Self, RuleError> {
        let (pattern, bindings) = substitute(&rule.template);
        if bindings.is_empty() {
            return Err(RuleError::Inert);
        }
        let regex = Regex::new(&pattern)?;
        Ok(Self {
            regex,
            bindings,
            kind: rule.field_kind,
        })
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn extract(&self, body: &str, policy: DuplicatePolicy) -> Option<ParsedData> {
        let Some(caps) = self.regex.captures(body) else {
            debug!(pattern = self.pattern(), "body does not match rule");
            return None;
        };

        let mut fields: HashMap<PlaceholderKey, FieldValue> = HashMap::new();
        for binding in &self.bindings {
            let Some(raw) = caps.name(&binding.group).map(|m| m.as_str()) else {
                debug!(group = %binding.group, "placeholder group did not participate");
                return None;
            };
            let Some(value) = binding.key.decode(raw) else {
                debug!(key = binding.key.name(), raw, "placeholder text does not decode");
                return None;
            };

            match fields.entry(binding.key) {
                Entry::Vacant(slot) => {
                    slot.insert(value);
                }
                Entry::Occupied(mut slot) => match policy {
                    DuplicatePolicy::LastWins => {
                        slot.insert(value);
                    }
                    DuplicatePolicy::FirstWins => {}
                    DuplicatePolicy::RequireConsistent => {
                        if slot.get() != &value {
                            debug!(
                                key = binding.key.name(),
                                "duplicate placeholder values disagree"
                            );
                            return None;
                        }
                    }
                },
            }
        }

        let amount = match fields.remove(&PlaceholderKey::Amount) {
            Some(FieldValue::Amount(amount)) => amount,
            _ => {
                debug!(pattern = self.pattern(), "rule has no AMOUNT placeholder");
                return None;
            }
        };

        Some(ParsedData {
            amount,
            kind: self.kind,
            currency: text(fields.remove(&PlaceholderKey::Currency)),
            merchant: text(fields.remove(&PlaceholderKey::Merchant)),
            date: match fields.remove(&PlaceholderKey::Date) {
                Some(FieldValue::Date(d)) => Some(d),
                _ => None,
            },
        })
    }
}

fn text(value: Option<FieldValue>) -> Option<String> {
    match value {
        Some(FieldValue::Text(s)) => Some(s),
        _ => None,
    }
}

/// Parser with a fixed duplicate-placeholder policy
#[derive(Debug, Clone, Copy, Default)]
pub struct SmsParser {
    policy: DuplicatePolicy,
}

impl SmsParser {
    pub fn with_policy(policy: DuplicatePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    pub fn parse(&self, body: &str, rule: &ParseRule) -> Option<ParsedData> {
        match CompiledRule::compile(rule) {
            Ok(compiled) => compiled.extract(body, self.policy),
            Err(RuleError::Inert) => {
                debug!(owner = %rule.owner_id, "rule has no placeholders, skipping");
                None
            }
            Err(e) => {
                warn!(owner = %rule.owner_id, error = %e, "rule template does not compile");
                None
            }
        }
    }
}

/// Parse `body` with `rule` using the default policy.
pub fn parse(body: &str, rule: &ParseRule) -> Option<ParsedData> {
    SmsParser::default().parse(body, rule)
}
