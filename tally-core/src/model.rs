//! Domain records: accounts, categories, transactions and SMS rules/messages.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::entity::SyncMeta;
use crate::sync_entity;

/// Direction of money movement on an account
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    #[serde(rename = "credit")]
    Credit,
    #[serde(rename = "debit")]
    Debit,
}

impl TransactionKind {
    /// Sign applied to the absolute amount when computing balances
    pub fn sign(&self) -> Decimal {
        match self {
            TransactionKind::Credit => Decimal::ONE,
            TransactionKind::Debit => Decimal::NEGATIVE_ONE,
        }
    }
}

impl std::str::FromStr for TransactionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "credit" | "cr" => Ok(TransactionKind::Credit),
            "debit" | "dr" => Ok(TransactionKind::Debit),
            other => anyhow::bail!("unknown transaction kind: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CategoryKind {
    #[serde(rename = "income")]
    Income,
    #[serde(rename = "expense")]
    Expense,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(flatten)]
    pub meta: SyncMeta,
    pub name: String,
    pub currency: String,
    pub opening_balance: Decimal,
}

impl Account {
    pub fn new(name: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            meta: SyncMeta::default(),
            name: name.into(),
            currency: currency.into(),
            opening_balance: Decimal::ZERO,
        }
    }
}

sync_entity!(Account, "accounts");

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    #[serde(flatten)]
    pub meta: SyncMeta,
    pub name: String,
    pub kind: CategoryKind,
}

impl Category {
    pub fn new(name: impl Into<String>, kind: CategoryKind) -> Self {
        Self {
            meta: SyncMeta::default(),
            name: name.into(),
            kind,
        }
    }
}

sync_entity!(Category, "categories");

/// A money movement, entered by hand or derived from an SMS
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(flatten)]
    pub meta: SyncMeta,
    pub account_id: Option<String>,
    /// Category name, as produced by the categorizer or chosen by the user
    pub category: Option<String>,
    /// Always non-negative; direction is carried by `kind`
    pub amount: Decimal,
    pub kind: TransactionKind,
    pub currency: Option<String>,
    pub merchant: Option<String>,
    pub occurred_on: NaiveDate,
    pub note: Option<String>,
    /// Id of the `sms_messages` record this transaction was derived from
    pub source_message_id: Option<String>,
}

impl Transaction {
    pub fn new(amount: Decimal, kind: TransactionKind, occurred_on: NaiveDate) -> Self {
        Self {
            meta: SyncMeta::default(),
            account_id: None,
            category: None,
            amount: amount.abs(),
            kind,
            currency: None,
            merchant: None,
            occurred_on,
            note: None,
            source_message_id: None,
        }
    }

    /// Amount with the direction applied (credits positive, debits negative)
    pub fn signed_amount(&self) -> Decimal {
        self.amount * self.kind.sign()
    }

    pub fn is_expense(&self) -> bool {
        self.kind == TransactionKind::Debit
    }
}

sync_entity!(Transaction, "transactions");

/// User-authored template for turning a bank SMS into a transaction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SmsRule {
    #[serde(flatten)]
    pub meta: SyncMeta,
    pub owner_id: String,
    /// Sender address the rule applies to (e.g. "VM-HDFCBK"); matched case-insensitively
    pub sender: String,
    pub template: String,
    pub kind: TransactionKind,
}

impl SmsRule {
    pub fn new(
        owner_id: impl Into<String>,
        sender: impl Into<String>,
        template: impl Into<String>,
        kind: TransactionKind,
    ) -> Self {
        Self {
            meta: SyncMeta::default(),
            owner_id: owner_id.into(),
            sender: sender.into(),
            template: template.into(),
            kind,
        }
    }

    pub fn applies_to(&self, sender: &str) -> bool {
        self.sender.eq_ignore_ascii_case(sender.trim())
    }
}

sync_entity!(SmsRule, "sms_rules");

/// A received SMS, kept so derived transactions can point back to it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SmsMessage {
    #[serde(flatten)]
    pub meta: SyncMeta,
    pub sender: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    /// Stable identity of (sender, received_at, body), used for dedup
    pub fingerprint: String,
}

impl SmsMessage {
    pub fn new(
        sender: impl Into<String>,
        body: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        let sender = sender.into();
        let body = body.into();
        let fingerprint = fingerprint(&sender, received_at, &body);
        Self {
            meta: SyncMeta::default(),
            sender,
            body,
            received_at,
            fingerprint,
        }
    }
}

sync_entity!(SmsMessage, "sms_messages");

/// FNV-1a over the normalized message identity, hex encoded.
fn fingerprint(sender: &str, received_at: DateTime<Utc>, body: &str) -> String {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;

    let normalized = format!(
        "{}|{}|{}",
        sender.trim().to_ascii_uppercase(),
        received_at.timestamp(),
        body.trim()
    );
    let hash = normalized
        .bytes()
        .fold(OFFSET, |h, b| (h ^ u64::from(b)).wrapping_mul(PRIME));
    format!("{hash:016x}")
}
