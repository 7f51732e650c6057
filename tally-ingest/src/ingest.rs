//! Turn received SMS messages into transactions.
//!
//! Each recorded message produces three writes in one store transaction:
//! the `sms_messages` document, the derived `transactions` document and the
//! message fingerprint appended to the shared dedup index. The transaction is
//! guarded by "fingerprint not yet indexed", so replaying an export never
//! records a message twice. Both new ids must also still be unused.

use serde_json::Value;
use std::sync::Arc;
use tally_core::{SmsMessage, SmsRule, SyncEntity, SyncMeta, Transaction, categorize};
use tally_sync::{DocumentStore, Precondition, StoreError, StoreResult, WriteOp};
use tracing::{debug, info, warn};

use crate::parser::{CompiledRule, ParseRule, ParsedData, SmsParser};

pub const DEDUP_COLLECTION: &str = "sms_index";
pub const DEDUP_DOCUMENT: &str = "dedup";
pub const DEDUP_FIELD: &str = "fingerprints";

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Recorded {
        message_id: String,
        transaction_id: String,
        parsed: ParsedData,
    },
    /// The message fingerprint was already indexed
    Duplicate,
    /// No rule for the sender matched the body
    NoRuleMatched,
}

/// Counts for a batch of messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub recorded: usize,
    pub duplicates: usize,
    pub unmatched: usize,
}

struct ActiveRule {
    rule: SmsRule,
    compiled: CompiledRule,
}

pub struct SmsIngestor {
    store: Arc<dyn DocumentStore>,
    parser: SmsParser,
    rules: Vec<ActiveRule>,
    account_id: Option<String>,
}

impl SmsIngestor {
    /// Rules that are inert or do not compile are dropped here, once.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        rules: &[SmsRule],
        parser: SmsParser,
    ) -> Self {
        let rules = rules
            .iter()
            .filter(|rule| !rule.is_deleted())
            .filter_map(|rule| match CompiledRule::compile(&ParseRule::from(rule)) {
                Ok(compiled) => Some(ActiveRule {
                    rule: rule.clone(),
                    compiled,
                }),
                Err(e) => {
                    warn!(rule = ?rule.id(), sender = %rule.sender, error = %e, "ignoring rule");
                    None
                }
            })
            .collect();

        Self {
            store,
            parser,
            rules,
            account_id: None,
        }
    }

    /// Account assigned to every recorded transaction.
    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// First rule for the message's sender whose template parses the body.
    pub fn match_message(&self, message: &SmsMessage) -> Option<(&SmsRule, ParsedData)> {
        self.rules
            .iter()
            .filter(|active| active.rule.applies_to(&message.sender))
            .find_map(|active| {
                active
                    .compiled
                    .extract(&message.body, self.parser.policy())
                    .map(|parsed| (&active.rule, parsed))
            })
    }

    pub async fn ingest(&self, message: &SmsMessage) -> StoreResult<IngestOutcome> {
        let Some((rule, parsed)) = self.match_message(message) else {
            debug!(sender = %message.sender, "no rule matched message");
            return Ok(IngestOutcome::NoRuleMatched);
        };

        let message_id = self.store.new_id(SmsMessage::COLLECTION);
        let transaction_id = self.store.new_id(Transaction::COLLECTION);

        let mut stored_message = message.clone();
        stored_message.meta = SyncMeta::with_id(&message_id);
        let transaction = self.derive_transaction(&parsed, message, &message_id, &transaction_id);

        let fingerprint = Value::String(message.fingerprint.clone());
        let preconditions = vec![
            Precondition::NotContains {
                collection: DEDUP_COLLECTION.to_string(),
                id: DEDUP_DOCUMENT.to_string(),
                field: DEDUP_FIELD.to_string(),
                value: fingerprint.clone(),
            },
            Precondition::Absent {
                collection: SmsMessage::COLLECTION.to_string(),
                id: message_id.clone(),
            },
            Precondition::Absent {
                collection: Transaction::COLLECTION.to_string(),
                id: transaction_id.clone(),
            },
        ];
        let ops = vec![
            WriteOp::Set {
                collection: SmsMessage::COLLECTION.to_string(),
                id: message_id.clone(),
                doc: serde_json::to_value(&stored_message)?,
            },
            WriteOp::Set {
                collection: Transaction::COLLECTION.to_string(),
                id: transaction_id.clone(),
                doc: serde_json::to_value(&transaction)?,
            },
            WriteOp::AppendUnique {
                collection: DEDUP_COLLECTION.to_string(),
                id: DEDUP_DOCUMENT.to_string(),
                field: DEDUP_FIELD.to_string(),
                value: fingerprint,
            },
        ];

        match self.store.transaction(preconditions, ops).await {
            Ok(()) => {
                info!(
                    sender = %message.sender,
                    owner = %rule.owner_id,
                    amount = %parsed.amount,
                    transaction = %transaction_id,
                    "recorded transaction from sms"
                );
                Ok(IngestOutcome::Recorded {
                    message_id,
                    transaction_id,
                    parsed,
                })
            }
            Err(e @ StoreError::PreconditionFailed(_)) => {
                if !self.is_indexed(&message.fingerprint).await? {
                    warn!(message = %message_id, error = %e, "store issued an id already in use");
                    return Err(e);
                }
                debug!(fingerprint = %message.fingerprint, "sms already ingested");
                Ok(IngestOutcome::Duplicate)
            }
            Err(e) => Err(e),
        }
    }

    /// Ingest in order, stopping at the first store error.
    pub async fn ingest_all(&self, messages: &[SmsMessage]) -> StoreResult<IngestSummary> {
        let mut summary = IngestSummary::default();
        for message in messages {
            match self.ingest(message).await? {
                IngestOutcome::Recorded { .. } => summary.recorded += 1,
                IngestOutcome::Duplicate => summary.duplicates += 1,
                IngestOutcome::NoRuleMatched => summary.unmatched += 1,
            }
        }
        Ok(summary)
    }

    async fn is_indexed(&self, fingerprint: &str) -> StoreResult<bool> {
        let index = self.store.get(DEDUP_COLLECTION, DEDUP_DOCUMENT).await?;
        Ok(index
            .as_ref()
            .and_then(|doc| doc.get(DEDUP_FIELD))
            .and_then(Value::as_array)
            .is_some_and(|seen| seen.iter().any(|v| v.as_str() == Some(fingerprint))))
    }

    fn derive_transaction(
        &self,
        parsed: &ParsedData,
        message: &SmsMessage,
        message_id: &str,
        transaction_id: &str,
    ) -> Transaction {
        let occurred_on = parsed
            .date
            .unwrap_or_else(|| message.received_at.date_naive());

        let mut txn = Transaction::new(parsed.amount, parsed.kind, occurred_on);
        txn.meta = SyncMeta::with_id(transaction_id);
        txn.account_id = self.account_id.clone();
        txn.currency = parsed.currency.clone();
        txn.merchant = parsed.merchant.clone();
        txn.category = categorize(parsed.merchant.as_deref().unwrap_or(&message.body))
            .map(|c| c.name.to_string());
        txn.source_message_id = Some(message_id.to_string());
        txn
    }
}
