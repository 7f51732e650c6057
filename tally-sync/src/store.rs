//! Remote document-store contract.
//!
//! Documents are JSON objects grouped in named collections. The store owns
//! three bookkeeping fields on every document:
//! - `id`: generated on create (or chosen via [`DocumentStore::new_id`])
//! - `lastUpdated`: server timestamp, strictly increasing across writes
//! - `deleted`: tombstone flag, documents are never physically removed

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::StoreResult;

pub const FIELD_ID: &str = "id";
pub const FIELD_LAST_UPDATED: &str = "lastUpdated";
pub const FIELD_DELETED: &str = "deleted";

/// Where a read should be served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Local cache when available; may be empty or stale.
    Cache,
    /// Authoritative server read.
    Server,
}

/// Equality-filtered read over one collection, newest `lastUpdated` first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<(String, Value)>,
    pub include_deleted: bool,
    pub limit: Option<usize>,
}

impl Query {
    /// Every non-tombstoned document.
    pub fn active() -> Self {
        Self::default()
    }

    /// Every document, tombstones included.
    pub fn all() -> Self {
        Self {
            include_deleted: true,
            ..Self::default()
        }
    }

    pub fn field_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Whether a stored document satisfies the filters.
    pub fn matches(&self, doc: &Value) -> bool {
        if !self.include_deleted && is_deleted(doc) {
            return false;
        }
        self.filters
            .iter()
            .all(|(field, expected)| doc.get(field) == Some(expected))
    }
}

/// Condition checked inside a transaction before any write is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Precondition {
    /// No document with this id exists in the collection.
    Absent { collection: String, id: String },
    /// The array `field` of the document does not contain `value`.
    /// A missing document or field counts as not containing it.
    NotContains {
        collection: String,
        id: String,
        field: String,
        value: Value,
    },
}

/// One write inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create or overwrite a whole document.
    Set {
        collection: String,
        id: String,
        doc: Value,
    },
    /// Update a single field of an existing document.
    Patch {
        collection: String,
        id: String,
        field: String,
        value: Value,
    },
    /// Append `value` to the array `field` unless already present,
    /// creating the document if needed.
    AppendUnique {
        collection: String,
        id: String,
        field: String,
        value: Value,
    },
}

/// Acknowledgement of a single-document write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    pub id: String,
    pub last_updated: DateTime<Utc>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Reserve a fresh document id without writing anything.
    fn new_id(&self, collection: &str) -> String;

    async fn query(
        &self,
        collection: &str,
        query: &Query,
        source: ReadSource,
    ) -> StoreResult<Vec<Value>>;

    /// Resolves once at least one document (tombstones included) has
    /// `lastUpdated > cursor`, returning all such documents oldest first.
    async fn changes_since(
        &self,
        collection: &str,
        cursor: DateTime<Utc>,
    ) -> StoreResult<Vec<Value>>;

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Value>>;

    /// Insert a new document; the generated id is stamped into it.
    async fn create(&self, collection: &str, doc: Value) -> StoreResult<WriteAck>;

    /// Overwrite (or create) the document with this id.
    async fn set(&self, collection: &str, id: &str, doc: Value) -> StoreResult<WriteAck>;

    async fn patch_field(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        value: Value,
    ) -> StoreResult<WriteAck>;

    /// Apply all `ops` atomically if every precondition holds.
    async fn transaction(&self, preconditions: Vec<Precondition>, ops: Vec<WriteOp>)
    -> StoreResult<()>;
}

pub fn is_deleted(doc: &Value) -> bool {
    doc.get(FIELD_DELETED).and_then(Value::as_bool).unwrap_or(false)
}

pub fn last_updated(doc: &Value) -> Option<DateTime<Utc>> {
    doc.get(FIELD_LAST_UPDATED)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
