//! In-memory document store.
//!
//! Reference implementation of [`DocumentStore`] used by tests and by the CLI
//! (persisted as a JSON snapshot between runs). It simulates the pieces of a
//! managed cloud store that the sync layer depends on:
//! - a local cache that can start cold (cache reads return nothing until the
//!   collection has been read from the server or written locally)
//! - strictly increasing server timestamps
//! - long-poll change notification
//! - injectable faults and latency

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::{
    self, DocumentStore, Precondition, Query, ReadSource, WriteAck, WriteOp, FIELD_DELETED,
    FIELD_ID, FIELD_LAST_UPDATED,
};

/// Operation class a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Query,
    Changes,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Cache reads see everything the server has.
    Warm,
    /// Cache reads are empty until the collection is fetched from the server.
    Cold,
}

/// Serializable copy of every document in the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub next_id: u64,
    pub collections: BTreeMap<String, BTreeMap<String, Value>>,
}

#[derive(Debug, Clone)]
struct StoredDoc {
    last_updated: DateTime<Utc>,
    deleted: bool,
    body: Value,
}

#[derive(Debug, Default)]
struct Inner {
    collections: HashMap<String, BTreeMap<String, StoredDoc>>,
    warm: HashSet<String>,
    clock: Option<DateTime<Utc>>,
    next_id: u64,
    faults: HashMap<FaultPoint, u32>,
    latency: Option<Duration>,
    closed: bool,
}

impl Inner {
    /// Server timestamp: wall clock, bumped to stay strictly increasing.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.clock {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.clock = Some(ts);
        ts
    }

    fn take_fault(&mut self, point: FaultPoint) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        match self.faults.get_mut(&point) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StoreError::Unavailable(format!("injected {point:?} fault")))
            }
            _ => Ok(()),
        }
    }

    fn allocate_id(&mut self, collection: &str) -> String {
        self.next_id += 1;
        format!("{}-{:06}", collection, self.next_id)
    }

    fn body(&self, collection: &str, id: &str) -> Option<&Value> {
        self.collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|d| &d.body)
    }

    fn write(&mut self, collection: &str, id: &str, mut doc: Value) -> StoreResult<WriteAck> {
        let Value::Object(map) = &mut doc else {
            return Err(StoreError::Malformed(format!(
                "{collection}/{id} is not a JSON object"
            )));
        };

        let ts = self.tick();
        let deleted = map
            .get(FIELD_DELETED)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        map.insert(FIELD_ID.to_string(), Value::String(id.to_string()));
        map.insert(
            FIELD_LAST_UPDATED.to_string(),
            Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
        map.insert(FIELD_DELETED.to_string(), Value::Bool(deleted));

        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(
                id.to_string(),
                StoredDoc {
                    last_updated: ts,
                    deleted,
                    body: doc,
                },
            );

        Ok(WriteAck {
            id: id.to_string(),
            last_updated: ts,
        })
    }

    fn patch(
        &mut self,
        collection: &str,
        id: &str,
        field: &str,
        value: Value,
    ) -> StoreResult<WriteAck> {
        let mut body = self
            .body(collection, id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        if let Value::Object(map) = &mut body {
            map.insert(field.to_string(), value);
        }
        self.write(collection, id, body)
    }

    fn append_unique(
        &mut self,
        collection: &str,
        id: &str,
        field: &str,
        value: Value,
    ) -> StoreResult<WriteAck> {
        let mut body = self
            .body(collection, id)
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        if let Value::Object(map) = &mut body {
            let entry = map
                .entry(field.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            match entry {
                Value::Array(items) => {
                    if !items.contains(&value) {
                        items.push(value);
                    }
                }
                other => *other = Value::Array(vec![value]),
            }
        }
        self.write(collection, id, body)
    }

    /// Reason the precondition fails, if it does.
    fn violation(&self, pre: &Precondition) -> Option<String> {
        match pre {
            Precondition::Absent { collection, id } => self
                .body(collection, id)
                .map(|_| format!("{collection}/{id} already exists")),
            Precondition::NotContains {
                collection,
                id,
                field,
                value,
            } => {
                let contains = self
                    .body(collection, id)
                    .and_then(|b| b.get(field))
                    .and_then(Value::as_array)
                    .is_some_and(|items| items.contains(value));
                contains.then(|| format!("{collection}/{id}.{field} already contains {value}"))
            }
        }
    }

    /// Checks that would make `apply` fail, so a transaction fails before writing.
    fn validate(&self, op: &WriteOp) -> StoreResult<()> {
        match op {
            WriteOp::Set { collection, id, doc } if !doc.is_object() => Err(StoreError::Malformed(
                format!("{collection}/{id} is not a JSON object"),
            )),
            WriteOp::Patch { collection, id, .. } if self.body(collection, id).is_none() => {
                Err(StoreError::NotFound {
                    collection: collection.clone(),
                    id: id.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    fn apply(&mut self, op: WriteOp) -> StoreResult<WriteAck> {
        match op {
            WriteOp::Set { collection, id, doc } => {
                self.warm.insert(collection.clone());
                self.write(&collection, &id, doc)
            }
            WriteOp::Patch {
                collection,
                id,
                field,
                value,
            } => self.patch(&collection, &id, &field, value),
            WriteOp::AppendUnique {
                collection,
                id,
                field,
                value,
            } => {
                self.warm.insert(collection.clone());
                self.append_unique(&collection, &id, &field, value)
            }
        }
    }
}

pub struct InMemoryStore {
    inner: Mutex<Inner>,
    cache_mode: CacheMode,
    changed: Notify,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Store whose cache mirrors the server.
    pub fn new() -> Self {
        Self::with_cache_mode(CacheMode::Warm)
    }

    /// Store whose cache starts empty.
    pub fn cold() -> Self {
        Self::with_cache_mode(CacheMode::Cold)
    }

    pub fn with_cache_mode(cache_mode: CacheMode) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            cache_mode,
            changed: Notify::new(),
        }
    }

    pub fn from_snapshot(snapshot: StoreSnapshot, cache_mode: CacheMode) -> StoreResult<Self> {
        let store = Self::with_cache_mode(cache_mode);
        {
            let mut inner = store.lock();
            inner.next_id = snapshot.next_id;
            for (collection, docs) in snapshot.collections {
                for (id, body) in docs {
                    let last_updated = store::last_updated(&body).ok_or_else(|| {
                        StoreError::Malformed(format!("{collection}/{id} has no lastUpdated"))
                    })?;
                    let deleted = store::is_deleted(&body);
                    if inner.clock.is_none_or(|c| c < last_updated) {
                        inner.clock = Some(last_updated);
                    }
                    inner.collections.entry(collection.clone()).or_default().insert(
                        id,
                        StoredDoc {
                            last_updated,
                            deleted,
                            body,
                        },
                    );
                }
            }
        }
        Ok(store)
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.lock();
        StoreSnapshot {
            next_id: inner.next_id,
            collections: inner
                .collections
                .iter()
                .map(|(name, docs)| {
                    let docs = docs
                        .iter()
                        .map(|(id, d)| (id.clone(), d.body.clone()))
                        .collect();
                    (name.clone(), docs)
                })
                .collect(),
        }
    }

    /// Write a document server-side without touching the local cache,
    /// as if another device had written it.
    pub fn seed(&self, collection: &str, doc: Value) -> StoreResult<WriteAck> {
        let ack = {
            let mut inner = self.lock();
            let id = match doc.get(FIELD_ID).and_then(Value::as_str) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => inner.allocate_id(collection),
            };
            inner.write(collection, &id, doc)?
        };
        self.changed.notify_waiters();
        Ok(ack)
    }

    /// Make the next `times` operations of this class fail with `Unavailable`.
    pub fn fail_next(&self, point: FaultPoint, times: u32) {
        *self.lock().faults.entry(point).or_default() += times;
    }

    /// Delay applied before every async operation.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Shut the store down; pending and future calls fail with `Closed`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_waiters();
    }

    /// Number of documents in a collection, tombstones included.
    pub fn len(&self, collection: &str) -> usize {
        self.lock()
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn write_and_notify<F>(&self, f: F) -> StoreResult<WriteAck>
    where
        F: FnOnce(&mut Inner) -> StoreResult<WriteAck>,
    {
        let ack = {
            let mut inner = self.lock();
            inner.take_fault(FaultPoint::Write)?;
            f(&mut inner)?
        };
        self.changed.notify_waiters();
        Ok(ack)
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    fn new_id(&self, collection: &str) -> String {
        self.lock().allocate_id(collection)
    }

    async fn query(
        &self,
        collection: &str,
        query: &Query,
        source: ReadSource,
    ) -> StoreResult<Vec<Value>> {
        self.delay().await;
        let mut inner = self.lock();
        inner.take_fault(FaultPoint::Query)?;

        match source {
            ReadSource::Cache
                if self.cache_mode == CacheMode::Cold && !inner.warm.contains(collection) =>
            {
                debug!(collection, "cache miss");
                return Ok(Vec::new());
            }
            ReadSource::Server => {
                inner.warm.insert(collection.to_string());
            }
            ReadSource::Cache => {}
        }

        let mut docs: Vec<&StoredDoc> = inner
            .collections
            .get(collection)
            .map(|docs| docs.values().filter(|d| query.matches(&d.body)).collect())
            .unwrap_or_default();
        docs.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(docs.into_iter().take(limit).map(|d| d.body.clone()).collect())
    }

    async fn changes_since(
        &self,
        collection: &str,
        cursor: DateTime<Utc>,
    ) -> StoreResult<Vec<Value>> {
        self.delay().await;
        loop {
            // Registered before the check so a write between check and await still wakes us.
            let notified = self.changed.notified();
            {
                let mut inner = self.lock();
                inner.take_fault(FaultPoint::Changes)?;
                let mut batch: Vec<&StoredDoc> = inner
                    .collections
                    .get(collection)
                    .map(|docs| docs.values().filter(|d| d.last_updated > cursor).collect())
                    .unwrap_or_default();
                if !batch.is_empty() {
                    batch.sort_by_key(|d| d.last_updated);
                    return Ok(batch.into_iter().map(|d| d.body.clone()).collect());
                }
            }
            notified.await;
        }
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Value>> {
        self.delay().await;
        let mut inner = self.lock();
        inner.take_fault(FaultPoint::Query)?;
        Ok(inner.body(collection, id).cloned())
    }

    async fn create(&self, collection: &str, doc: Value) -> StoreResult<WriteAck> {
        self.delay().await;
        self.write_and_notify(|inner| {
            let id = inner.allocate_id(collection);
            inner.warm.insert(collection.to_string());
            inner.write(collection, &id, doc)
        })
    }

    async fn set(&self, collection: &str, id: &str, doc: Value) -> StoreResult<WriteAck> {
        self.delay().await;
        self.write_and_notify(|inner| {
            inner.warm.insert(collection.to_string());
            inner.write(collection, id, doc)
        })
    }

    async fn patch_field(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        value: Value,
    ) -> StoreResult<WriteAck> {
        self.delay().await;
        self.write_and_notify(|inner| inner.patch(collection, id, field, value))
    }

    async fn transaction(
        &self,
        preconditions: Vec<Precondition>,
        ops: Vec<WriteOp>,
    ) -> StoreResult<()> {
        self.delay().await;
        {
            let mut inner = self.lock();
            inner.take_fault(FaultPoint::Write)?;

            if let Some(reason) = preconditions.iter().find_map(|p| inner.violation(p)) {
                return Err(StoreError::PreconditionFailed(reason));
            }
            for op in &ops {
                inner.validate(op)?;
            }
            for op in ops {
                inner.apply(op)?;
            }
        }
        self.changed.notify_waiters();
        Ok(())
    }
}
