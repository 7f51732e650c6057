//! Typed view over one store collection.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tally_core::SyncEntity;
use tracing::warn;

use crate::error::{StoreError, StoreResult};
use crate::store::{self, DocumentStore, Query, ReadSource, FIELD_DELETED};

/// One result of [`Collection::changes_since`].
#[derive(Debug, Clone)]
pub struct ChangeBatch<T> {
    pub items: Vec<T>,
    /// Newest `lastUpdated` among the delivered documents, decodable or not
    pub newest: Option<DateTime<Utc>>,
    /// Documents that failed to decode and were left out of `items`
    pub skipped: usize,
}

/// Converts between `T` and store documents for the collection `T::COLLECTION`
/// (or an explicit name).
pub struct Collection<T> {
    store: Arc<dyn DocumentStore>,
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: SyncEntity> Collection<T> {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::named(store, T::COLLECTION)
    }

    pub fn named(store: Arc<dyn DocumentStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Active records, newest first.
    pub async fn query_active(&self, source: ReadSource) -> StoreResult<Vec<T>> {
        let docs = self.store.query(&self.name, &Query::active(), source).await?;
        Ok(self.decode_all(docs))
    }

    /// Server read with arbitrary filters, bypassing any cache.
    pub async fn find(&self, query: &Query) -> StoreResult<Vec<T>> {
        let docs = self.store.query(&self.name, query, ReadSource::Server).await?;
        Ok(self.decode_all(docs))
    }

    /// Next batch of records (tombstones included) newer than `cursor`.
    pub async fn changes_since(&self, cursor: DateTime<Utc>) -> StoreResult<ChangeBatch<T>> {
        let docs = self.store.changes_since(&self.name, cursor).await?;
        let newest = docs.iter().filter_map(store::last_updated).max();
        let delivered = docs.len();
        let items = self.decode_all(docs);
        Ok(ChangeBatch {
            skipped: delivered - items.len(),
            items,
            newest,
        })
    }

    pub async fn get(&self, id: &str) -> StoreResult<Option<T>> {
        self.store
            .get(&self.name, id)
            .await?
            .map(|doc| serde_json::from_value(doc).map_err(StoreError::from))
            .transpose()
    }

    /// Create-or-update. A record without an id is created and receives the
    /// store-issued id; either way its `lastUpdated` is refreshed.
    pub async fn save(&self, entity: &mut T) -> StoreResult<()> {
        let doc = serde_json::to_value(&*entity)?;
        let ack = match entity.id().map(str::to_string) {
            Some(id) => self.store.set(&self.name, &id, doc).await?,
            None => self.store.create(&self.name, doc).await?,
        };

        let meta = entity.meta_mut();
        meta.id = Some(ack.id);
        meta.last_updated = Some(ack.last_updated);
        Ok(())
    }

    /// Set the tombstone flag on the remote record.
    pub async fn mark_deleted(&self, id: &str) -> StoreResult<DateTime<Utc>> {
        let ack = self
            .store
            .patch_field(&self.name, id, FIELD_DELETED, Value::Bool(true))
            .await?;
        Ok(ack.last_updated)
    }

    /// Documents that fail to decode are skipped so one bad record cannot
    /// stall the collection.
    fn decode_all(&self, docs: Vec<Value>) -> Vec<T> {
        docs.into_iter()
            .filter_map(|doc| match serde_json::from_value::<T>(doc) {
                Ok(entity) => Some(entity),
                Err(e) => {
                    warn!(collection = %self.name, error = %e, "skipping undecodable document");
                    None
                }
            })
            .collect()
    }
}
