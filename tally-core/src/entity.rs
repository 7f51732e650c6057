//! Sync entity contract shared by every record kept in the remote store.
//!
//! Every record carries the same three bookkeeping fields:
//! - `id`: issued by the store on first write, immutable afterwards
//! - `lastUpdated`: assigned by the store on every write, the only ordering key
//!   used for incremental sync
//! - `deleted`: tombstone flag; records are never physically removed

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Bookkeeping fields embedded (flattened) into every synced record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted: bool,
}

impl SyncMeta {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }
}

/// A record type that can be mirrored by a sync repository.
pub trait SyncEntity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Name of the remote collection holding this record type.
    const COLLECTION: &'static str;

    fn meta(&self) -> &SyncMeta;
    fn meta_mut(&mut self) -> &mut SyncMeta;

    fn id(&self) -> Option<&str> {
        self.meta().id.as_deref().filter(|id| !id.is_empty())
    }

    fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.meta().last_updated
    }

    fn is_deleted(&self) -> bool {
        self.meta().deleted
    }
}

/// Implements [`SyncEntity`] for a struct with a `meta: SyncMeta` field.
#[macro_export]
macro_rules! sync_entity {
    ($ty:ty, $collection:expr) => {
        impl $crate::entity::SyncEntity for $ty {
            const COLLECTION: &'static str = $collection;

            fn meta(&self) -> &$crate::entity::SyncMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut $crate::entity::SyncMeta {
                &mut self.meta
            }
        }
    };
}
