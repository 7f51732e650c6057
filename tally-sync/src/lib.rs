//! tally-sync: document-store contract and incremental sync repositories

pub mod collection;
pub mod error;
pub mod memory;
pub mod mirror;
pub mod repository;
pub mod status;
pub mod store;

pub use collection::{ChangeBatch, Collection};
pub use error::{StoreError, StoreResult};
pub use memory::{CacheMode, FaultPoint, InMemoryStore, StoreSnapshot};
pub use mirror::{Comparator, MirrorState, merge_by_id};
pub use repository::{SyncConfig, SyncRepository};
pub use status::{SyncPhase, SyncStatus};
pub use store::{DocumentStore, Precondition, Query, ReadSource, WriteAck, WriteOp};
