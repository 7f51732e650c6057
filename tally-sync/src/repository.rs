//! Incremental sync repository.
//!
//! One repository owns the local mirror of one collection. `load_all` spawns a
//! single task that bootstraps the mirror and then tails the collection:
//!
//! 1. read active records from the cache, newest first
//! 2. if that is empty, read them from the server
//! 3. publish the batch; the cursor is its newest `lastUpdated`
//!    (or the current time when the collection is empty)
//! 4. loop: wait for records newer than the cursor, merge them by id,
//!    advance the cursor
//!
//! The mirror and the sync status are published through `watch` channels, so
//! consumers only ever see whole snapshots. Store errors are retried with
//! exponential backoff and reported through [`SyncStatus`].

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tally_core::SyncEntity;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::collection::Collection;
use crate::error::{StoreError, StoreResult};
use crate::mirror::{Comparator, MirrorState};
use crate::status::{SyncPhase, SyncStatus};
use crate::store::{DocumentStore, Query, ReadSource};

/// Retry policy for the bootstrap and tail loop.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Delay before the first retry; doubles on each consecutive failure.
    pub retry_base: Duration,
    /// Upper bound for the retry delay.
    pub retry_max: Duration,
    /// Consecutive failures tolerated before the repository stays stalled.
    pub max_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_base: Duration::from_millis(500),
            retry_max: Duration::from_secs(30),
            max_retries: 5,
        }
    }
}

impl SyncConfig {
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.retry_base.saturating_mul(factor).min(self.retry_max)
    }
}

struct Shared<T> {
    collection: Collection<T>,
    config: SyncConfig,
    comparator: Option<Comparator<T>>,
    mirror: watch::Sender<Arc<Vec<T>>>,
    status: watch::Sender<SyncStatus>,
    /// Bumped on every restart and on close. A task only publishes while
    /// the generation it was started with is still current.
    generation: AtomicU64,
}

impl<T: SyncEntity> Shared<T> {
    fn is_current(&self, run: u64) -> bool {
        self.generation.load(AtomicOrdering::SeqCst) == run
    }

    /// Invalidate the running task. The bump happens under the mirror lock,
    /// so a publish that already checked the generation finishes first.
    fn retire(&self) -> u64 {
        let mut next = 0;
        self.mirror.send_if_modified(|_| {
            next = self.generation.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            false
        });
        next
    }

    fn publish(&self, run: u64, items: &[T]) -> bool {
        self.mirror.send_if_modified(|mirror| {
            if !self.is_current(run) {
                return false;
            }
            *mirror = Arc::new(items.to_vec());
            true
        })
    }

    fn update_status<F>(&self, run: u64, f: F) -> bool
    where
        F: FnOnce(&mut SyncStatus),
    {
        self.status.send_if_modified(|status| {
            if !self.is_current(run) {
                return false;
            }
            f(status);
            true
        })
    }

    async fn run(self: Arc<Self>, run: u64) {
        let mut failures = 0u32;
        let mut state = loop {
            match self.bootstrap().await {
                Ok(state) => break state,
                Err(e) => {
                    if !self.backoff(run, &e, &mut failures).await {
                        return;
                    }
                }
            }
        };

        info!(
            collection = self.collection.name(),
            records = state.items().len(),
            "mirror bootstrapped"
        );
        if !self.publish(run, state.items()) {
            return;
        }
        self.mark_healthy(run, &state, false);
        failures = 0;

        while let Some(cursor) = state.cursor() {
            let batch = match self.collection.changes_since(cursor).await {
                Ok(batch) => batch,
                Err(e) => {
                    if !self.backoff(run, &e, &mut failures).await {
                        return;
                    }
                    continue;
                }
            };

            let received = batch.items.len();
            let applied = state.apply(batch.items, self.comparator.as_ref());
            state.advance_to(batch.newest);

            if batch.skipped > 0 {
                warn!(
                    collection = self.collection.name(),
                    skipped = batch.skipped,
                    "change batch contained undecodable documents"
                );
                self.update_status(run, |s| s.skipped_documents += batch.skipped as u64);
            }

            if state.cursor() <= Some(cursor) {
                let err = StoreError::Malformed(format!(
                    "change batch for {} does not advance past {cursor}",
                    self.collection.name()
                ));
                if !self.backoff(run, &err, &mut failures).await {
                    return;
                }
                continue;
            }

            if applied {
                debug!(
                    collection = self.collection.name(),
                    received,
                    cursor = ?state.cursor(),
                    "merged change batch"
                );
                if !self.publish(run, state.items()) {
                    return;
                }
            }
            self.mark_healthy(run, &state, applied);
            failures = 0;
        }
    }

    async fn bootstrap(&self) -> StoreResult<MirrorState<T>> {
        // Taken before reading: an empty collection is tailed from here, so a
        // write landing during the reads is still delivered.
        let started = Utc::now();
        let mut batch = self.collection.query_active(ReadSource::Cache).await?;
        if batch.is_empty() {
            debug!(
                collection = self.collection.name(),
                "cache empty, reading from server"
            );
            batch = self.collection.query_active(ReadSource::Server).await?;
        }
        Ok(MirrorState::bootstrap(
            batch,
            started,
            self.comparator.as_ref(),
        ))
    }

    fn mark_healthy(&self, run: u64, state: &MirrorState<T>, applied: bool) {
        let phase = if state.is_empty() {
            SyncPhase::EmptyListening
        } else {
            SyncPhase::PopulatedListening
        };
        self.update_status(run, |s| {
            s.phase = phase;
            s.cursor = state.cursor();
            s.consecutive_failures = 0;
            s.last_error = None;
            if applied {
                s.batches_applied += 1;
            }
        });
    }

    fn note_error(&self, err: &StoreError) {
        self.status
            .send_modify(|s| s.last_error = Some(err.to_string()));
    }

    /// Records the failure and sleeps before the next attempt.
    /// Returns false when the loop should stop.
    async fn backoff(&self, run: u64, err: &StoreError, failures: &mut u32) -> bool {
        *failures += 1;
        let attempt = *failures;
        let give_up = matches!(err, StoreError::Closed) || attempt > self.config.max_retries;

        let current = self.update_status(run, |s| {
            s.phase = if give_up {
                SyncPhase::Stalled
            } else {
                SyncPhase::Retrying
            };
            s.consecutive_failures = attempt;
            s.last_error = Some(err.to_string());
        });
        if !current {
            return false;
        }

        if give_up {
            warn!(
                collection = self.collection.name(),
                error = %err,
                attempts = attempt,
                "sync stalled"
            );
            return false;
        }

        let delay = self.config.retry_delay(attempt);
        warn!(
            collection = self.collection.name(),
            error = %err,
            attempt,
            "sync failed, retrying in {:?}",
            delay
        );
        tokio::time::sleep(delay).await;
        true
    }
}

/// Keeps an observable mirror of one collection's active records.
///
/// Must be used from within a tokio runtime; `load_all` spawns a task.
pub struct SyncRepository<T: SyncEntity> {
    shared: Arc<Shared<T>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: SyncEntity> SyncRepository<T> {
    pub fn new(store: Arc<dyn DocumentStore>, config: SyncConfig) -> Self {
        Self::from_parts(Collection::new(store), config, None)
    }

    /// Repository whose mirror is kept ordered by `cmp` (stable sort after every mutation).
    pub fn with_comparator<F>(store: Arc<dyn DocumentStore>, config: SyncConfig, cmp: F) -> Self
    where
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        Self::from_parts(Collection::new(store), config, Some(Arc::new(cmp)))
    }

    pub fn from_parts(
        collection: Collection<T>,
        config: SyncConfig,
        comparator: Option<Comparator<T>>,
    ) -> Self {
        let (mirror, _) = watch::channel(Arc::new(Vec::new()));
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            shared: Arc::new(Shared {
                collection,
                config,
                comparator,
                mirror,
                status,
                generation: AtomicU64::new(0),
            }),
            task: Mutex::new(None),
        }
    }

    /// Start (or restart) bootstrap and tailing. Returns immediately; results
    /// arrive through [`subscribe`](Self::subscribe).
    pub fn load_all(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        let run = self.shared.retire();
        if let Some(previous) = task.take() {
            previous.abort();
        }

        self.shared.update_status(run, |s| {
            s.phase = SyncPhase::Bootstrapping;
            s.batches_applied = 0;
            s.skipped_documents = 0;
        });
        *task = Some(tokio::spawn(self.shared.clone().run(run)));
    }

    /// Stream of active-record snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<T>>> {
        self.shared.mirror.subscribe()
    }

    pub fn snapshot(&self) -> Arc<Vec<T>> {
        self.shared.mirror.borrow().clone()
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.shared.status.subscribe()
    }

    pub fn current_status(&self) -> SyncStatus {
        self.shared.status.borrow().clone()
    }

    /// Wait until bootstrap has either published a mirror or stalled.
    pub async fn wait_settled(&self) -> SyncStatus {
        let mut rx = self.status();
        match rx.wait_for(SyncStatus::is_settled).await {
            Ok(status) => status.clone(),
            Err(_) => self.current_status(),
        }
    }

    /// Create-or-update. New records get their store-issued id stamped back.
    /// The mirror picks the write up through the tail.
    pub async fn save(&self, entity: &mut T) -> StoreResult<()> {
        self.shared
            .collection
            .save(entity)
            .await
            .inspect_err(|e| self.shared.note_error(e))
    }

    /// Tombstone the record remotely. The mirror drops it when the tail
    /// delivers the tombstone.
    pub async fn delete_by_id(&self, id: &str) -> StoreResult<()> {
        self.shared
            .collection
            .mark_deleted(id)
            .await
            .map(|_| ())
            .inspect_err(|e| self.shared.note_error(e))
    }

    /// Server read that bypasses the mirror. Check-then-create built on this
    /// is not atomic: two concurrent callers can both see "absent".
    pub async fn find_by_query(&self, query: &Query) -> StoreResult<Vec<T>> {
        self.shared
            .collection
            .find(query)
            .await
            .inspect_err(|e| self.shared.note_error(e))
    }

    /// Stop tailing. Once this returns neither the mirror nor the phase is
    /// touched by the task again, even if it was mid-poll.
    pub fn close(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        self.shared.retire();
        if let Some(handle) = task.take() {
            handle.abort();
        }
        self.shared
            .status
            .send_modify(|s| s.phase = SyncPhase::Closed);
    }
}

impl<T: SyncEntity> Drop for SyncRepository<T> {
    fn drop(&mut self) {
        self.shared.retire();
        if let Some(handle) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
