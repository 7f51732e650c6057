use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tally_core::{Category, CategoryKind, SyncEntity};
use tally_sync::{
    DocumentStore, FaultPoint, InMemoryStore, Precondition, Query, ReadSource, StoreResult,
    SyncConfig, SyncPhase, SyncRepository, WriteAck, WriteOp,
};
use tokio::time::timeout;

fn doc(cat: &Category) -> serde_json::Value {
    serde_json::to_value(cat).unwrap()
}

fn fast_config(max_retries: u32) -> SyncConfig {
    SyncConfig {
        retry_base: Duration::from_millis(10),
        retry_max: Duration::from_millis(50),
        max_retries,
    }
}

fn by_name(store: Arc<InMemoryStore>) -> SyncRepository<Category> {
    SyncRepository::with_comparator(store, fast_config(3), |a: &Category, b: &Category| {
        a.name.cmp(&b.name)
    })
}

fn names(items: &[Category]) -> Vec<&str> {
    items.iter().map(|c| c.name.as_str()).collect()
}

async fn wait_for_mirror<F>(repo: &SyncRepository<Category>, mut pred: F) -> Arc<Vec<Category>>
where
    F: FnMut(&[Category]) -> bool,
{
    let mut rx = repo.subscribe();
    let snapshot = timeout(Duration::from_secs(5), rx.wait_for(|items| pred(items.as_slice())))
        .await
        .expect("mirror did not reach expected state")
        .expect("mirror channel closed");
    snapshot.clone()
}

#[tokio::test]
async fn test_bootstrap_from_cache_publishes_sorted_batch() {
    let store = Arc::new(InMemoryStore::new());
    store.seed("categories", doc(&Category::new("Rent", CategoryKind::Expense))).unwrap();
    let newest = store
        .seed("categories", doc(&Category::new("Food", CategoryKind::Expense)))
        .unwrap();

    let repo = by_name(store.clone());
    repo.load_all();
    let status = repo.wait_settled().await;

    assert_eq!(status.phase, SyncPhase::PopulatedListening);
    assert_eq!(status.cursor, Some(newest.last_updated));
    assert_eq!(names(&repo.snapshot()), vec!["Food", "Rent"]);
}

#[tokio::test]
async fn test_bootstrap_falls_back_to_server_when_cache_empty() {
    let store = Arc::new(InMemoryStore::cold());
    store.seed("categories", doc(&Category::new("Salary", CategoryKind::Income))).unwrap();
    let newest = store
        .seed("categories", doc(&Category::new("Bills", CategoryKind::Expense)))
        .unwrap();

    // The cache really is empty before the repository runs.
    let cached = store
        .query("categories", &Query::active(), ReadSource::Cache)
        .await
        .unwrap();
    assert!(cached.is_empty());

    let repo = by_name(store.clone());
    repo.load_all();
    let status = repo.wait_settled().await;

    assert_eq!(names(&repo.snapshot()), vec!["Bills", "Salary"]);
    assert_eq!(status.cursor, Some(newest.last_updated));
}

#[tokio::test]
async fn test_empty_collection_listens_from_now() {
    let store = Arc::new(InMemoryStore::new());
    let repo = by_name(store.clone());

    let before = Utc::now();
    repo.load_all();
    let status = repo.wait_settled().await;
    let after = Utc::now();

    assert_eq!(status.phase, SyncPhase::EmptyListening);
    let cursor = status.cursor.unwrap();
    assert!(cursor >= before && cursor <= after);
    assert_eq!(status.skipped_documents, 0);
    assert!(repo.snapshot().is_empty());

    let mut food = Category::new("Food", CategoryKind::Expense);
    repo.save(&mut food).await.unwrap();

    let mirror = wait_for_mirror(&repo, |items| items.len() == 1).await;
    assert_eq!(mirror[0].id(), food.id());
    assert_eq!(repo.current_status().phase, SyncPhase::PopulatedListening);
}

#[tokio::test]
async fn test_save_assigns_id_then_updates_in_place() {
    let store = Arc::new(InMemoryStore::new());
    let repo = by_name(store.clone());
    repo.load_all();
    repo.wait_settled().await;

    let mut cat = Category::new("Travel", CategoryKind::Expense);
    assert!(cat.id().is_none());
    repo.save(&mut cat).await.unwrap();
    let id = cat.id().unwrap().to_string();
    let first_write = cat.last_updated().unwrap();

    cat.name = "Trips".to_string();
    repo.save(&mut cat).await.unwrap();
    assert_eq!(cat.id(), Some(id.as_str()));
    assert!(cat.last_updated().unwrap() > first_write);

    let mirror = wait_for_mirror(&repo, |items| names(items) == vec!["Trips"]).await;
    assert_eq!(mirror.len(), 1);
    assert_eq!(store.len("categories"), 1);
}

#[tokio::test]
async fn test_delete_is_a_tombstone() {
    let store = Arc::new(InMemoryStore::new());
    let repo = by_name(store.clone());
    repo.load_all();
    repo.wait_settled().await;

    let mut cat = Category::new("Gym", CategoryKind::Expense);
    repo.save(&mut cat).await.unwrap();
    wait_for_mirror(&repo, |items| items.len() == 1).await;

    let id = cat.id().unwrap().to_string();
    repo.delete_by_id(&id).await.unwrap();
    wait_for_mirror(&repo, |items| items.is_empty()).await;

    let stored = store.get("categories", &id).await.unwrap().unwrap();
    assert_eq!(stored["deleted"], true);
    assert_eq!(stored["name"], "Gym");
}

#[tokio::test]
async fn test_tombstones_from_tail_never_surface() {
    let store = Arc::new(InMemoryStore::new());
    let repo = by_name(store.clone());
    repo.load_all();
    repo.wait_settled().await;

    let mut ghost = Category::new("Ghost", CategoryKind::Expense);
    ghost.meta.deleted = true;
    store.seed("categories", doc(&ghost)).unwrap();
    store.seed("categories", doc(&Category::new("Real", CategoryKind::Expense))).unwrap();

    let mirror = wait_for_mirror(&repo, |items| !items.is_empty()).await;
    assert_eq!(names(&mirror), vec!["Real"]);
}

#[tokio::test]
async fn test_bootstrap_failure_reports_stall() {
    let store = Arc::new(InMemoryStore::new());
    store.fail_next(FaultPoint::Query, 1);

    let repo: SyncRepository<Category> = SyncRepository::new(store, fast_config(0));
    repo.load_all();
    let status = repo.wait_settled().await;

    assert_eq!(status.phase, SyncPhase::Stalled);
    assert!(status.last_error.unwrap().contains("injected"));
    assert_eq!(status.consecutive_failures, 1);
}

#[tokio::test]
async fn test_tail_recovers_after_transient_failure() {
    let store = Arc::new(InMemoryStore::new());
    let repo = by_name(store.clone());
    repo.load_all();
    repo.wait_settled().await;

    store.fail_next(FaultPoint::Changes, 2);
    store.seed("categories", doc(&Category::new("Fuel", CategoryKind::Expense))).unwrap();

    let mirror = wait_for_mirror(&repo, |items| items.len() == 1).await;
    assert_eq!(names(&mirror), vec!["Fuel"]);

    let status = repo.current_status();
    assert!(status.is_listening());
    assert!(status.last_error.is_none());
    assert_eq!(status.batches_applied, 1);
}

#[tokio::test]
async fn test_close_stops_mirror_updates() {
    let store = Arc::new(InMemoryStore::new());
    let repo = by_name(store.clone());
    repo.load_all();
    repo.wait_settled().await;

    repo.close();
    store.seed("categories", doc(&Category::new("Late", CategoryKind::Expense))).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(repo.snapshot().is_empty());
    assert_eq!(repo.current_status().phase, SyncPhase::Closed);
}

#[tokio::test]
async fn test_close_mid_bootstrap_discards_in_flight_read() {
    let store = Arc::new(InMemoryStore::new());
    store.seed("categories", doc(&Category::new("Slow", CategoryKind::Expense))).unwrap();
    store.set_latency(Some(Duration::from_millis(100)));

    let repo = by_name(store.clone());
    repo.load_all();
    tokio::time::sleep(Duration::from_millis(10)).await;
    repo.close();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(repo.snapshot().is_empty());
    assert_eq!(repo.current_status().phase, SyncPhase::Closed);
}

#[tokio::test]
async fn test_find_by_query_for_uniqueness_check() {
    let store = Arc::new(InMemoryStore::new());
    let repo = by_name(store.clone());

    let mut food = Category::new("Food", CategoryKind::Expense);
    repo.save(&mut food).await.unwrap();

    let existing = repo
        .find_by_query(&Query::active().field_eq("name", "Food"))
        .await
        .unwrap();
    assert_eq!(existing.len(), 1);

    repo.delete_by_id(food.id().unwrap()).await.unwrap();
    let existing = repo
        .find_by_query(&Query::active().field_eq("name", "Food"))
        .await
        .unwrap();
    assert!(existing.is_empty());

    let all = repo
        .find_by_query(&Query::all().field_eq("name", "Food"))
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].is_deleted());
}

#[tokio::test]
async fn test_reload_restarts_from_store() {
    let store = Arc::new(InMemoryStore::new());
    let repo = by_name(store.clone());
    repo.load_all();
    repo.wait_settled().await;

    store.seed("categories", doc(&Category::new("A", CategoryKind::Expense))).unwrap();
    wait_for_mirror(&repo, |items| items.len() == 1).await;

    repo.load_all();
    let status = repo.wait_settled().await;
    assert_eq!(status.phase, SyncPhase::PopulatedListening);
    assert_eq!(status.batches_applied, 0);
    assert_eq!(names(&repo.snapshot()), vec!["A"]);
}

/// Counts tail polls made against the wrapped store.
struct CountingStore {
    inner: Arc<InMemoryStore>,
    polls: AtomicUsize,
}

#[async_trait]
impl DocumentStore for CountingStore {
    fn new_id(&self, collection: &str) -> String {
        self.inner.new_id(collection)
    }

    async fn query(
        &self,
        collection: &str,
        query: &Query,
        source: ReadSource,
    ) -> StoreResult<Vec<Value>> {
        self.inner.query(collection, query, source).await
    }

    async fn changes_since(
        &self,
        collection: &str,
        cursor: DateTime<Utc>,
    ) -> StoreResult<Vec<Value>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.inner.changes_since(collection, cursor).await
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Value>> {
        self.inner.get(collection, id).await
    }

    async fn create(&self, collection: &str, doc: Value) -> StoreResult<WriteAck> {
        self.inner.create(collection, doc).await
    }

    async fn set(&self, collection: &str, id: &str, doc: Value) -> StoreResult<WriteAck> {
        self.inner.set(collection, id, doc).await
    }

    async fn patch_field(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        value: Value,
    ) -> StoreResult<WriteAck> {
        self.inner.patch_field(collection, id, field, value).await
    }

    async fn transaction(
        &self,
        preconditions: Vec<Precondition>,
        ops: Vec<WriteOp>,
    ) -> StoreResult<()> {
        self.inner.transaction(preconditions, ops).await
    }
}

#[tokio::test]
async fn test_undecodable_document_is_skipped_not_replayed() {
    let inner = Arc::new(InMemoryStore::new());
    let store = Arc::new(CountingStore {
        inner: inner.clone(),
        polls: AtomicUsize::new(0),
    });
    let repo: SyncRepository<Category> = SyncRepository::new(store.clone(), fast_config(3));
    repo.load_all();
    repo.wait_settled().await;

    inner.seed("categories", json!({"name": 42})).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    inner
        .seed("categories", doc(&Category::new("Valid", CategoryKind::Expense)))
        .unwrap();

    let mirror = wait_for_mirror(&repo, |items| items.len() == 1).await;
    assert_eq!(names(&mirror), vec!["Valid"]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(store.polls.load(Ordering::SeqCst) < 10);

    let status = repo.current_status();
    assert_eq!(status.skipped_documents, 1);
    assert_eq!(status.phase, SyncPhase::PopulatedListening);
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn test_transient_bootstrap_failure_still_settles_listening() {
    let store = Arc::new(InMemoryStore::new());
    store.seed("categories", doc(&Category::new("Rent", CategoryKind::Expense))).unwrap();
    store.fail_next(FaultPoint::Query, 1);

    let repo = by_name(store.clone());
    let mut status_rx = repo.status();
    repo.load_all();

    let retrying = timeout(
        Duration::from_secs(5),
        status_rx.wait_for(|s| s.phase == SyncPhase::Retrying || s.is_listening()),
    )
    .await
    .expect("status never left bootstrapping")
    .unwrap()
    .clone();
    assert!(!retrying.is_stalled());

    let status = repo.wait_settled().await;
    assert_eq!(status.phase, SyncPhase::PopulatedListening);
    assert_eq!(status.consecutive_failures, 0);
    assert!(status.last_error.is_none());
    assert_eq!(names(&repo.snapshot()), vec!["Rent"]);
}

#[tokio::test]
async fn test_empty_bootstrap_cursor_predates_the_reads() {
    let store = Arc::new(InMemoryStore::cold());
    store.set_latency(Some(Duration::from_millis(50)));
    let repo = by_name(store.clone());

    let before = Utc::now();
    repo.load_all();
    let status = repo.wait_settled().await;

    assert_eq!(status.phase, SyncPhase::EmptyListening);
    // Two reads at 50ms each happened after the cursor was taken.
    let cursor = status.cursor.unwrap();
    assert!(cursor - before < chrono::Duration::milliseconds(50));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_is_final_under_concurrent_writes() {
    let store = Arc::new(InMemoryStore::new());
    let repo = by_name(store.clone());
    repo.load_all();
    repo.wait_settled().await;

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            for i in 0..400 {
                let cat = Category::new(format!("c{i:03}"), CategoryKind::Expense);
                store.seed("categories", doc(&cat)).unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    wait_for_mirror(&repo, |items| items.len() >= 20).await;
    repo.close();
    let frozen = repo.snapshot();
    assert_eq!(repo.current_status().phase, SyncPhase::Closed);

    writer.await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(Arc::ptr_eq(&frozen, &repo.snapshot()));
    assert_eq!(repo.current_status().phase, SyncPhase::Closed);
}
