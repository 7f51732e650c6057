//! Local mirror of a remote collection's active records.
//!
//! The mirror only moves forward:
//! - the cursor is the newest `lastUpdated` seen and never decreases
//! - change batches are filtered to records newer than the cursor before merging
//! - a record never replaces a mirrored copy with a newer `lastUpdated`

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::sync::Arc;
use tally_core::SyncEntity;
use tracing::warn;

/// Caller-supplied ordering re-applied after every mutation (stable sort).
pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Newest `lastUpdated` in a batch.
pub fn newest<T: SyncEntity>(batch: &[T]) -> Option<DateTime<Utc>> {
    batch.iter().filter_map(|e| e.last_updated()).max()
}

/// Merge `batch` into `current` by id.
///
/// Tombstoned records remove their id from the result, live records replace
/// the entry with the same id or are appended. Idempotent.
pub fn merge_by_id<T: SyncEntity>(current: &[T], batch: &[T]) -> Vec<T> {
    let mut out = current.to_vec();

    for incoming in batch {
        let Some(id) = incoming.id() else {
            warn!("ignoring record without id in change batch");
            continue;
        };

        let pos = out.iter().position(|e| e.id() == Some(id));
        if let Some(i) = pos {
            if incoming.last_updated() < out[i].last_updated() {
                continue;
            }
        }

        match (pos, incoming.is_deleted()) {
            (Some(i), true) => {
                out.remove(i);
            }
            (Some(i), false) => out[i] = incoming.clone(),
            (None, true) => {}
            (None, false) => out.push(incoming.clone()),
        }
    }

    out
}

pub fn apply_sort<T>(items: &mut [T], comparator: Option<&Comparator<T>>) {
    if let Some(cmp) = comparator {
        items.sort_by(|a, b| cmp(a, b));
    }
}

/// Mirror contents plus the sync cursor they were observed up to.
#[derive(Debug, Clone)]
pub struct MirrorState<T> {
    items: Vec<T>,
    cursor: Option<DateTime<Utc>>,
}

impl<T> Default for MirrorState<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            cursor: None,
        }
    }
}

impl<T: SyncEntity> MirrorState<T> {
    /// Initial state from a bootstrap read. An empty read anchors the cursor at `now`.
    pub fn bootstrap(
        batch: Vec<T>,
        now: DateTime<Utc>,
        comparator: Option<&Comparator<T>>,
    ) -> Self {
        let cursor = newest(&batch).unwrap_or(now);
        let mut items: Vec<T> = batch.into_iter().filter(|e| !e.is_deleted()).collect();
        apply_sort(&mut items, comparator);
        Self {
            items,
            cursor: Some(cursor),
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn cursor(&self) -> Option<DateTime<Utc>> {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Move the cursor forward to `ts`. Returns whether it moved.
    pub fn advance_to(&mut self, ts: Option<DateTime<Utc>>) -> bool {
        match (self.cursor, ts) {
            (Some(c), Some(ts)) if ts > c => {
                self.cursor = Some(ts);
                true
            }
            (None, Some(ts)) => {
                self.cursor = Some(ts);
                true
            }
            _ => false,
        }
    }

    /// Merge a change batch; records at or behind the cursor are ignored.
    /// Returns whether anything was applied.
    pub fn apply(&mut self, batch: Vec<T>, comparator: Option<&Comparator<T>>) -> bool {
        let cursor = self.cursor;
        let fresh: Vec<T> = batch
            .into_iter()
            .filter(|e| match (e.last_updated(), cursor) {
                (Some(ts), Some(c)) => ts > c,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .collect();

        let Some(batch_newest) = newest(&fresh) else {
            return false;
        };

        self.items = merge_by_id(&self.items, &fresh);
        apply_sort(&mut self.items, comparator);
        self.cursor = Some(cursor.map_or(batch_newest, |c| c.max(batch_newest)));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde::{Deserialize, Serialize};
    use tally_core::SyncMeta;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        #[serde(flatten)]
        meta: SyncMeta,
        text: String,
    }

    tally_core::sync_entity!(Note, "notes");

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, secs).unwrap()
    }

    fn note(id: &str, at: u32, text: &str) -> Note {
        Note {
            meta: SyncMeta {
                id: Some(id.to_string()),
                last_updated: Some(ts(at)),
                deleted: false,
            },
            text: text.to_string(),
        }
    }

    fn tombstone(id: &str, at: u32) -> Note {
        let mut n = note(id, at, "");
        n.meta.deleted = true;
        n
    }

    fn texts(items: &[Note]) -> Vec<&str> {
        items.iter().map(|n| n.text.as_str()).collect()
    }

    #[test]
    fn test_merge_replaces_same_id_and_appends_new() {
        let current = vec![note("a", 1, "a1"), note("b", 2, "b1")];
        let merged = merge_by_id(&current, &[note("a", 3, "a2"), note("c", 4, "c1")]);
        assert_eq!(texts(&merged), vec!["a2", "b1", "c1"]);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let current = vec![note("a", 1, "a1")];
        let batch = vec![note("a", 2, "a2"), note("b", 3, "b1"), tombstone("c", 4)];
        let once = merge_by_id(&current, &batch);
        let twice = merge_by_id(&once, &batch);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_never_regresses_newer_entry() {
        let current = vec![note("a", 5, "new")];
        let merged = merge_by_id(&current, &[note("a", 2, "old")]);
        assert_eq!(texts(&merged), vec!["new"]);
    }

    #[test]
    fn test_tombstone_removes_entry() {
        let current = vec![note("a", 1, "a1"), note("b", 1, "b1")];
        let merged = merge_by_id(&current, &[tombstone("a", 2)]);
        assert_eq!(texts(&merged), vec!["b1"]);
    }

    #[test]
    fn test_bootstrap_empty_anchors_cursor_at_now() {
        let state: MirrorState<Note> = MirrorState::bootstrap(vec![], ts(30), None);
        assert!(state.is_empty());
        assert_eq!(state.cursor(), Some(ts(30)));
    }

    #[test]
    fn test_bootstrap_cursor_is_newest_and_sorted() {
        let by_text: Comparator<Note> = Arc::new(|a: &Note, b: &Note| a.text.cmp(&b.text));
        let state = MirrorState::bootstrap(
            vec![note("z", 9, "zeta"), note("a", 3, "alpha")],
            ts(59),
            Some(&by_text),
        );
        assert_eq!(state.cursor(), Some(ts(9)));
        assert_eq!(texts(state.items()), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_cursor_only_moves_forward() {
        let mut state = MirrorState::bootstrap(vec![note("a", 1, "a1")], ts(0), None);

        let b1 = vec![note("b", 5, "b1"), note("a", 4, "a2")];
        let b2 = vec![note("b", 8, "b2"), note("c", 7, "c1")];

        assert!(state.apply(b1.clone(), None));
        assert_eq!(state.cursor(), Some(ts(5)));
        assert!(state.apply(b2, None));
        assert_eq!(state.cursor(), Some(ts(8)));

        // Replaying the older batch changes nothing.
        assert!(!state.apply(b1, None));
        assert_eq!(state.cursor(), Some(ts(8)));
        assert_eq!(texts(state.items()), vec!["a2", "b2", "c1"]);
    }

    #[test]
    fn test_advance_to_never_rewinds() {
        let mut state = MirrorState::bootstrap(vec![note("a", 5, "a1")], ts(0), None);
        assert!(!state.advance_to(Some(ts(3))));
        assert!(!state.advance_to(None));
        assert_eq!(state.cursor(), Some(ts(5)));

        assert!(state.advance_to(Some(ts(7))));
        assert_eq!(state.cursor(), Some(ts(7)));
        assert_eq!(texts(state.items()), vec!["a1"]);
    }

    #[test]
    fn test_tombstone_via_changes_never_visible() {
        let mut state = MirrorState::bootstrap(vec![note("a", 1, "a1")], ts(0), None);
        assert!(state.apply(vec![tombstone("new", 3), tombstone("a", 2)], None));
        assert!(state.is_empty());
        assert_eq!(state.cursor(), Some(ts(3)));
    }
}
