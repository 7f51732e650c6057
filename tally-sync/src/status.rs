//! Health of one repository's sync lifecycle.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle of a repository:
/// `Uninitialized -> Bootstrapping -> EmptyListening | PopulatedListening`.
/// A failure moves to `Retrying` while retries remain and to `Stalled` once
/// they are used up; `close()` ends in `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPhase {
    Uninitialized,
    Bootstrapping,
    EmptyListening,
    PopulatedListening,
    Retrying,
    Stalled,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub cursor: Option<DateTime<Utc>>,
    /// Change batches merged since the last bootstrap
    pub batches_applied: u64,
    pub consecutive_failures: u32,
    /// Delivered documents that could not be decoded, since the last bootstrap
    pub skipped_documents: u64,
    /// Most recent store error; cleared on the next successful read
    pub last_error: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Uninitialized,
            cursor: None,
            batches_applied: 0,
            consecutive_failures: 0,
            skipped_documents: 0,
            last_error: None,
        }
    }
}

impl SyncStatus {
    pub fn is_listening(&self) -> bool {
        matches!(
            self.phase,
            SyncPhase::EmptyListening | SyncPhase::PopulatedListening
        )
    }

    pub fn is_stalled(&self) -> bool {
        self.phase == SyncPhase::Stalled
    }

    /// Bootstrap has published a mirror or given up. A repository that is
    /// still retrying is not settled.
    pub fn is_settled(&self) -> bool {
        !matches!(
            self.phase,
            SyncPhase::Uninitialized | SyncPhase::Bootstrapping | SyncPhase::Retrying
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_phase(phase: SyncPhase) -> SyncStatus {
        SyncStatus {
            phase,
            ..SyncStatus::default()
        }
    }

    #[test]
    fn test_retrying_is_not_settled() {
        assert!(!with_phase(SyncPhase::Retrying).is_settled());
        assert!(!with_phase(SyncPhase::Retrying).is_stalled());
        assert!(with_phase(SyncPhase::Stalled).is_settled());
        assert!(with_phase(SyncPhase::EmptyListening).is_settled());
        assert!(with_phase(SyncPhase::Closed).is_settled());
    }
}
