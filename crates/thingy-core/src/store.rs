//! In-process shadow state.
//!
//! [`ShadowStateStore`] holds the two temperature views the reconciliation
//! loop compares:
//!
//! - `observed`: the latest value delivered by the sensor link. Written only
//!   by the notification path.
//! - `reported`: the latest value the shadow service accepted. Written only
//!   by the acknowledgement path, and only for `accepted` responses.
//!
//! The two fields never change together, so each has its own guard.

use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Value both fields hold before any reading or acceptance.
pub const NO_READING: i32 = 0;

/// The last accepted reported value and the shadow version it came with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ReportedState {
    /// Accepted temperature.
    pub value: i32,
    /// Shadow document version of the acceptance, if the service sent one.
    pub version: Option<u64>,
}

/// Result of committing an acceptance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// `reported` now holds the accepted value.
    Applied {
        /// Value held before the commit.
        previous: i32,
    },
    /// The acceptance carried an older version than the one already applied.
    Stale {
        /// Version already applied.
        current_version: u64,
    },
}

/// Point-in-time copy of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreSnapshot {
    /// Latest sensor value.
    pub observed: i32,
    /// Latest accepted value.
    pub reported: ReportedState,
}

impl StoreSnapshot {
    /// Whether the sensor value differs from the accepted value.
    pub fn is_diverged(&self) -> bool {
        self.observed != self.reported.value
    }
}

/// Shared holder of the observed and reported temperatures.
///
/// Share it between the notification handler and the acknowledgement
/// handler with `Arc<ShadowStateStore>`.
#[derive(Debug, Default)]
pub struct ShadowStateStore {
    observed: AtomicI32,
    reported: Mutex<ReportedState>,
}

impl ShadowStateStore {
    /// Create a store holding the "no reading yet" sentinel in both fields.
    pub fn new() -> Self {
        Self::with_values(NO_READING, NO_READING)
    }

    /// Create a store with explicit starting values.
    pub fn with_values(observed: i32, reported: i32) -> Self {
        Self {
            observed: AtomicI32::new(observed),
            reported: Mutex::new(ReportedState {
                value: reported,
                version: None,
            }),
        }
    }

    /// Latest sensor value.
    pub fn observed(&self) -> i32 {
        self.observed.load(Ordering::SeqCst)
    }

    /// Overwrite the sensor value.
    pub fn set_observed(&self, value: i32) {
        self.observed.store(value, Ordering::SeqCst);
    }

    /// Latest accepted value.
    pub fn reported(&self) -> i32 {
        self.reported.lock().value
    }

    /// Latest accepted value together with its shadow version.
    pub fn reported_state(&self) -> ReportedState {
        *self.reported.lock()
    }

    /// Commit a value the shadow service accepted.
    ///
    /// An acceptance whose version is lower than the version already applied
    /// is ignored, so a late acknowledgement cannot roll `reported` back.
    /// Acceptances without a version are always applied.
    pub fn commit_reported(&self, value: i32, version: Option<u64>) -> CommitOutcome {
        let mut reported = self.reported.lock();

        if let (Some(incoming), Some(current)) = (version, reported.version)
            && incoming < current
        {
            return CommitOutcome::Stale {
                current_version: current,
            };
        }

        let previous = reported.value;
        reported.value = value;
        if version.is_some() {
            reported.version = version;
        }
        CommitOutcome::Applied { previous }
    }

    /// Copy both fields.
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            observed: self.observed(),
            reported: self.reported_state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_store_holds_sentinel() {
        let store = ShadowStateStore::new();
        assert_eq!(store.observed(), NO_READING);
        assert_eq!(store.reported(), NO_READING);
        assert!(!store.snapshot().is_diverged());
    }

    #[test]
    fn test_observed_overwrites() {
        let store = ShadowStateStore::new();
        store.set_observed(21);
        store.set_observed(23);
        assert_eq!(store.observed(), 23);
        assert_eq!(store.reported(), NO_READING);
        assert!(store.snapshot().is_diverged());
    }

    #[test]
    fn test_commit_applies() {
        let store = ShadowStateStore::with_values(22, 20);
        let outcome = store.commit_reported(22, Some(4));
        assert_eq!(outcome, CommitOutcome::Applied { previous: 20 });
        assert_eq!(
            store.reported_state(),
            ReportedState {
                value: 22,
                version: Some(4)
            }
        );
    }

    #[test]
    fn test_commit_ignores_older_version() {
        let store = ShadowStateStore::new();
        store.commit_reported(23, Some(10));
        let outcome = store.commit_reported(22, Some(9));
        assert_eq!(outcome, CommitOutcome::Stale { current_version: 10 });
        assert_eq!(store.reported(), 23);
    }

    #[test]
    fn test_commit_without_version_keeps_last_version() {
        let store = ShadowStateStore::new();
        store.commit_reported(23, Some(10));
        store.commit_reported(24, None);
        assert_eq!(
            store.reported_state(),
            ReportedState {
                value: 24,
                version: Some(10)
            }
        );
    }

    #[test]
    fn test_concurrent_writers_touch_separate_fields() {
        use std::sync::Arc;

        let store = Arc::new(ShadowStateStore::new());
        let notifier = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for v in 0..1000 {
                    store.set_observed(v);
                }
            })
        };
        let acker = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for v in 0..1000u64 {
                    store.commit_reported(v as i32, Some(v));
                }
            })
        };
        notifier.join().unwrap();
        acker.join().unwrap();

        assert_eq!(store.observed(), 999);
        assert_eq!(store.reported(), 999);
    }
}
