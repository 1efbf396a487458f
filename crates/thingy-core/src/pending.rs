//! Table of outstanding shadow updates keyed by correlation token.
//!
//! A channel may deliver the acknowledgement for a token before
//! [`ShadowChannel::update`](crate::ShadowChannel::update) has returned that
//! token to the caller. Such early settlements are remembered so the late
//! insert can be refused instead of leaving a request that will never
//! resolve.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// An update request that has been sent and not yet resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingUpdate {
    /// Temperature the request asserts.
    pub value: i32,
    /// When the request was sent.
    pub issued_at: Instant,
    /// Timeout budget handed to the channel.
    pub timeout: Duration,
}

impl PendingUpdate {
    /// Create a pending update issued now.
    pub fn new(value: i32, timeout: Duration) -> Self {
        Self {
            value,
            issued_at: Instant::now(),
            timeout,
        }
    }

    /// Whether the request has outlived its timeout plus `grace`.
    pub fn is_expired(&self, now: Instant, grace: Duration) -> bool {
        now.duration_since(self.issued_at) > self.timeout + grace
    }
}

#[derive(Debug, Default)]
struct Inner {
    outstanding: HashMap<String, PendingUpdate>,
    settled_early: HashSet<String>,
}

/// Thread-safe token-to-request table.
#[derive(Debug, Default)]
pub struct PendingUpdates {
    inner: Mutex<Inner>,
}

impl PendingUpdates {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly issued request.
    ///
    /// Returns `false` if the token was already settled by an early
    /// acknowledgement, in which case nothing is recorded.
    pub fn insert(&self, token: impl Into<String>, update: PendingUpdate) -> bool {
        let token = token.into();
        let mut inner = self.inner.lock();
        if inner.settled_early.remove(&token) {
            return false;
        }
        inner.outstanding.insert(token, update);
        true
    }

    /// Resolve a token, returning the request it identified.
    ///
    /// A token that is not (yet) known is remembered as settled so a
    /// subsequent [`insert`](Self::insert) for it is refused.
    pub fn settle(&self, token: &str) -> Option<PendingUpdate> {
        let mut inner = self.inner.lock();
        match inner.outstanding.remove(token) {
            Some(update) => Some(update),
            None => {
                if !token.is_empty() {
                    inner.settled_early.insert(token.to_string());
                }
                None
            }
        }
    }

    /// Look up a token without resolving it.
    pub fn get(&self, token: &str) -> Option<PendingUpdate> {
        self.inner.lock().outstanding.get(token).copied()
    }

    /// Whether any outstanding request already asserts `value`.
    pub fn contains_value(&self, value: i32) -> bool {
        self.inner
            .lock()
            .outstanding
            .values()
            .any(|update| update.value == value)
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.inner.lock().outstanding.len()
    }

    /// Whether no request is outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop requests the channel never resolved.
    ///
    /// Returns the tokens that were removed.
    pub fn sweep_expired(&self, grace: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .outstanding
            .iter()
            .filter(|(_, update)| update.is_expired(now, grace))
            .map(|(token, _)| token.clone())
            .collect();
        for token in &expired {
            inner.outstanding.remove(token);
        }
        // Early settlements for tokens that never got inserted are not
        // worth keeping past a sweep.
        inner.settled_early.clear();
        expired
    }
}
