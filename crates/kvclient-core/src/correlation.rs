//! Per-connection opaque → in-flight request mapping.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::warn;

use crate::kv::KeyValueRequest;
use crate::request::RequestId;

/// Wrapping generator of correlation keys, owned by one connection.
#[derive(Debug, Default)]
pub struct OpaqueGenerator {
    last: AtomicU32,
}

impl OpaqueGenerator {
    /// Creates a generator whose first key is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next key, wrapping around at `u32::MAX`.
    pub fn next(&self) -> u32 {
        self.last.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

/// Anomaly counters of a correlation table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelationStats {
    /// Requests currently awaiting a response.
    pub outstanding: usize,
    /// Inserts rejected because the opaque was taken.
    pub duplicate_keys: u64,
    /// Removals for opaques with no entry.
    pub unmatched_responses: u64,
}

/// Concurrent map from opaque to the request awaiting its response.
///
/// Inserts happen on submitting threads and removals on the connection
/// reader; the sharded map keeps unrelated keys from contending.
#[derive(Default)]
pub struct CorrelationTable {
    entries: DashMap<u32, Arc<dyn KeyValueRequest>>,
    duplicate_keys: AtomicU64,
    unmatched_responses: AtomicU64,
}

impl std::fmt::Debug for CorrelationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("stats", &self.stats())
            .finish()
    }
}

impl CorrelationTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `request` under `opaque`.
    ///
    /// Returns `false` if the opaque already has a live entry. The existing
    /// entry is kept; the anomaly is logged and counted.
    pub fn insert(&self, opaque: u32, request: Arc<dyn KeyValueRequest>) -> bool {
        match self.entries.entry(opaque) {
            Entry::Occupied(existing) => {
                self.duplicate_keys.fetch_add(1, Ordering::Relaxed);
                warn!(
                    opaque,
                    existing = %existing.get().request_id(),
                    rejected = %request.request_id(),
                    "correlation key already in use"
                );
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(request);
                true
            }
        }
    }

    /// Removes and returns the entry for `opaque`.
    ///
    /// A missing entry is counted as an unmatched response.
    pub fn remove(&self, opaque: u32) -> Option<Arc<dyn KeyValueRequest>> {
        let removed = self.entries.remove(&opaque).map(|(_, request)| request);
        if removed.is_none() {
            self.unmatched_responses.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Removes the entry for `opaque` only if it belongs to `request_id`.
    ///
    /// Silent: used when a request completed by a path other than a response.
    pub fn discard(&self, opaque: u32, request_id: RequestId) -> bool {
        self.entries
            .remove_if(&opaque, |_, request| request.request_id() == request_id)
            .is_some()
    }

    /// Removes and returns every entry.
    pub fn drain(&self) -> Vec<Arc<dyn KeyValueRequest>> {
        let keys: Vec<u32> = self.entries.iter().map(|entry| *entry.key()).collect();
        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|(_, request)| request))
            .collect()
    }

    /// Returns `true` if `opaque` has a live entry.
    pub fn contains(&self, opaque: u32) -> bool {
        self.entries.contains_key(&opaque)
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the anomaly counters.
    pub fn stats(&self) -> CorrelationStats {
        CorrelationStats {
            outstanding: self.entries.len(),
            duplicate_keys: self.duplicate_keys.load(Ordering::Relaxed),
            unmatched_responses: self.unmatched_responses.load(Ordering::Relaxed),
        }
    }
}
