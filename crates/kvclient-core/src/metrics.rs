//! Request lifecycle metrics collection.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of core metrics at a point in time.
pub struct MetricsSnapshot {
    /// Requests handed to a connection.
    pub requests_dispatched: u64,
    /// Requests rejected before reaching the wire.
    pub dispatch_failures: u64,
    /// Responses matched to an outstanding request.
    pub responses_matched: u64,
    /// Requests failed by the timer wheel.
    pub timeouts_total: u64,
    /// Requests failed by connection teardown.
    pub connection_failures: u64,
    /// Responses whose opaque matched no outstanding request.
    pub unmatched_responses: u64,
    /// Inserts that found the opaque already taken.
    pub duplicate_opaques: u64,
    /// Frames dropped because they could not be decoded.
    pub malformed_frames: u64,
    /// Total bytes written.
    pub bytes_sent: u64,
    /// Total bytes read.
    pub bytes_received: u64,
    /// Currently open connections.
    pub active_connections: u32,
}

/// Thread-safe metrics collector shared by every endpoint of a core.
pub struct CoreMetrics {
    requests_dispatched: AtomicU64,
    dispatch_failures: AtomicU64,
    responses_matched: AtomicU64,
    timeouts_total: AtomicU64,
    connection_failures: AtomicU64,
    unmatched_responses: AtomicU64,
    duplicate_opaques: AtomicU64,
    malformed_frames: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    active_connections: AtomicU32,
}

impl Default for CoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CoreMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl CoreMetrics {
    /// Creates a collector with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            requests_dispatched: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            responses_matched: AtomicU64::new(0),
            timeouts_total: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            unmatched_responses: AtomicU64::new(0),
            duplicate_opaques: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            active_connections: AtomicU32::new(0),
        }
    }

    /// Increments the dispatched requests counter.
    pub fn inc_requests_dispatched(&self) {
        self.requests_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the dispatch failures counter.
    pub fn inc_dispatch_failures(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the matched responses counter.
    pub fn inc_responses_matched(&self) {
        self.responses_matched.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the timeouts counter.
    pub fn inc_timeouts_total(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds requests failed by a connection teardown.
    pub fn add_connection_failures(&self, count: u64) {
        self.connection_failures.fetch_add(count, Ordering::Relaxed);
    }

    /// Increments the unmatched responses counter.
    pub fn inc_unmatched_responses(&self) {
        self.unmatched_responses.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the duplicate opaque counter.
    pub fn inc_duplicate_opaques(&self) {
        self.duplicate_opaques.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the malformed frames counter.
    pub fn inc_malformed_frames(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds to the bytes sent counter.
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Adds to the bytes received counter.
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records a connection opened.
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a connection closed, saturating at zero.
    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Takes a snapshot of all current metric values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_dispatched: self.requests_dispatched.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            responses_matched: self.responses_matched.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            unmatched_responses: self.unmatched_responses.load(Ordering::Relaxed),
            duplicate_opaques: self.duplicate_opaques.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }
}
