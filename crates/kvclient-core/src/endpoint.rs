//! One connection's view of the request lifecycle: correlation table,
//! opaque counter and outbound frame sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::correlation::{CorrelationStats, CorrelationTable, OpaqueGenerator};
use crate::error::{AnomalyKind, CoreError, Result};
use crate::kv::KeyValueRequest;
use crate::metrics::CoreMetrics;
use crate::protocol::{self, ResponseFrame};

/// Outbound half of a connection.
pub trait FrameSink: Send + Sync + 'static {
    /// Queues an encoded frame for writing.
    ///
    /// An error means the connection can no longer carry frames.
    fn send(&self, frame: Bytes) -> Result<()>;

    /// Releases the underlying transport. Called once the endpoint closes.
    fn close(&self) {}
}

/// A connection to one server node.
pub struct KvEndpoint {
    address: String,
    table: CorrelationTable,
    opaques: OpaqueGenerator,
    sink: Arc<dyn FrameSink>,
    metrics: Arc<CoreMetrics>,
    closed: AtomicBool,
}

impl std::fmt::Debug for KvEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvEndpoint")
            .field("address", &self.address)
            .field("table", &self.table)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl KvEndpoint {
    /// Creates an endpoint writing through `sink`.
    pub fn new(address: impl Into<String>, sink: Arc<dyn FrameSink>, metrics: Arc<CoreMetrics>) -> Self {
        metrics.connection_opened();
        Self {
            address: address.into(),
            table: CorrelationTable::new(),
            opaques: OpaqueGenerator::new(),
            sink,
            metrics,
            closed: AtomicBool::new(false),
        }
    }

    /// Remote address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Next correlation key for a request bound to this connection.
    pub fn next_opaque(&self) -> u32 {
        self.opaques.next()
    }

    /// Requests awaiting a response on this connection.
    pub fn outstanding(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` if a request with `opaque` is awaiting a response.
    pub fn is_outstanding(&self, opaque: u32) -> bool {
        self.table.contains(opaque)
    }

    /// Correlation counters of this connection.
    pub fn correlation_stats(&self) -> CorrelationStats {
        self.table.stats()
    }

    /// Returns `true` once the endpoint stopped accepting requests.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Registers `request` for correlation and writes `frame`.
    ///
    /// The caller must have armed the request's timeout already. The table
    /// entry is removed by a completion hook, whichever path completes the
    /// request. A failed write tears the connection down.
    pub fn dispatch(self: &Arc<Self>, request: Arc<dyn KeyValueRequest>, frame: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(self.reject(&request));
        }

        let opaque = request.opaque();
        let request_id = request.request_id();
        if !self.table.insert(opaque, Arc::clone(&request)) {
            self.metrics.inc_duplicate_opaques();
        }
        let endpoint = Arc::downgrade(self);
        request.add_completion_hook(Box::new(move || {
            if let Some(endpoint) = endpoint.upgrade() {
                endpoint.table.discard(opaque, request_id);
            }
        }));

        // A teardown may have drained the table before the insert landed.
        if self.is_closed() {
            self.table.discard(opaque, request_id);
            return Err(self.reject(&request));
        }

        debug!(opaque, %request_id, address = %self.address, "dispatching request");
        if let Err(e) = self.sink.send(frame) {
            let reason = e.to_string();
            self.connection_lost(&reason);
            let error = CoreError::ConnectionLost { reason };
            request.fail(error.clone());
            return Err(error);
        }
        Ok(())
    }

    fn reject(&self, request: &Arc<dyn KeyValueRequest>) -> CoreError {
        let error = CoreError::ConnectionLost {
            reason: format!("endpoint {} is closed", self.address),
        };
        request.fail(error.clone());
        error
    }

    /// Completes the request a response frame belongs to.
    ///
    /// Frames whose header cannot be read, and frames whose opaque matches
    /// no outstanding request, are dropped and counted; the returned error
    /// describes what was dropped. A frame that matches a request but
    /// cannot be decoded fails only that request.
    pub fn handle_response(&self, frame: Bytes) -> Result<()> {
        let opaque = match protocol::extract_opaque(&frame) {
            Ok(opaque) => opaque,
            Err(e) => {
                self.metrics.inc_malformed_frames();
                warn!(address = %self.address, error = %e, "dropping unreadable frame");
                return Err(e);
            }
        };

        let Some(request) = self.table.remove(opaque) else {
            self.metrics.inc_unmatched_responses();
            debug!(opaque, address = %self.address, "no outstanding request for response");
            return Err(CoreError::CorrelationAnomaly {
                opaque,
                kind: AnomalyKind::UnmatchedResponse,
            });
        };

        self.metrics.inc_responses_matched();
        match ResponseFrame::decode(frame) {
            Ok(decoded) => {
                if request.complete_with(decoded) {
                    debug!(opaque, request_id = %request.request_id(), "request completed");
                }
            }
            Err(e) => {
                self.metrics.inc_malformed_frames();
                warn!(opaque, request_id = %request.request_id(), error = %e, "malformed response");
                request.fail(e);
            }
        }
        Ok(())
    }

    /// Closes the endpoint and fails every outstanding request with `error`.
    ///
    /// Returns how many requests this call failed. Idempotent.
    pub fn close(&self, error: CoreError) -> usize {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.sink.close();
            self.metrics.connection_closed();
        }
        self.table
            .drain()
            .into_iter()
            .filter(|request| request.fail(error.clone()))
            .count()
    }

    /// Tears the connection down after a transport failure, failing every
    /// outstanding request with [`CoreError::ConnectionLost`].
    pub fn connection_lost(&self, reason: &str) -> usize {
        let failed = self.close(CoreError::ConnectionLost {
            reason: reason.to_string(),
        });
        self.metrics.add_connection_failures(failed as u64);
        warn!(address = %self.address, reason, failed, "connection lost");
        failed
    }
}
