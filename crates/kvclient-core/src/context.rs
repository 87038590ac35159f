//! State shared by everything built on one core.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::CoreConfig;
use crate::metrics::CoreMetrics;
use crate::request::RequestId;

/// Configuration, metrics and the request id counter of one core.
#[derive(Debug)]
pub struct CoreContext {
    config: CoreConfig,
    metrics: Arc<CoreMetrics>,
    last_request_id: AtomicU64,
}

impl CoreContext {
    /// Creates a context with fresh metrics.
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(CoreMetrics::new()),
            last_request_id: AtomicU64::new(0),
        }
    }

    /// Returns the next request id, starting at 1.
    pub fn next_request_id(&self) -> RequestId {
        RequestId::new(self.last_request_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Configuration.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Metrics collector.
    pub fn metrics(&self) -> &Arc<CoreMetrics> {
        &self.metrics
    }
}

impl Default for CoreContext {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}
