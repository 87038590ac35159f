//! Submission path: validate, locate, arm the timeout, correlate, write.

use std::sync::Arc;

use tracing::debug;

use crate::endpoint::KvEndpoint;
use crate::error::{CoreError, Result};
use crate::kv::KeyValueRequest;
use crate::metrics::CoreMetrics;
use crate::timer::TimerWheel;

/// Resolves which connection a request goes to.
///
/// Topology is owned outside the core; implementations only answer lookups.
pub trait Locator: Send + Sync + 'static {
    /// Endpoint serving `key` in `partition`, if any.
    fn locate_key(&self, key: &[u8], partition: u16) -> Option<Arc<KvEndpoint>>;

    /// Every endpoint currently known, used at shutdown.
    fn endpoints(&self) -> Vec<Arc<KvEndpoint>>;

    /// Endpoint for `request`.
    fn locate(&self, request: &dyn KeyValueRequest) -> Option<Arc<KvEndpoint>> {
        self.locate_key(request.key(), request.partition())
    }
}

/// Locator routing everything to one endpoint, or nowhere.
#[derive(Debug, Clone, Default)]
pub struct StaticLocator {
    endpoint: Option<Arc<KvEndpoint>>,
}

impl StaticLocator {
    /// Routes every request to `endpoint`.
    pub fn new(endpoint: Arc<KvEndpoint>) -> Self {
        Self {
            endpoint: Some(endpoint),
        }
    }

    /// Locator that never finds an endpoint.
    pub fn empty() -> Self {
        Self::default()
    }
}

impl Locator for StaticLocator {
    fn locate_key(&self, _key: &[u8], _partition: u16) -> Option<Arc<KvEndpoint>> {
        self.endpoint.clone()
    }

    fn endpoints(&self) -> Vec<Arc<KvEndpoint>> {
        self.endpoint.iter().cloned().collect()
    }
}

/// Hands requests to connections.
pub struct Dispatcher {
    locator: Arc<dyn Locator>,
    wheel: Arc<TimerWheel>,
    metrics: Arc<CoreMetrics>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("wheel", &self.wheel)
            .finish()
    }
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(locator: Arc<dyn Locator>, wheel: Arc<TimerWheel>, metrics: Arc<CoreMetrics>) -> Self {
        Self {
            locator,
            wheel,
            metrics,
        }
    }

    /// Locator used by [`submit`](Self::submit).
    pub fn locator(&self) -> &Arc<dyn Locator> {
        &self.locator
    }

    /// Submits `request` to the endpoint the locator picks.
    ///
    /// Every error is also delivered to the request, so its handle never
    /// stays pending.
    pub fn submit(&self, request: Arc<dyn KeyValueRequest>) -> Result<()> {
        let frame = self.encode(&request)?;
        let Some(endpoint) = self.locator.locate(request.as_ref()) else {
            debug!(request_id = %request.request_id(), "no endpoint for request");
            return Err(self.reject(&request, CoreError::NoEndpoint));
        };
        self.send(&endpoint, request, frame)
    }

    /// Submits `request` to a known endpoint, skipping the locator.
    ///
    /// Used when the request's opaque was drawn from `endpoint`.
    pub fn submit_to(&self, endpoint: &Arc<KvEndpoint>, request: Arc<dyn KeyValueRequest>) -> Result<()> {
        let frame = self.encode(&request)?;
        self.send(endpoint, request, frame)
    }

    fn encode(&self, request: &Arc<dyn KeyValueRequest>) -> Result<bytes::Bytes> {
        request.encode().map_err(|e| self.reject(request, e))
    }

    fn send(
        &self,
        endpoint: &Arc<KvEndpoint>,
        request: Arc<dyn KeyValueRequest>,
        frame: bytes::Bytes,
    ) -> Result<()> {
        let timer = self
            .wheel
            .schedule_request_timeout(&request)
            .map_err(|e| self.reject(&request, e))?;
        let metrics = Arc::clone(&self.metrics);
        let fired = timer.clone();
        request.add_completion_hook(Box::new(move || {
            if fired.is_expired() {
                metrics.inc_timeouts_total();
            }
        }));

        match endpoint.dispatch(request, frame) {
            Ok(()) => {
                self.metrics.inc_requests_dispatched();
                Ok(())
            }
            Err(e) => {
                self.metrics.inc_dispatch_failures();
                Err(e)
            }
        }
    }

    fn reject(&self, request: &Arc<dyn KeyValueRequest>, error: CoreError) -> CoreError {
        self.metrics.inc_dispatch_failures();
        request.fail(error.clone());
        error
    }
}
