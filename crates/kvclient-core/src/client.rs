//! `Core`: the entry point owning the timer wheel, the dispatcher and the
//! shared context.
//!
//! One core serves any number of endpoints. All of them share the core's
//! timer wheel and metrics; each keeps its own correlation table.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use crate::config::CoreConfig;
use crate::context::CoreContext;
use crate::dispatcher::{Dispatcher, Locator, StaticLocator};
use crate::error::{CoreError, Result};
use crate::kv::{GetRequest, GetResponse};
use crate::metrics::MetricsSnapshot;
use crate::protocol;
use crate::request::ResponseHandle;
use crate::tcp;
use crate::timer::TimerWheel;

/// Request lifecycle core.
#[derive(Debug)]
pub struct Core {
    context: Arc<CoreContext>,
    wheel: Arc<TimerWheel>,
    dispatcher: Dispatcher,
}

impl Core {
    /// Creates a core routing requests through `locator`.
    pub fn new(config: CoreConfig, locator: Arc<dyn Locator>) -> Result<Self> {
        Self::with_context(Arc::new(CoreContext::new(config)), locator)
    }

    /// Creates a core on an existing context.
    pub fn with_context(context: Arc<CoreContext>, locator: Arc<dyn Locator>) -> Result<Self> {
        let wheel = Arc::new(TimerWheel::new(context.config().timer)?);
        let dispatcher = Dispatcher::new(locator, Arc::clone(&wheel), Arc::clone(context.metrics()));
        Ok(Self {
            context,
            wheel,
            dispatcher,
        })
    }

    /// Connects to a single node and routes every request to it.
    pub async fn connect(config: CoreConfig, addr: &str) -> Result<Self> {
        let context = Arc::new(CoreContext::new(config));
        let endpoint = tcp::connect(addr, context.config(), Arc::clone(context.metrics())).await?;
        info!(addr, "connected");
        Self::with_context(context, Arc::new(StaticLocator::new(endpoint)))
    }

    /// Fetches `key` from `partition`.
    ///
    /// Returns a handle resolving to the response, or the error that kept the
    /// request off the wire.
    pub fn get(&self, key: impl Into<Bytes>, partition: u16, timeout: Duration) -> Result<ResponseHandle<GetResponse>> {
        let key = key.into();
        if let Err(e) = protocol::verify_key(&key) {
            self.context.metrics().inc_dispatch_failures();
            return Err(e);
        }
        let Some(endpoint) = self.dispatcher.locator().locate_key(&key, partition) else {
            self.context.metrics().inc_dispatch_failures();
            return Err(CoreError::NoEndpoint);
        };
        let request = GetRequest::new(self.context.next_request_id(), endpoint.next_opaque(), key, timeout)?
            .with_partition(partition);
        let response = request.response();
        self.dispatcher.submit_to(&endpoint, Arc::new(request))?;
        Ok(response)
    }

    /// Like [`get`](Self::get) with the configured default timeout.
    pub fn get_with_default_timeout(&self, key: impl Into<Bytes>, partition: u16) -> Result<ResponseHandle<GetResponse>> {
        self.get(key, partition, self.context.config().kv_timeout())
    }

    /// Dispatcher for custom requests.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Shared context.
    pub fn context(&self) -> &Arc<CoreContext> {
        &self.context
    }

    /// Timer wheel shared by every endpoint.
    pub fn wheel(&self) -> &TimerWheel {
        &self.wheel
    }

    /// Current metrics.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.context.metrics().snapshot()
    }

    /// Stops the timer wheel and fails every outstanding request.
    ///
    /// Requests held by an endpoint fail with [`CoreError::Cancelled`]; any
    /// other request with an armed timer has it fired immediately. Returns
    /// the number of requests failed.
    pub fn shutdown(&self) -> usize {
        let pending = self.wheel.shutdown();
        let mut failed = 0;
        for endpoint in self.dispatcher.locator().endpoints() {
            failed += endpoint.close(CoreError::Cancelled);
        }
        for timeout in &pending {
            if timeout.expire_now() {
                failed += 1;
            }
        }
        debug!(failed, timers = pending.len(), "core shut down");
        failed
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        if !self.wheel.is_shutdown() {
            self.shutdown();
        }
    }
}
