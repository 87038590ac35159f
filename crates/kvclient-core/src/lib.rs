#![warn(missing_docs)]

//! Key-value client core: request lifecycle, timeout wheel, opaque
//! correlation and the binary header codec that ties wire frames to
//! in-flight requests.

pub mod client;
pub mod config;
pub mod context;
pub mod correlation;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod kv;
pub mod metrics;
pub mod protocol;
pub mod request;
pub mod tcp;
pub mod timer;

pub use client::Core;
pub use config::CoreConfig;
pub use context::CoreContext;
pub use correlation::{CorrelationStats, CorrelationTable, OpaqueGenerator};
pub use dispatcher::{Dispatcher, Locator, StaticLocator};
pub use endpoint::{FrameSink, KvEndpoint};
pub use error::{AnomalyKind, CoreError, Result};
pub use kv::{GetRequest, GetResponse, KeyValueRequest};
pub use metrics::{CoreMetrics, MetricsSnapshot};
pub use protocol::{Opcode, ResponseFrame, ResponseHeader, ResponseStatus};
pub use request::{Completable, Request, RequestId, RequestState, ResponseHandle};
pub use timer::{Timeout, TimerConfig, TimerWheel};
