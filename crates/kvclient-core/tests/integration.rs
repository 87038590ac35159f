//! End-to-end request lifecycle scenarios.
//!
//! These tests drive the public API only: dispatcher and timer wheel over an
//! in-memory endpoint, and the full `Core` against a mock TCP node.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{fast_config, get_response, memory_endpoint, spawn_mock_server};
use kvclient_core::{
    AnomalyKind, Core, CoreError, CoreMetrics, Dispatcher, GetRequest, KeyValueRequest, Request,
    RequestId, ResponseStatus, StaticLocator, TimerWheel,
};

struct Harness {
    dispatcher: Dispatcher,
    endpoint: Arc<kvclient_core::KvEndpoint>,
    sink: Arc<common::MemorySink>,
    wheel: Arc<TimerWheel>,
    metrics: Arc<CoreMetrics>,
}

fn harness() -> Harness {
    let metrics = Arc::new(CoreMetrics::new());
    let (endpoint, sink) = memory_endpoint(Arc::clone(&metrics));
    let wheel = Arc::new(TimerWheel::new(fast_config().timer).unwrap());
    let dispatcher = Dispatcher::new(
        Arc::new(StaticLocator::new(Arc::clone(&endpoint))),
        Arc::clone(&wheel),
        Arc::clone(&metrics),
    );
    Harness {
        dispatcher,
        endpoint,
        sink,
        wheel,
        metrics,
    }
}

#[test]
fn test_response_before_deadline() {
    let h = harness();
    let request = GetRequest::new(RequestId::new(1), 42, "airline_10", Duration::from_millis(50)).unwrap();
    h.dispatcher.submit(Arc::new(request.clone())).unwrap();
    assert_eq!(h.wheel.pending_count(), 1);

    std::thread::sleep(Duration::from_millis(10));
    h.endpoint.handle_response(get_response(42, 0, b"{}")).unwrap();

    let response = request.response().wait().unwrap();
    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(h.wheel.pending_count(), 0);
    assert!(!h.endpoint.is_outstanding(42));
}

#[test]
fn test_no_response_times_out() {
    let h = harness();
    let request = GetRequest::new(RequestId::new(9), 7, "airline_10", Duration::from_millis(10)).unwrap();
    h.dispatcher.submit(Arc::new(request.clone())).unwrap();

    let outcome = request.response().wait();
    assert_eq!(
        outcome,
        Err(CoreError::Timeout {
            request_id: 9,
            timeout_ms: 10
        })
    );
    assert!(!h.endpoint.is_outstanding(7));
    assert_eq!(h.wheel.pending_count(), 0);
    assert_eq!(h.metrics.snapshot().timeouts_total, 1);
}

#[test]
fn test_shutdown_returns_pending_request_timers() {
    let wheel = TimerWheel::new(fast_config().timer).unwrap();
    let requests: Vec<Arc<Request<u32>>> = (0..10)
        .map(|i| Arc::new(Request::new(RequestId::new(i), i as u32, Duration::from_secs(60))))
        .collect();
    for request in &requests {
        wheel.schedule_request_timeout(request).unwrap();
    }

    let pending = wheel.shutdown();
    assert_eq!(pending.len(), 10);
    assert!(pending.iter().all(|t| !t.is_expired() && !t.is_cancelled()));
    assert!(requests.iter().all(|r| !r.is_terminal()));
}

#[test]
fn test_unmatched_response_is_counted_once() {
    let h = harness();
    let request = GetRequest::new(RequestId::new(1), 1, "doc", Duration::from_secs(5)).unwrap();
    h.dispatcher.submit(Arc::new(request.clone())).unwrap();

    let result = h.endpoint.handle_response(get_response(31337, 0, b""));
    assert_eq!(
        result,
        Err(CoreError::CorrelationAnomaly {
            opaque: 31337,
            kind: AnomalyKind::UnmatchedResponse
        })
    );
    assert_eq!(h.metrics.snapshot().unmatched_responses, 1);
    assert!(!request.request().is_terminal());
    assert!(h.endpoint.is_outstanding(1));
}

#[test]
fn test_out_of_order_responses() {
    let h = harness();
    let requests: Vec<GetRequest> = (1..=20u32)
        .map(|opaque| {
            GetRequest::new(RequestId::new(opaque as u64), opaque, format!("k{}", opaque), Duration::from_secs(5))
                .unwrap()
        })
        .collect();
    for request in &requests {
        h.dispatcher.submit(Arc::new(request.clone())).unwrap();
    }
    assert_eq!(h.sink.frames().len(), 20);

    for opaque in (1..=20u32).rev() {
        let value = format!("v{}", opaque);
        h.endpoint
            .handle_response(get_response(opaque, 0, value.as_bytes()))
            .unwrap();
    }
    for request in &requests {
        let response = request.response().wait().unwrap();
        assert_eq!(&response.content[..], format!("v{}", request.opaque()).as_bytes());
    }
    assert_eq!(h.endpoint.outstanding(), 0);
    assert_eq!(h.wheel.pending_count(), 0);
}

#[test]
fn test_response_racing_timeout_completes_once() {
    let h = harness();
    let completions = Arc::new(AtomicUsize::new(0));
    let requests: Vec<GetRequest> = (1..=200u32)
        .map(|opaque| {
            let request =
                GetRequest::new(RequestId::new(opaque as u64), opaque, "race", Duration::from_millis(2)).unwrap();
            let counter = Arc::clone(&completions);
            request.response().on_complete(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            request
        })
        .collect();
    for request in &requests {
        h.dispatcher.submit(Arc::new(request.clone())).unwrap();
    }
    for opaque in 1..=200u32 {
        // Late responses are unmatched; that is expected here.
        let _ = h.endpoint.handle_response(get_response(opaque, 0, b""));
    }

    for request in &requests {
        request.response().wait().ok();
    }
    assert_eq!(completions.load(Ordering::SeqCst), 200);
    assert_eq!(h.endpoint.outstanding(), 0);
    assert_eq!(h.wheel.pending_count(), 0);

    let snapshot = h.metrics.snapshot();
    let matched_or_timed_out = snapshot.responses_matched + snapshot.unmatched_responses;
    assert_eq!(matched_or_timed_out, 200);
}

#[test]
fn test_connection_reset_fails_every_outstanding_request() {
    let h = harness();
    let requests: Vec<GetRequest> = (1..=3u32)
        .map(|opaque| GetRequest::new(RequestId::new(opaque as u64), opaque, "doc", Duration::from_secs(5)).unwrap())
        .collect();
    for request in &requests {
        h.dispatcher.submit(Arc::new(request.clone())).unwrap();
    }

    h.sink.broken.store(true, Ordering::SeqCst);
    let last = GetRequest::new(RequestId::new(4), 4, "doc", Duration::from_secs(5)).unwrap();
    assert!(h.dispatcher.submit(Arc::new(last.clone())).is_err());

    for request in requests.iter().chain(std::iter::once(&last)) {
        assert!(matches!(
            request.response().wait(),
            Err(CoreError::ConnectionLost { .. })
        ));
    }
    assert_eq!(h.endpoint.outstanding(), 0);
    assert_eq!(h.wheel.pending_count(), 0);
    assert_eq!(h.metrics.snapshot().connection_failures, 4);
}

#[tokio::test]
async fn test_core_over_tcp() {
    let addr = spawn_mock_server().await;
    let core = Core::connect(fast_config(), &addr).await.unwrap();

    let found = core.get("airline_10", 0, Duration::from_secs(2)).unwrap();
    let missing = core.get("missing_1", 0, Duration::from_secs(2)).unwrap();
    let slow = core.get("slow_1", 0, Duration::from_millis(20)).unwrap();

    let found = found.recv().await.unwrap();
    assert_eq!(found.status, ResponseStatus::Success);
    assert_eq!(&found.content[..], b"value-of-airline_10");

    let missing = missing.recv().await.unwrap();
    assert_eq!(missing.status, ResponseStatus::KeyNotFound);

    assert!(matches!(slow.recv().await, Err(CoreError::Timeout { .. })));

    let snapshot = core.metrics();
    assert_eq!(snapshot.requests_dispatched, 3);
    assert_eq!(snapshot.responses_matched, 2);
    assert_eq!(snapshot.active_connections, 1);

    assert_eq!(core.shutdown(), 0);
    assert_eq!(core.metrics().active_connections, 0);
}

#[tokio::test]
async fn test_core_shutdown_fails_in_flight_requests() {
    let addr = spawn_mock_server().await;
    let core = Core::connect(fast_config(), &addr).await.unwrap();

    let handles: Vec<_> = (0..10)
        .map(|i| core.get(format!("slow_{}", i), 0, Duration::from_secs(30)).unwrap())
        .collect();
    assert_eq!(core.wheel().pending_count(), 10);

    assert_eq!(core.shutdown(), 10);
    for handle in handles {
        assert_eq!(handle.recv().await, Err(CoreError::Cancelled));
    }
    assert_eq!(core.wheel().pending_count(), 0);
}

#[tokio::test]
async fn test_dropping_core_completes_in_flight_requests() {
    let addr = spawn_mock_server().await;
    let core = Core::connect(fast_config(), &addr).await.unwrap();
    let handle = core.get("slow_1", 0, Duration::from_millis(300)).unwrap();

    drop(core);
    let outcome = tokio::time::timeout(Duration::from_secs(2), handle.recv())
        .await
        .expect("request left pending after the core was dropped");
    assert_eq!(outcome, Err(CoreError::Cancelled));
}

#[tokio::test]
async fn test_unbounded_timeout_is_accepted() {
    let addr = spawn_mock_server().await;
    let core = Core::connect(fast_config(), &addr).await.unwrap();

    let found = core.get("airline_10", 0, Duration::MAX).unwrap();
    let slow = core.get("slow_1", 0, Duration::MAX).unwrap();
    assert_eq!(found.recv().await.unwrap().status, ResponseStatus::Success);
    assert_eq!(core.wheel().pending_count(), 1);

    assert_eq!(core.shutdown(), 1);
    assert_eq!(slow.recv().await, Err(CoreError::Cancelled));
}
