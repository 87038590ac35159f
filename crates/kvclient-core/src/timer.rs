//! Hashed timer wheel used as the single source of request timeouts.
//!
//! A dedicated driver thread advances one bucket per tick. New timers and
//! cancellations are handed to the driver through queues, so callers never
//! touch the buckets. A timer whose deadline lies more than one revolution
//! ahead carries a round counter and is skipped until it reaches zero.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::request::{lock, Completable};

const PENDING: u8 = 0;
const CANCELLED: u8 = 1;
const EXPIRED: u8 = 2;

/// Longest delay the wheel honours; longer delays are clamped to it.
pub const MAX_DELAY: Duration = Duration::from_nanos(i64::MAX as u64);

/// Timer wheel configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Tick duration in milliseconds (default: 100).
    pub tick_ms: u64,
    /// Number of buckets, rounded up to a power of two (default: 512).
    pub wheel_size: usize,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            wheel_size: 512,
        }
    }
}

type Task = Box<dyn FnOnce(&Timeout) + Send>;

struct TimerEntry {
    id: u64,
    deadline: Instant,
    state: AtomicU8,
    task: Mutex<Option<Task>>,
}

struct WheelShared {
    pending: AtomicUsize,
    next_id: AtomicU64,
    incoming: Mutex<Vec<Arc<TimerEntry>>>,
    cancelled: Mutex<Vec<u64>>,
    stopped: AtomicBool,
    stop_requested: Mutex<bool>,
    stop_signal: Condvar,
}

/// Handle to a scheduled timer.
#[derive(Clone)]
pub struct Timeout {
    entry: Arc<TimerEntry>,
    shared: Arc<WheelShared>,
}

impl Timeout {
    /// Cancels the timer.
    ///
    /// Returns `true` iff the timer was pending and will now never fire.
    pub fn cancel(&self) -> bool {
        if self
            .entry
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.shared.pending.fetch_sub(1, Ordering::AcqRel);
        // Release whatever the task captured right away.
        drop(lock(&self.entry.task).take());
        if !self.shared.stopped.load(Ordering::Acquire) {
            lock(&self.shared.cancelled).push(self.entry.id);
        }
        true
    }

    /// Runs the task now on the calling thread if the timer is still pending.
    ///
    /// Returns `true` iff this call fired the timer.
    pub fn expire_now(&self) -> bool {
        fire(&self.entry, &self.shared)
    }

    /// Returns `true` if the timer was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.entry.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Returns `true` if the timer fired.
    pub fn is_expired(&self) -> bool {
        self.entry.state.load(Ordering::Acquire) == EXPIRED
    }

    /// Absolute deadline.
    pub fn deadline(&self) -> Instant {
        self.entry.deadline
    }
}

impl PartialEq for Timeout {
    fn eq(&self, other: &Self) -> bool {
        self.entry.id == other.entry.id && Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Timeout {}

impl std::hash::Hash for Timeout {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.entry.id.hash(state);
    }
}

impl std::fmt::Debug for Timeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeout")
            .field("id", &self.entry.id)
            .field("state", &self.entry.state.load(Ordering::Acquire))
            .finish()
    }
}

/// Tick-driven scheduler with O(1) schedule and cancel.
pub struct TimerWheel {
    shared: Arc<WheelShared>,
    driver: Mutex<Option<JoinHandle<Vec<Arc<TimerEntry>>>>>,
}

impl std::fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerWheel")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl TimerWheel {
    /// Starts a wheel and its driver thread.
    pub fn new(config: TimerConfig) -> Result<Self> {
        let shared = Arc::new(WheelShared {
            pending: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            incoming: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            stop_requested: Mutex::new(false),
            stop_signal: Condvar::new(),
        });
        let driver = Driver::new(Arc::clone(&shared), config);
        let handle = std::thread::Builder::new()
            .name("kv-timer".to_string())
            .spawn(move || driver.run())?;
        debug!(tick_ms = config.tick_ms, wheel_size = config.wheel_size, "timer wheel started");
        Ok(Self {
            shared,
            driver: Mutex::new(Some(handle)),
        })
    }

    /// Schedules `task` to run once `delay` has elapsed.
    ///
    /// Delays beyond [`MAX_DELAY`] are clamped.
    pub fn schedule<F>(&self, task: F, delay: Duration) -> Result<Timeout>
    where
        F: FnOnce(&Timeout) + Send + 'static,
    {
        let now = Instant::now();
        let deadline = now
            .checked_add(delay.min(MAX_DELAY))
            .ok_or_else(|| CoreError::Io {
                reason: format!("timer delay of {:?} is out of range", delay),
            })?;
        let entry = Arc::new(TimerEntry {
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
            deadline,
            state: AtomicU8::new(PENDING),
            task: Mutex::new(Some(Box::new(task))),
        });
        {
            let mut incoming = lock(&self.shared.incoming);
            if self.shared.stopped.load(Ordering::Acquire) {
                return Err(CoreError::TimerShutdown);
            }
            self.shared.pending.fetch_add(1, Ordering::AcqRel);
            incoming.push(Arc::clone(&entry));
        }
        Ok(Timeout {
            entry,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Cancels `timeout`, see [`Timeout::cancel`].
    pub fn cancel(&self, timeout: &Timeout) -> bool {
        timeout.cancel()
    }

    /// Arms the timeout of `request`.
    ///
    /// The timer fails the request with [`CoreError::Timeout`] when it fires;
    /// a completion hook cancels the timer if the request finishes first.
    pub fn schedule_request_timeout<R>(&self, request: &Arc<R>) -> Result<Timeout>
    where
        R: Completable + ?Sized,
    {
        let target = Arc::clone(request);
        let delay = request.timeout();
        let timeout_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let timeout = self.schedule(
            move |_| {
                let request_id = target.request_id();
                if target.fail(CoreError::Timeout {
                    request_id: request_id.as_u64(),
                    timeout_ms,
                }) {
                    debug!(%request_id, timeout_ms, "request timed out");
                }
            },
            delay,
        )?;
        let handle = timeout.clone();
        request.add_completion_hook(Box::new(move || {
            handle.cancel();
        }));
        Ok(timeout)
    }

    /// Number of timers neither fired nor cancelled.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) was called.
    pub fn is_shutdown(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Stops the driver and returns every timer still pending.
    ///
    /// Pending timers are left untouched so the caller can fail their
    /// requests explicitly. Must not be called from a timer task.
    pub fn shutdown(&self) -> HashSet<Timeout> {
        {
            let _incoming = lock(&self.shared.incoming);
            self.shared.stopped.store(true, Ordering::Release);
        }
        *lock(&self.shared.stop_requested) = true;
        self.shared.stop_signal.notify_all();

        let Some(handle) = lock(&self.driver).take() else {
            return HashSet::new();
        };
        let leftovers = match handle.join() {
            Ok(leftovers) => leftovers,
            Err(_) => {
                warn!("timer driver panicked");
                Vec::new()
            }
        };
        let pending: HashSet<Timeout> = leftovers
            .into_iter()
            .filter(|entry| entry.state.load(Ordering::Acquire) == PENDING)
            .map(|entry| Timeout {
                entry,
                shared: Arc::clone(&self.shared),
            })
            .collect();
        debug!(pending = pending.len(), "timer wheel stopped");
        pending
    }
}

impl Drop for TimerWheel {
    // Nobody can claim the pending set of a dropped wheel, so its timers fire
    // here; otherwise their requests would never complete.
    fn drop(&mut self) {
        if self.is_shutdown() {
            return;
        }
        let pending = self.shutdown();
        let fired = pending.iter().filter(|timeout| timeout.expire_now()).count();
        if fired > 0 {
            debug!(fired, "expired pending timers of dropped wheel");
        }
    }
}

struct Slot {
    entry: Arc<TimerEntry>,
    rounds: u64,
}

struct Driver {
    shared: Arc<WheelShared>,
    buckets: Vec<HashMap<u64, Slot>>,
    locations: HashMap<u64, usize>,
    mask: u64,
    tick: u64,
    tick_duration: Duration,
    start: Instant,
}

impl Driver {
    fn new(shared: Arc<WheelShared>, config: TimerConfig) -> Self {
        let size = config.wheel_size.max(1).next_power_of_two();
        Self {
            shared,
            buckets: (0..size).map(|_| HashMap::new()).collect(),
            locations: HashMap::new(),
            mask: size as u64 - 1,
            tick: 0,
            tick_duration: Duration::from_millis(config.tick_ms.max(1)),
            start: Instant::now(),
        }
    }

    fn run(mut self) -> Vec<Arc<TimerEntry>> {
        loop {
            let tick_end = self.start
                + Duration::from_nanos(self.tick_duration.as_nanos() as u64 * (self.tick + 1));
            if !self.sleep_until(tick_end) {
                break;
            }
            self.process_cancelled();
            self.transfer_incoming();
            self.expire_bucket((self.tick & self.mask) as usize);
            self.tick += 1;
        }

        let mut leftovers: Vec<Arc<TimerEntry>> = lock(&self.shared.incoming).drain(..).collect();
        for bucket in self.buckets.drain(..) {
            leftovers.extend(bucket.into_values().map(|slot| slot.entry));
        }
        leftovers
    }

    /// Returns `false` once a stop was requested.
    fn sleep_until(&self, target: Instant) -> bool {
        let mut stop = lock(&self.shared.stop_requested);
        loop {
            if *stop {
                return false;
            }
            let now = Instant::now();
            if now >= target {
                return true;
            }
            stop = self
                .shared
                .stop_signal
                .wait_timeout(stop, target - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    fn process_cancelled(&mut self) {
        let cancelled: Vec<u64> = lock(&self.shared.cancelled).drain(..).collect();
        for id in cancelled {
            if let Some(idx) = self.locations.remove(&id) {
                self.buckets[idx].remove(&id);
            }
        }
    }

    fn transfer_incoming(&mut self) {
        let incoming: Vec<Arc<TimerEntry>> = lock(&self.shared.incoming).drain(..).collect();
        let tick_nanos = self.tick_duration.as_nanos().max(1);
        let wheel_size = self.mask + 1;
        for entry in incoming {
            if entry.state.load(Ordering::Acquire) != PENDING {
                continue;
            }
            let offset = entry.deadline.saturating_duration_since(self.start).as_nanos();
            let calculated = u64::try_from(offset / tick_nanos).unwrap_or(u64::MAX);
            let rounds = calculated.saturating_sub(self.tick) / wheel_size;
            let idx = (calculated.max(self.tick) & self.mask) as usize;
            self.locations.insert(entry.id, idx);
            self.buckets[idx].insert(entry.id, Slot { entry, rounds });
        }
    }

    fn expire_bucket(&mut self, idx: usize) {
        let mut due = Vec::new();
        self.buckets[idx].retain(|_, slot| {
            if slot.rounds == 0 {
                due.push(Arc::clone(&slot.entry));
                false
            } else {
                slot.rounds -= 1;
                true
            }
        });
        for entry in due {
            self.locations.remove(&entry.id);
            self.expire(entry);
        }
    }

    fn expire(&self, entry: Arc<TimerEntry>) {
        fire(&entry, &self.shared);
    }
}

fn fire(entry: &Arc<TimerEntry>, shared: &Arc<WheelShared>) -> bool {
    if entry
        .state
        .compare_exchange(PENDING, EXPIRED, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return false;
    }
    shared.pending.fetch_sub(1, Ordering::AcqRel);
    let Some(task) = lock(&entry.task).take() else {
        return true;
    };
    let timeout = Timeout {
        entry: Arc::clone(entry),
        shared: Arc::clone(shared),
    };
    if catch_unwind(AssertUnwindSafe(|| task(&timeout))).is_err() {
        warn!(timer_id = entry.id, "timer task panicked");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Request, RequestId};
    use std::sync::mpsc;

    fn fast_wheel() -> TimerWheel {
        TimerWheel::new(TimerConfig {
            tick_ms: 1,
            wheel_size: 64,
        })
        .unwrap()
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_default_config() {
        let config = TimerConfig::default();
        assert_eq!(config.tick_ms, 100);
        assert_eq!(config.wheel_size, 512);
    }

    #[test]
    fn test_schedule_fires_task() {
        let wheel = fast_wheel();
        assert_eq!(wheel.pending_count(), 0);
        let (tx, rx) = mpsc::channel();
        let timeout = wheel
            .schedule(move |_| tx.send(()).unwrap(), Duration::from_millis(1))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(timeout.is_expired());
        assert!(wait_for(|| wheel.pending_count() == 0));
    }

    #[test]
    fn test_cancel_before_fire() {
        let wheel = fast_wheel();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let timeout = wheel
            .schedule(
                move |_| fired_clone.store(true, Ordering::SeqCst),
                Duration::from_millis(50),
            )
            .unwrap();
        assert_eq!(wheel.pending_count(), 1);
        assert!(wheel.cancel(&timeout));
        assert!(!timeout.cancel());
        assert!(timeout.is_cancelled());
        assert_eq!(wheel.pending_count(), 0);
        std::thread::sleep(Duration::from_millis(100));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancel_after_fire() {
        let wheel = fast_wheel();
        let (tx, rx) = mpsc::channel();
        let timeout = wheel
            .schedule(move |_| tx.send(()).unwrap(), Duration::from_millis(1))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(!timeout.cancel());
        assert!(timeout.is_expired());
    }

    #[test]
    fn test_multi_revolution_not_early() {
        let wheel = TimerWheel::new(TimerConfig {
            tick_ms: 2,
            wheel_size: 4,
        })
        .unwrap();
        let started = Instant::now();
        let (tx, rx) = mpsc::channel();
        wheel
            .schedule(move |_| tx.send(Instant::now()).unwrap(), Duration::from_millis(40))
            .unwrap();
        let fired_at = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(fired_at.duration_since(started) >= Duration::from_millis(40));
    }

    #[test]
    fn test_panicking_task_does_not_stop_others() {
        let wheel = fast_wheel();
        let (tx, rx) = mpsc::channel();
        wheel
            .schedule(|_| panic!("boom"), Duration::from_millis(5))
            .unwrap();
        wheel
            .schedule(move |_| tx.send(()).unwrap(), Duration::from_millis(5))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(wait_for(|| wheel.pending_count() == 0));
    }

    #[test]
    fn test_shutdown_returns_pending() {
        let wheel = fast_wheel();
        for _ in 0..10 {
            wheel.schedule(|_| {}, Duration::from_secs(1)).unwrap();
        }
        assert_eq!(wheel.pending_count(), 10);
        let pending = wheel.shutdown();
        assert_eq!(pending.len(), 10);
        assert!(pending.iter().all(|t| !t.is_expired() && !t.is_cancelled()));
    }

    #[test]
    fn test_shutdown_without_pending() {
        let wheel = fast_wheel();
        let (tx, rx) = mpsc::channel();
        for _ in 0..10 {
            let tx = tx.clone();
            wheel
                .schedule(move |_| tx.send(()).unwrap(), Duration::from_millis(1))
                .unwrap();
        }
        for _ in 0..10 {
            rx.recv_timeout(Duration::from_secs(1)).unwrap();
        }
        assert!(wait_for(|| wheel.pending_count() == 0));
        assert!(wheel.shutdown().is_empty());
    }

    #[test]
    fn test_expire_now_after_shutdown() {
        let wheel = fast_wheel();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        wheel
            .schedule(
                move |_| fired_clone.store(true, Ordering::SeqCst),
                Duration::from_secs(5),
            )
            .unwrap();
        let pending = wheel.shutdown();
        assert_eq!(pending.len(), 1);
        for timeout in &pending {
            assert!(timeout.expire_now());
            assert!(!timeout.expire_now());
            assert!(!timeout.cancel());
        }
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(wheel.pending_count(), 0);
    }

    #[test]
    fn test_schedule_after_shutdown_fails() {
        let wheel = fast_wheel();
        wheel.shutdown();
        assert!(wheel.is_shutdown());
        assert!(matches!(
            wheel.schedule(|_| {}, Duration::from_millis(1)),
            Err(CoreError::TimerShutdown)
        ));
        assert!(wheel.shutdown().is_empty());
    }

    #[test]
    fn test_request_timeout_fails_request() {
        let wheel = fast_wheel();
        let request: Arc<Request<u32>> =
            Arc::new(Request::new(RequestId::new(1), 1, Duration::from_millis(5)));
        wheel.schedule_request_timeout(&request).unwrap();
        let outcome = request.response().wait_timeout(Duration::from_secs(1));
        assert!(matches!(outcome, Some(Err(CoreError::Timeout { .. }))));
        assert!(request.is_failure());
        assert!(!request.is_success());
    }

    #[test]
    fn test_request_completion_cancels_timer() {
        let wheel = fast_wheel();
        let request: Arc<Request<u32>> =
            Arc::new(Request::new(RequestId::new(2), 2, Duration::from_secs(5)));
        let timeout = wheel.schedule_request_timeout(&request).unwrap();
        assert_eq!(wheel.pending_count(), 1);
        assert!(request.succeed(7));
        assert!(timeout.is_cancelled());
        assert_eq!(wheel.pending_count(), 0);
    }

    #[test]
    fn test_unbounded_delay_is_clamped() {
        let wheel = fast_wheel();
        let request: Arc<Request<u32>> =
            Arc::new(Request::new(RequestId::new(3), 3, Duration::MAX));
        let timeout = wheel.schedule_request_timeout(&request).unwrap();
        assert_eq!(wheel.pending_count(), 1);
        assert!(timeout.deadline() > Instant::now() + Duration::from_secs(100 * 365 * 86_400));

        std::thread::sleep(Duration::from_millis(20));
        assert!(!request.is_terminal());
        assert!(timeout.expire_now());
        assert_eq!(
            request.response().try_get(),
            Some(Err(CoreError::Timeout {
                request_id: 3,
                timeout_ms: u64::MAX,
            }))
        );
    }

    #[test]
    fn test_drop_fires_pending_timers() {
        let wheel = fast_wheel();
        let requests: Vec<Arc<Request<u32>>> = (0..3)
            .map(|i| Arc::new(Request::new(RequestId::new(i), i as u32, Duration::from_secs(30))))
            .collect();
        for request in &requests {
            wheel.schedule_request_timeout(request).unwrap();
        }
        drop(wheel);
        for request in &requests {
            assert!(matches!(
                request.response().try_get(),
                Some(Err(CoreError::Timeout { .. }))
            ));
        }
    }

    #[test]
    fn test_drop_after_shutdown_leaves_timers_alone() {
        let wheel = fast_wheel();
        let request: Arc<Request<u32>> =
            Arc::new(Request::new(RequestId::new(4), 4, Duration::from_secs(30)));
        wheel.schedule_request_timeout(&request).unwrap();
        let pending = wheel.shutdown();
        drop(wheel);
        assert!(!request.is_terminal());
        assert_eq!(pending.len(), 1);
    }
}
