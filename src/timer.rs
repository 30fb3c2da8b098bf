//! The public facade: construction, lifecycle, and submission.

use crate::clock::{duration_to_ms_ceil, Now, SystemClock, TICKS_PER_MS};
use crate::error::{Error, ErrorKind};
use crate::queue::MpscQueue;
use crate::record::{Task, Timeout};
use crate::wheel::{self, MAX_TICKS_PER_WHEEL};
use crate::worker::Worker;

use crossbeam_channel::{Receiver, Sender};
use log::{error, warn};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

const INIT: u8 = 0;
const STARTED: u8 = 1;
const SHUTDOWN: u8 = 2;

/// Default tick duration: 100 milliseconds.
const DEFAULT_TICK_DURATION: Duration = Duration::from_millis(100);
/// Default wheel size: 512 slots.
const DEFAULT_TICKS_PER_WHEEL: u64 = 512;

/// Timers created process-wide. Purely advisory; used only to warn when an
/// application seems to be creating far more timer instances than it
/// probably intends to (each instance owns a dedicated thread).
static INSTANCE_COUNT: AtomicUsize = AtomicUsize::new(0);
/// Ensures the "too many timer instances" warning is only logged once.
static WARNED: AtomicBool = AtomicBool::new(false);
/// Above this many live instances, a one-shot warning is logged.
const INSTANCE_WARNING_THRESHOLD: usize = 64;

/// State shared with every [`Timeout`] handle this timer has issued, via a
/// [`Weak`] back-reference. Kept separate from [`Timer`] itself so a record
/// can reach the cancellation queue and the pending-count counter without
/// keeping the timer (and its worker-lifecycle bookkeeping) alive.
///
/// [`Timeout`]: ../record/struct.Timeout.html
/// [`Weak`]: https://doc.rust-lang.org/std/sync/struct.Weak.html
/// [`Timer`]: struct.Timer.html
pub(crate) struct Shared {
    max_pending: i64,
    pending_count: AtomicI64,
    pub(crate) cancel_tx: Sender<Arc<Timeout>>,
}

impl Shared {
    /// Releases one unit of the pending-count budget. A no-op if the limit
    /// is disabled (`max_pending <= 0`).
    pub(crate) fn release_pending(&self) {
        if self.max_pending > 0 {
            self.pending_count.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Channels and the dedicated thread handle, consumed and replaced across
/// the timer's lifecycle: one shot from `NotStarted` to `Running` to
/// `Stopped`.
enum Lifecycle {
    NotStarted {
        pending_queue: MpscQueue<Arc<Timeout>>,
        cancel_queue: MpscQueue<Arc<Timeout>>,
        shutdown_rx: Receiver<()>,
    },
    Running {
        join: thread::JoinHandle<()>,
        result_rx: Receiver<Vec<Arc<Timeout>>>,
    },
    Stopped,
}

/// A hashed timing wheel: schedules `(task, delay)` pairs with amortised
/// O(1) insertion and cancellation, at the cost of millisecond-granular,
/// approximate firing.
///
/// Producers call [`schedule`] from any thread to obtain a [`Timeout`]
/// handle, which can be cancelled from any thread. A single dedicated
/// worker thread owns the wheel itself; see the crate documentation for the
/// full design.
///
/// [`schedule`]: #method.schedule
/// [`Timeout`]: struct.Timeout.html
pub struct Timer {
    shared: Arc<Shared>,
    clock: Arc<dyn Now>,
    tick_duration: u64,
    ticks_per_wheel: u64,
    start_ticks: Arc<AtomicU64>,
    state: AtomicU8,
    pending_tx: Sender<Arc<Timeout>>,
    shutdown_tx: Sender<()>,
    worker_thread_id: Mutex<Option<ThreadId>>,
    lifecycle: Mutex<Lifecycle>,
    counted: AtomicBool,
}

impl Timer {
    /// Constructs a timer with the library's defaults: a 100ms tick, a
    /// 512-slot wheel, and no pending-timeout limit.
    ///
    /// # Panics
    /// Never; the defaults always satisfy the constructor's invariants.
    pub fn default_timer() -> Self {
        Self::new(DEFAULT_TICK_DURATION, DEFAULT_TICKS_PER_WHEEL, 0)
            .expect("default timer parameters are always valid")
    }

    /// Constructs a timer.
    ///
    /// `tick_duration` must be positive and, rounded up to the nearest
    /// millisecond, no larger than [`i32::MAX`]. `ticks_per_wheel` is
    /// rounded up to the next power of two and must lie in `1..=2^30`.
    /// `max_pending_timeouts <= 0` disables the pending-count limit.
    ///
    /// [`i32::MAX`]: https://doc.rust-lang.org/std/primitive.i32.html
    pub fn new(
        tick_duration: Duration,
        ticks_per_wheel: u64,
        max_pending_timeouts: i64,
    ) -> Result<Self, Error<()>> {
        Self::with_clock(
            tick_duration,
            ticks_per_wheel,
            max_pending_timeouts,
            Arc::new(SystemClock::new()),
        )
    }

    /// Starts building a timer with a fluent, `CtxConfig`-style API.
    pub fn builder() -> TimerBuilder {
        TimerBuilder::new()
    }

    pub(crate) fn with_clock(
        tick_duration: Duration,
        ticks_per_wheel: u64,
        max_pending_timeouts: i64,
        clock: Arc<dyn Now>,
    ) -> Result<Self, Error<()>> {
        let tick_ms = duration_to_ms_ceil(tick_duration);
        if tick_ms == 0 {
            return Err(Error::new(ErrorKind::InvalidInput {
                msg: "tick_duration must be positive",
            }));
        }
        if tick_ms > i64::from(i32::MAX) as u64 {
            return Err(Error::new(ErrorKind::InvalidInput {
                msg: "tick_duration does not fit in a 32-bit millisecond sleep",
            }));
        }
        if ticks_per_wheel == 0 || ticks_per_wheel > MAX_TICKS_PER_WHEEL {
            return Err(Error::new(ErrorKind::InvalidInput {
                msg: "ticks_per_wheel must be in 1..=2^30",
            }));
        }

        let tick_duration_ticks = tick_ms * TICKS_PER_MS;
        let wheel_len = wheel::next_power_of_two(ticks_per_wheel);
        if (tick_duration_ticks as i64).checked_mul(wheel_len as i64).is_none() {
            return Err(Error::new(ErrorKind::InvalidInput {
                msg: "tick_duration * ticks_per_wheel overflows a 64-bit signed integer",
            }));
        }

        let pending_queue: MpscQueue<Arc<Timeout>> = MpscQueue::new();
        let pending_tx = pending_queue.sender();
        let cancel_queue: MpscQueue<Arc<Timeout>> = MpscQueue::new();
        let cancel_tx = cancel_queue.sender();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::unbounded();

        let instances = INSTANCE_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
        if instances > INSTANCE_WARNING_THRESHOLD && !WARNED.swap(true, Ordering::Relaxed) {
            warn!(
                "{} hashed-wheel timer instances are live; each owns a dedicated \
                 thread — consider sharing a single timer",
                instances
            );
        }

        Ok(Self {
            shared: Arc::new(Shared {
                max_pending: max_pending_timeouts,
                pending_count: AtomicI64::new(0),
                cancel_tx,
            }),
            clock,
            tick_duration: tick_duration_ticks,
            ticks_per_wheel,
            start_ticks: Arc::new(AtomicU64::new(0)),
            state: AtomicU8::new(INIT),
            pending_tx,
            shutdown_tx,
            worker_thread_id: Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle::NotStarted {
                pending_queue,
                cancel_queue,
                shutdown_rx,
            }),
            counted: AtomicBool::new(true),
        })
    }

    /// Starts the worker thread, idempotently.
    ///
    /// Blocks the calling thread until the worker has published its start
    /// instant. A no-op (returning `Ok`) if already started. Fails with
    /// [`ErrorKind::IllegalState`] if the timer has already been stopped.
    ///
    /// [`ErrorKind::IllegalState`]: ../error/enum.ErrorKind.html#variant.IllegalState
    pub fn start(&self) -> Result<(), Error<()>> {
        match self
            .state
            .compare_exchange(INIT, STARTED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                let (pending_queue, cancel_queue, shutdown_rx) = {
                    let mut lifecycle = self.lifecycle.lock().unwrap();
                    match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                        Lifecycle::NotStarted {
                            pending_queue,
                            cancel_queue,
                            shutdown_rx,
                        } => (pending_queue, cancel_queue, shutdown_rx),
                        _ => unreachable!("state was INIT but lifecycle had already advanced"),
                    }
                };

                let (ready_tx, ready_rx) = crossbeam_channel::unbounded();
                let (result_tx, result_rx) = crossbeam_channel::unbounded();

                let worker = Worker::new(
                    self.ticks_per_wheel,
                    self.tick_duration,
                    self.clock.clone(),
                    self.start_ticks.clone(),
                    pending_queue,
                    cancel_queue,
                    shutdown_rx,
                    ready_tx,
                    result_tx,
                );

                let join = thread::Builder::new()
                    .name("hashed-wheel-timer-worker".to_string())
                    .spawn(move || worker.run())
                    .expect("failed to spawn timer worker thread");

                *self.worker_thread_id.lock().unwrap() = Some(join.thread().id());
                *self.lifecycle.lock().unwrap() = Lifecycle::Running { join, result_rx };

                // The worker publishes its start instant before anything
                // else; wait for that so callers never observe a deadline
                // computed against an unset start instant.
                let _ = ready_rx.recv();

                Ok(())
            }
            Err(STARTED) => Ok(()),
            Err(_) => Err(Error::new(ErrorKind::IllegalState {
                msg: "start() called after stop()",
            })),
        }
    }

    /// Schedules `task` to run once, no earlier than `delay` from now
    /// (rounded up to the next millisecond). Starts the worker lazily if it
    /// hasn't been started yet. Never blocks.
    ///
    /// Fails with [`ErrorKind::Rejected`] if a pending-timeout limit is
    /// configured and has been reached; the task is handed back through the
    /// error's content. Fails with [`ErrorKind::IllegalState`] if the timer
    /// has already been stopped.
    ///
    /// [`ErrorKind::Rejected`]: ../error/enum.ErrorKind.html#variant.Rejected
    /// [`ErrorKind::IllegalState`]: ../error/enum.ErrorKind.html#variant.IllegalState
    pub fn schedule(&self, task: Task, delay: Duration) -> Result<Arc<Timeout>, Error<Task>> {
        if let Err(err) = self.start() {
            return Err(Error::with_content(err.kind(), task));
        }

        if self.shared.max_pending > 0 {
            let new_count = self.shared.pending_count.fetch_add(1, Ordering::AcqRel) + 1;
            if new_count > self.shared.max_pending {
                self.shared.pending_count.fetch_sub(1, Ordering::AcqRel);
                return Err(Error::with_content(ErrorKind::Rejected, task));
            }
        }

        let elapsed = self
            .clock
            .now()
            .saturating_sub(self.start_ticks.load(Ordering::Acquire));
        let deadline = elapsed + duration_to_ms_ceil(delay) * TICKS_PER_MS;

        let record = Timeout::new(task, deadline, Arc::downgrade(&self.shared));
        // The worker is the only consumer and it never stops draining
        // until shutdown, so a send failure can only mean the worker
        // thread already exited (panicked or a bug); the record is still
        // returned to the caller and will simply never fire, matching the
        // "unprocessed on an unclean shutdown" story.
        if self.pending_tx.send(record.clone()).is_err() {
            error!("timer worker is gone; submitted timeout will never fire");
        }
        Ok(record)
    }

    /// Stops the timer, joining the worker thread and returning every
    /// timeout that was live (neither fired nor cancelled) at the moment of
    /// shutdown.
    ///
    /// Idempotent: calling `stop` again after it has already run returns an
    /// empty set. Fails with [`ErrorKind::IllegalState`] if called from the
    /// worker thread itself (a task trying to stop its own timer).
    ///
    /// [`ErrorKind::IllegalState`]: ../error/enum.ErrorKind.html#variant.IllegalState
    pub fn stop(&self) -> Result<HashSet<Arc<Timeout>>, Error<()>> {
        if let Some(id) = *self.worker_thread_id.lock().unwrap() {
            if thread::current().id() == id {
                return Err(Error::new(ErrorKind::IllegalState {
                    msg: "stop() called from the timer's own worker thread",
                }));
            }
        }

        match self
            .state
            .compare_exchange(STARTED, SHUTDOWN, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                let _ = self.shutdown_tx.send(());

                let (join, result_rx) = {
                    let mut lifecycle = self.lifecycle.lock().unwrap();
                    match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                        Lifecycle::Running { join, result_rx } => (join, result_rx),
                        _ => unreachable!("state was STARTED but lifecycle had already advanced"),
                    }
                };

                let unprocessed = result_rx
                    .recv_timeout(Duration::from_millis(100))
                    .unwrap_or_else(|_| {
                        warn!("timer worker did not report its unprocessed set within 100ms");
                        Vec::new()
                    });
                let _ = join.join();

                self.release_instance_count();
                Ok(unprocessed.into_iter().collect())
            }
            Err(INIT) => {
                self.state.store(SHUTDOWN, Ordering::Release);
                *self.lifecycle.lock().unwrap() = Lifecycle::Stopped;
                self.release_instance_count();
                Ok(HashSet::new())
            }
            Err(_) => {
                self.release_instance_count();
                Ok(HashSet::new())
            }
        }
    }

    fn release_instance_count(&self) {
        if self
            .counted
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            INSTANCE_COUNT.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.release_instance_count();
    }
}

impl Default for Timer {
    /// Equivalent to [`default_timer`](Timer::default_timer): a 100ms tick,
    /// a 512-slot wheel, and no pending-timeout limit.
    fn default() -> Self {
        Self::default_timer()
    }
}

/// Fluent constructor for [`Timer`], mirroring the builder pattern used
/// elsewhere in this crate's configuration surface.
///
/// [`Timer`]: struct.Timer.html
pub struct TimerBuilder {
    tick_duration: Duration,
    ticks_per_wheel: u64,
    max_pending_timeouts: i64,
    clock: Option<Arc<dyn Now>>,
}

impl TimerBuilder {
    fn new() -> Self {
        Self {
            tick_duration: DEFAULT_TICK_DURATION,
            ticks_per_wheel: DEFAULT_TICKS_PER_WHEEL,
            max_pending_timeouts: 0,
            clock: None,
        }
    }

    /// Sets the duration of one tick. Defaults to 100ms.
    pub fn tick_duration(mut self, tick_duration: Duration) -> Self {
        self.tick_duration = tick_duration;
        self
    }

    /// Sets the number of slots in the wheel, rounded up to the next power
    /// of two. Defaults to 512.
    pub fn ticks_per_wheel(mut self, ticks_per_wheel: u64) -> Self {
        self.ticks_per_wheel = ticks_per_wheel;
        self
    }

    /// Caps the number of live, not-yet-terminated timeouts this timer will
    /// accept. `<= 0` (the default) disables the limit.
    pub fn max_pending_timeouts(mut self, max_pending_timeouts: i64) -> Self {
        self.max_pending_timeouts = max_pending_timeouts;
        self
    }

    /// Overrides the clock source. Not exposed publicly: production callers
    /// always get [`SystemClock`]; this crate's own test suite uses it to
    /// substitute a [`MockClock`].
    ///
    /// [`SystemClock`]: ../clock/struct.SystemClock.html
    /// [`MockClock`]: ../clock/struct.MockClock.html
    #[doc(hidden)]
    pub fn clock(mut self, clock: Arc<dyn Now>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the timer, validating the configured parameters.
    pub fn build(self) -> Result<Timer, Error<()>> {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Now>);
        Timer::with_clock(
            self.tick_duration,
            self.ticks_per_wheel,
            self.max_pending_timeouts,
            clock,
        )
    }
}

impl Default for TimerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::MockClock;

    fn mock_timer(tick_ms: u64, ticks_per_wheel: u64, max_pending: i64) -> (Timer, MockClock) {
        let clock = MockClock::new();
        let timer = Timer::builder()
            .tick_duration(Duration::from_millis(tick_ms))
            .ticks_per_wheel(ticks_per_wheel)
            .max_pending_timeouts(max_pending)
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        (timer, clock)
    }

    #[test]
    fn rejects_non_positive_tick_duration() {
        let result = Timer::new(Duration::from_millis(0), 8, 0);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_oversized_wheel() {
        let result = Timer::new(Duration::from_millis(100), MAX_TICKS_PER_WHEEL + 1, 0);
        assert!(result.is_err());
    }

    #[test]
    fn schedule_fires_after_delay_elapses() {
        let (timer, clock) = mock_timer(100, 8, 0);
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();

        timer
            .schedule(
                Box::new(move |_| fired2.store(true, Ordering::SeqCst)),
                Duration::from_millis(250),
            )
            .unwrap();

        // start() published the start instant already; advance past the
        // third 100ms tick boundary (250ms ceils to 300ms).
        for _ in 0..3 {
            clock.advance_ms(100);
            thread::sleep(Duration::from_millis(20));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !fired.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        assert!(fired.load(Ordering::SeqCst));
        timer.stop().unwrap();
    }

    #[test]
    fn cancel_before_fire_prevents_run() {
        let (timer, _clock) = mock_timer(100, 8, 0);
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();

        let handle = timer
            .schedule(
                Box::new(move |_| fired2.store(true, Ordering::SeqCst)),
                Duration::from_secs(1),
            )
            .unwrap();

        assert!(handle.cancel());
        assert!(!handle.cancel());
        thread::sleep(Duration::from_millis(50));
        assert!(!fired.load(Ordering::SeqCst));
        timer.stop().unwrap();
    }

    #[test]
    fn pending_limit_rejects_excess_submissions() {
        let (timer, clock) = mock_timer(100, 8, 2);

        let a = timer
            .schedule(Box::new(|_| {}), Duration::from_secs(3600))
            .unwrap();
        let _b = timer
            .schedule(Box::new(|_| {}), Duration::from_secs(3600))
            .unwrap();
        let rejected = timer.schedule(Box::new(|_| {}), Duration::from_secs(3600));
        assert!(rejected.is_err());
        assert_eq!(rejected.err().unwrap().kind(), ErrorKind::Rejected);

        assert!(a.cancel());

        // Give the worker a tick boundary to cross so it drains the
        // cancellation queue and releases `a`'s pending-count slot.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            clock.advance_ms(100);
            thread::sleep(Duration::from_millis(20));
            if timer.schedule(Box::new(|_| {}), Duration::from_secs(3600)).is_ok() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "cancellation never drained");
        }

        timer.stop().unwrap();
    }

    #[test]
    fn stop_from_worker_thread_is_illegal_state() {
        let (timer, _clock) = mock_timer(100, 8, 0);
        timer.start().unwrap();

        // The real worker thread is somewhere else; simulate "called from
        // the worker thread" by registering the *current* (test) thread's
        // id as the worker's, which is exactly the check `stop` performs.
        *timer.worker_thread_id.lock().unwrap() = Some(thread::current().id());

        let result = timer.stop();
        assert!(result.is_err());
        assert_eq!(result.err().unwrap().kind(), ErrorKind::IllegalState);
    }

    #[test]
    fn double_stop_returns_empty_set() {
        let (timer, _clock) = mock_timer(100, 8, 0);
        timer.start().unwrap();
        let first = timer.stop().unwrap();
        let second = timer.stop().unwrap();
        assert!(first.is_empty());
        assert!(second.is_empty());
    }

    #[test]
    fn stop_without_start_is_a_clean_noop() {
        let (timer, _clock) = mock_timer(100, 8, 0);
        let unprocessed = timer.stop().unwrap();
        assert!(unprocessed.is_empty());
    }

    #[test]
    fn wrap_around_assigns_remaining_rounds() {
        // wheel=4, tick=100ms, schedule at 1200ms: calculated tick = 12,
        // bucket index = 12 & 3 = 0, remaining_rounds = 12 / 4 = 3.
        let (timer, clock) = mock_timer(100, 4, 0);
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();

        let handle = timer
            .schedule(
                Box::new(move |_| fired2.store(true, Ordering::SeqCst)),
                Duration::from_millis(1200),
            )
            .unwrap();

        // Let the worker transfer the submission into its bucket.
        clock.advance_ms(100);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(handle.deadline(), 1200 * TICKS_PER_MS);

        for _ in 0..12 {
            clock.advance_ms(100);
            thread::sleep(Duration::from_millis(10));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !fired.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(fired.load(Ordering::SeqCst));
        timer.stop().unwrap();
    }

    #[test]
    fn shutdown_collects_unprocessed_timeouts() {
        let (timer, _clock) = mock_timer(100, 8, 0);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let handle = timer
                .schedule(Box::new(|_| {}), Duration::from_secs(10))
                .unwrap();
            handles.push(handle);
        }

        thread::sleep(Duration::from_millis(150));
        let unprocessed = timer.stop().unwrap();

        assert!(unprocessed.len() <= 10);
        for handle in &handles {
            assert!(handle.is_init());
            assert!(!handle.is_expired());
        }
        for record in &unprocessed {
            assert!(record.is_init());
        }
    }

    #[test]
    fn schedule_after_start_fires_on_next_tick_not_immediately() {
        let (timer, clock) = mock_timer(100, 8, 0);
        timer.start().unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        timer
            .schedule(
                Box::new(move |_| fired2.store(true, Ordering::SeqCst)),
                Duration::from_millis(0),
            )
            .unwrap();

        // Not fired immediately: the worker hasn't crossed a tick boundary.
        thread::sleep(Duration::from_millis(20));
        assert!(!fired.load(Ordering::SeqCst));

        clock.advance_ms(100);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !fired.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(fired.load(Ordering::SeqCst));
        timer.stop().unwrap();
    }
}
