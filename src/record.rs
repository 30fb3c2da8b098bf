//! The timeout record: both the intrusive bucket-list node and the public
//! handle returned by [`Timer::schedule`].
//!
//! [`Timer::schedule`]: ../struct.Timer.html#method.schedule

use crate::timer::Shared;

use log::warn;

use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// The work a scheduled timeout runs once, on the worker thread.
///
/// Receives the fired handle so the task can inspect its own deadline, or a
/// caller can close over a [`Timer`](crate::timer::Timer) to resubmit
/// follow-up work from inside the task itself.
pub type Task = Box<dyn FnOnce(&Arc<Timeout>) + Send>;

const INIT: u8 = 0;
const CANCELLED: u8 = 1;
const EXPIRED: u8 = 2;

/// Intrusive doubly-linked list placement. The forward link (`next`) owns
/// the node it points to, keeping it alive while linked; the backward link
/// (`prev`) is a [`Weak`] reference so the list doesn't leak a cycle.
///
/// Only the worker thread ever reads or writes these fields.
struct Links {
    next: Option<Arc<Timeout>>,
    prev: Option<Weak<Timeout>>,
    /// Index of the bucket this record currently sits in, or `None` if
    /// unlinked. Mirrors the spec's "record's `bucket` field" invariant.
    bucket: Option<usize>,
}

/// A scheduled timeout: the node stored in a wheel [`Bucket`] and the
/// handle callers get back from [`schedule`].
///
/// [`Bucket`]: ../bucket/struct.Bucket.html
/// [`schedule`]: ../struct.Timer.html#method.schedule
pub struct Timeout {
    task: UnsafeCell<Option<Task>>,
    /// Absolute deadline, in hundred-nanosecond ticks from the timer's
    /// start instant, rounded up to a millisecond boundary at submission.
    deadline: u64,
    state: AtomicU8,
    /// Number of full wheel revolutions still to wait. Assigned by the
    /// worker when the record is transferred into a bucket; mutated only
    /// by the worker thereafter.
    remaining_rounds: UnsafeCell<i64>,
    links: UnsafeCell<Links>,
    pending_decremented: AtomicBool,
    timer: Weak<Shared>,
}

// `task`, `remaining_rounds`, and `links` are touched exclusively by the
// worker thread (the producer thread that creates a `Timeout` hands it off
// to the pending-submission queue immediately and never touches these
// fields again). `state` and `pending_decremented` are atomics and are
// safe to share as-is.
unsafe impl Sync for Timeout {}

impl Timeout {
    pub(crate) fn new(task: Task, deadline: u64, timer: Weak<Shared>) -> Arc<Self> {
        Arc::new(Self {
            task: UnsafeCell::new(Some(task)),
            deadline,
            state: AtomicU8::new(INIT),
            remaining_rounds: UnsafeCell::new(0),
            links: UnsafeCell::new(Links {
                next: None,
                prev: None,
                bucket: None,
            }),
            pending_decremented: AtomicBool::new(false),
            timer,
        })
    }

    /// Absolute deadline, in hundred-nanosecond ticks from the timer's
    /// start instant.
    pub fn deadline(&self) -> u64 {
        self.deadline
    }

    /// The timer state backing this record, if the owning timer hasn't been
    /// dropped. Crate-internal: [`Shared`] is bookkeeping, not part of the
    /// public API (see [`Shared`]'s own doc comment for why it's kept
    /// separate from the public [`Timer`](crate::timer::Timer) facade).
    pub(crate) fn timer(&self) -> Option<Arc<Shared>> {
        self.timer.upgrade()
    }

    /// Attempts to cancel this timeout.
    ///
    /// Returns `true` if the cancellation took effect (the record was in
    /// `INIT` state), in which case the task is guaranteed never to run.
    /// Returns `false` if the record had already fired or already been
    /// cancelled — idempotent, and cancellation after firing is a no-op.
    pub fn cancel(self: &Arc<Self>) -> bool {
        match self
            .state
            .compare_exchange(INIT, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                if let Some(shared) = self.timer.upgrade() {
                    // Best-effort: if the worker is already gone the
                    // record will be swept up as unprocessed instead.
                    let _ = shared.cancel_tx.send(self.clone());
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Whether [`cancel`] has successfully cancelled this record.
    ///
    /// [`cancel`]: #method.cancel
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Whether this record's task has run.
    pub fn is_expired(&self) -> bool {
        self.state.load(Ordering::Acquire) == EXPIRED
    }

    pub(crate) fn is_init(&self) -> bool {
        self.state.load(Ordering::Acquire) == INIT
    }

    /// Worker-only: runs the task if the record is still `INIT`,
    /// transitioning it to `EXPIRED`. A no-op if the record was already
    /// cancelled (or, impossibly, already expired).
    pub(crate) fn fire(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(INIT, EXPIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let task = unsafe { (*self.task.get()).take() };
        if let Some(task) = task {
            let this = self.clone();
            let result = catch_unwind(AssertUnwindSafe(|| task(&this)));
            if let Err(panic) = result {
                warn!("timeout task panicked: {}", describe_panic(&panic));
            }
        }

        self.decrement_pending();
    }

    /// Worker-only: decrements the owning timer's pending-count counter at
    /// most once for this record, regardless of whether it fires, is
    /// cancelled and unlinked, or is swept into the unprocessed set on
    /// shutdown.
    pub(crate) fn decrement_pending(&self) {
        if self
            .pending_decremented
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(shared) = self.timer.upgrade() {
                shared.release_pending();
            }
        }
    }

    fn links(&self) -> &mut Links {
        unsafe { &mut *self.links.get() }
    }

    pub(crate) fn bucket_index(&self) -> Option<usize> {
        self.links().bucket
    }

    pub(crate) fn set_bucket_index(&self, idx: Option<usize>) {
        self.links().bucket = idx;
    }

    pub(crate) fn next(&self) -> Option<Arc<Timeout>> {
        self.links().next.clone()
    }

    pub(crate) fn set_next(&self, next: Option<Arc<Timeout>>) {
        self.links().next = next;
    }

    pub(crate) fn take_next(&self) -> Option<Arc<Timeout>> {
        self.links().next.take()
    }

    pub(crate) fn set_prev(&self, prev: Option<Weak<Timeout>>) {
        self.links().prev = prev;
    }

    pub(crate) fn take_prev(&self) -> Option<Weak<Timeout>> {
        self.links().prev.take()
    }

    pub(crate) fn remaining_rounds(&self) -> i64 {
        unsafe { *self.remaining_rounds.get() }
    }

    pub(crate) fn set_remaining_rounds(&self, rounds: i64) {
        unsafe {
            *self.remaining_rounds.get() = rounds;
        }
    }

    pub(crate) fn decrement_remaining_rounds(&self) {
        unsafe {
            *self.remaining_rounds.get() -= 1;
        }
    }
}

// Identity, not value, equality: two records are "the same" iff they're the
// same allocation. Needed so `stop()` can return a `HashSet<Arc<Timeout>>`.
impl PartialEq for Timeout {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for Timeout {}

impl std::hash::Hash for Timeout {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (self as *const Timeout).hash(state)
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("deadline", &self.deadline)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

fn describe_panic(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn new_detached(deadline: u64) -> Arc<Timeout> {
        Timeout::new(Box::new(|_| {}), deadline, Weak::new())
    }

    #[test]
    fn cancel_is_idempotent() {
        let t = new_detached(100);
        assert!(t.cancel());
        assert!(!t.cancel());
        assert!(t.is_cancelled());
        assert!(!t.is_expired());
    }

    #[test]
    fn cancelled_task_never_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let t = Timeout::new(
            Box::new(move |_| {
                fired2.store(true, Ordering::SeqCst);
            }),
            100,
            Weak::new(),
        );
        assert!(t.cancel());
        t.fire();
        assert!(!fired.load(Ordering::SeqCst));
        assert!(t.is_cancelled());
        assert!(!t.is_expired());
    }

    #[test]
    fn fire_runs_task_once() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = count.clone();
        let t = Timeout::new(
            Box::new(move |_| {
                count2.fetch_add(1, Ordering::SeqCst);
            }),
            100,
            Weak::new(),
        );
        t.fire();
        t.fire();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(t.is_expired());
        assert!(!t.is_cancelled());
    }

    #[test]
    fn panicking_task_is_caught() {
        // `fire` logs the panic at `warn!`; route it through `env_logger` so
        // running this test with `RUST_LOG=warn` actually shows it.
        let _ = env_logger::try_init();

        let t = Timeout::new(Box::new(|_| panic!("boom")), 100, Weak::new());
        t.fire();
        assert!(t.is_expired());
    }

    #[test]
    fn cancel_after_fire_is_noop() {
        let t = new_detached(100);
        t.fire();
        assert!(!t.cancel());
        assert!(t.is_expired());
        assert!(!t.is_cancelled());
    }
}
