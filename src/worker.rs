//! The dedicated worker thread: the only thing that ever touches the wheel.
//!
//! Grounded on the single-thread-owns-the-wheel shape of tokio-timer's old
//! `Worker`, adapted to use `crossbeam-channel` for the submission and
//! cancellation queues instead of a hand-rolled mpmc queue, and to drive a
//! hashed wheel (this crate's [`Wheel`]) instead of a flat slab.
//!
//! [`Wheel`]: ../wheel/struct.Wheel.html

use crate::clock::Now;
use crate::error::Error;
use crate::queue::MpscQueue;
use crate::record::Timeout;
use crate::wheel::Wheel;

use crossbeam_channel::{Receiver, Sender};
use log::error;
use smallvec::SmallVec;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Submissions drained into buckets per tick are capped so one overloaded
/// tick can't stall cancellation processing indefinitely.
const MAX_TRANSFERS_PER_TICK: usize = 100_000;

/// Outcome of waiting for the next tick boundary.
pub(crate) enum TickWait {
    /// The next tick boundary was reached; carries ticks elapsed since the
    /// wheel's start instant, used as the expiry deadline for this tick.
    Elapsed(u64),
    /// A shutdown was requested before the boundary was reached.
    Shutdown,
}

/// Everything the worker thread owns exclusively. Nothing here is shared
/// with producer threads except through the channels.
pub(crate) struct Worker {
    wheel: Wheel,
    tick_duration: u64,
    tick: u64,
    clock: Arc<dyn Now>,
    /// Published once, right before the first tick, so `Timer::start` can
    /// unblock callers waiting for the worker to be live.
    start_ticks: Arc<AtomicU64>,
    pending_queue: MpscQueue<Arc<Timeout>>,
    cancel_queue: MpscQueue<Arc<Timeout>>,
    shutdown_rx: Receiver<()>,
    ready_tx: Sender<()>,
    result_tx: Sender<Vec<Arc<Timeout>>>,
}

impl Worker {
    pub(crate) fn new(
        ticks_per_wheel: u64,
        tick_duration: u64,
        clock: Arc<dyn Now>,
        start_ticks: Arc<AtomicU64>,
        pending_queue: MpscQueue<Arc<Timeout>>,
        cancel_queue: MpscQueue<Arc<Timeout>>,
        shutdown_rx: Receiver<()>,
        ready_tx: Sender<()>,
        result_tx: Sender<Vec<Arc<Timeout>>>,
    ) -> Self {
        Self {
            wheel: Wheel::new(ticks_per_wheel),
            tick_duration,
            tick: 0,
            clock,
            start_ticks,
            pending_queue,
            cancel_queue,
            shutdown_rx,
            ready_tx,
            result_tx,
        }
    }

    /// Runs until a shutdown is requested, then drains every live record
    /// (bucketed, pending, or mid-cancellation) and hands the unprocessed
    /// set back through `result_tx`.
    ///
    /// This is the body executed on the dedicated worker thread; it never
    /// returns until the timer is stopped.
    pub(crate) fn run(mut self) {
        let start = self.clock.now().max(1);
        self.start_ticks.store(start, Ordering::Release);
        // The builder side is waiting on this; if it's gone there's no one
        // left to notify and that's fine.
        let _ = self.ready_tx.send(());

        loop {
            match self.wait_for_next_tick(start) {
                TickWait::Shutdown => break,
                TickWait::Elapsed(now) => {
                    self.process_cancelled_tasks();
                    self.transfer_timeouts_to_buckets();
                    if let Err(err) = self.expire_current_bucket(now) {
                        error!("wheel consistency error, dropping this tick's expiry: {}", err);
                    }
                    self.tick += 1;
                }
            }
        }

        let unprocessed = self.drain_all();
        let _ = self.result_tx.send(unprocessed);
    }

    /// Blocks until either the next tick boundary (`(tick + 1) *
    /// tick_duration` ticks after `start`) is reached or a shutdown is
    /// signalled, whichever comes first.
    fn wait_for_next_tick(&self, start: u64) -> TickWait {
        loop {
            let target = (self.tick + 1) * self.tick_duration;
            let elapsed = self.clock.now().saturating_sub(start);

            if elapsed >= target {
                return TickWait::Elapsed(elapsed);
            }

            let remaining_ticks = target - elapsed;
            let remaining_ms = crate::clock::ticks_to_ms_ceil(remaining_ticks).max(1);
            let wait = Duration::from_millis(remaining_ms);

            crossbeam_channel::select! {
                recv(self.shutdown_rx) -> _ => return TickWait::Shutdown,
                default(wait) => continue,
            }
        }
    }

    /// Drains up to [`MAX_TRANSFERS_PER_TICK`] pending submissions, hashing
    /// each into its bucket and assigning its remaining-rounds count.
    fn transfer_timeouts_to_buckets(&mut self) {
        let mut drained: SmallVec<[Arc<Timeout>; 32]> = SmallVec::new();

        for _ in 0..MAX_TRANSFERS_PER_TICK {
            match self.pending_queue.try_pop() {
                Some(record) => drained.push(record),
                None => break,
            }
        }

        for record in drained {
            if record.is_cancelled() {
                record.decrement_pending();
                continue;
            }

            let wheel_len = self.wheel.len() as u64;
            let calculated_tick = ceil_div(record.deadline(), self.tick_duration);
            let remaining_rounds =
                (calculated_tick as i64 - self.tick as i64) / wheel_len as i64;
            let effective_tick = calculated_tick.max(self.tick);

            record.set_remaining_rounds(remaining_rounds);
            let idx = self.wheel.index_of(effective_tick);
            self.wheel.bucket_mut(idx).add(idx, record);
        }
    }

    /// Drains the cancellation queue, unlinking each cancelled record from
    /// whatever bucket it's currently in. A record cancelled before it was
    /// ever transferred out of the submission queue has no bucket to unlink
    /// from, so its pending count is released here directly.
    fn process_cancelled_tasks(&mut self) {
        while let Some(record) = self.cancel_queue.try_pop() {
            match record.bucket_index() {
                Some(idx) => {
                    self.wheel.bucket_mut(idx).remove(&record);
                }
                None => record.decrement_pending(),
            }
        }
    }

    fn expire_current_bucket(&mut self, deadline: u64) -> Result<(), Error<()>> {
        let idx = self.wheel.index_of(self.tick);
        let fired = self.wheel.bucket_mut(idx).expire(deadline)?;
        for record in fired {
            record.fire();
        }
        Ok(())
    }

    /// Shutdown-time collection: every record still in a bucket, still in
    /// the submission queue, or still arriving on the cancellation queue.
    /// Cancelled and already-expired records are discarded along the way;
    /// everything still `INIT` is returned as unprocessed.
    fn drain_all(&mut self) -> Vec<Arc<Timeout>> {
        let mut unprocessed = Vec::new();

        for bucket in self.wheel.iter_mut() {
            bucket.clear(&mut unprocessed);
        }

        while let Some(record) = self.pending_queue.try_pop() {
            if record.is_cancelled() {
                record.decrement_pending();
            } else if record.is_init() {
                record.decrement_pending();
                unprocessed.push(record);
            }
        }

        // A cancellation racing the shutdown signal may still land after
        // the loops above ran; it can only reference records already
        // swept up here, so this is a pure pending-count settling pass.
        while let Some(record) = self.cancel_queue.try_pop() {
            record.decrement_pending();
        }

        unprocessed
    }
}

/// Ceiling integer division; `divisor` is always non-zero (tick durations
/// are validated to be at least 1 at construction).
fn ceil_div(dividend: u64, divisor: u64) -> u64 {
    (dividend + divisor - 1) / divisor
}
