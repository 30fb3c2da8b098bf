//! A hashed timing wheel for scheduling large numbers of deferred one-shot
//! tasks with amortised O(1) insertion and cancellation.
//!
//! This crate implements the design described in [Varghese and Lauck's
//! paper on timing wheels][paper]: a fixed-length, power-of-two-sized array
//! of buckets, one advancing cursor, and a round counter on each record so a
//! single array can represent deadlines many revolutions in the future. It
//! trades precise per-timer firing for the ability to hold tens or hundreds
//! of thousands of pending timeouts behind a handful of per-tick
//! operations.
//!
//! # Usage
//!
//! ```
//! use hashed_wheel_timer::Timer;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::time::Duration;
//!
//! let timer = Timer::builder()
//!     .tick_duration(Duration::from_millis(10))
//!     .ticks_per_wheel(64)
//!     .build()
//!     .unwrap();
//!
//! let fired = Arc::new(AtomicBool::new(false));
//! let fired2 = fired.clone();
//! let handle = timer
//!     .schedule(
//!         Box::new(move |_| fired2.store(true, Ordering::SeqCst)),
//!         Duration::from_millis(20),
//!     )
//!     .unwrap();
//!
//! assert!(!handle.is_expired());
//! timer.stop().unwrap();
//! ```
//!
//! # Architecture
//!
//! - [`clock`] — the [`Now`] trait abstracting "read the current instant",
//!   with a production [`SystemClock`] and a deterministic [`MockClock`]
//!   for tests.
//! - [`error`] — [`Error`] / [`ErrorKind`], the crate's `failure`-based
//!   error taxonomy.
//! - [`record`] — [`Timeout`], the scheduled task's handle and intrusive
//!   bucket-list node.
//! - `bucket` / `wheel` — the wheel's internal storage; not part of the
//!   public API.
//! - `queue` / `worker` — the producer/worker plumbing; not part of the
//!   public API.
//! - [`timer`] — [`Timer`] and [`TimerBuilder`], the public facade.
//!
//! [paper]: http://www.cs.columbia.edu/~nahum/w6998/papers/ton97-timing-wheels.pdf
//! [`Now`]: clock::Now
//! [`SystemClock`]: clock::SystemClock
//! [`MockClock`]: clock::MockClock
//! [`Error`]: error::Error
//! [`ErrorKind`]: error::ErrorKind
//! [`Timeout`]: record::Timeout
//! [`Timer`]: timer::Timer
//! [`TimerBuilder`]: timer::TimerBuilder

pub mod clock;
pub mod error;
mod record;
mod bucket;
mod wheel;
mod queue;
mod worker;
mod timer;

pub use clock::{MockClock, Now, SystemClock};
pub use error::{Error, ErrorKind};
pub use record::{Task, Timeout};
pub use timer::{Timer, TimerBuilder};
