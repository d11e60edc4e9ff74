//! # timer - Deferred messages and the task worker loop
//!
//! Every multi-millisecond wait in a task (a power pulse, pacing between
//! chunks, a retry back-off) is expressed as a message the task posts to
//! itself later. A `Scheduler` holds at most one such deferred message;
//! arming it again replaces whatever was pending, so the earlier message
//! never fires.
//!
//! Time comes from a `Clock`. `SystemClock` is wall-clock time for the real
//! device; `ManualClock` only moves when told to, which lets tests step
//! through a fifteen second power-up sequence instantly.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// A source of monotonic milliseconds, plus a way to give up the processor
/// for a while.
pub trait Clock: Clone + Send {
	/// Milliseconds since some fixed point in the past.
	fn now(&self) -> u64;
	/// Suspend the caller for `ms` milliseconds.
	fn pause(&self, ms: u64);
}

/// Wall-clock time, measured from when the clock was created.
#[derive(Debug, Copy, Clone)]
pub struct SystemClock {
	epoch: Instant,
}

/// A clock that only advances when `pause`, `advance` or `set` is called.
/// Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
	now: Arc<AtomicU64>,
}

/// Holds the single deferred message of a task, and a way to post
/// messages straight back onto the task's own queue.
pub struct Scheduler<M, C> {
	tx: mpsc::Sender<M>,
	clock: C,
	deferred: Option<Deferred<M>>,
}

/// Implemented by a task context so the worker loop can drive it.
pub trait Task {
	/// Everything the task can find on its queue.
	type Message: Send;
	/// Where the task's scheduler gets its time from.
	type Clock: Clock;
	/// Process one message.
	fn handle(&mut self, msg: Self::Message);
	/// The task's scheduler.
	fn scheduler(&mut self) -> &mut Scheduler<Self::Message, Self::Clock>;
}

// ****************************************************************************
//
// Private Types
//
// ****************************************************************************

struct Deferred<M> {
	msg: M,
	due: u64,
}

// ****************************************************************************
//
// Public Functions
//
// ****************************************************************************

/// The worker loop. Blocks on the task's queue, but never past the due time
/// of the deferred message, which is posted onto the queue when it expires.
/// Returns only if every sender has gone away.
pub fn run<T: Task>(task: &mut T, rx: &mpsc::Receiver<T::Message>) {
	loop {
		if task.scheduler().fire_due() {
			continue;
		}
		let msg = match task.scheduler().due_in() {
			Some(wait) => match rx.recv_timeout(Duration::from_millis(wait)) {
				Ok(msg) => msg,
				Err(mpsc::RecvTimeoutError::Timeout) => continue,
				Err(mpsc::RecvTimeoutError::Disconnected) => break,
			},
			None => match rx.recv() {
				Ok(msg) => msg,
				Err(_) => break,
			},
		};
		task.handle(msg);
	}
	debug!("Worker loop finished");
}

/// Drives a task on a `ManualClock` without blocking: handles everything
/// queued, then jumps the clock forward to the deferred message (if it is
/// due no later than `deadline`) and carries on. Returns the number of
/// messages handled once the task is idle or the next deferred message lies
/// beyond `deadline`.
pub fn run_until_idle<T>(task: &mut T, rx: &mpsc::Receiver<T::Message>, deadline: u64) -> usize
where
	T: Task<Clock = ManualClock>,
{
	let mut handled = 0;
	loop {
		while let Ok(msg) = rx.try_recv() {
			task.handle(msg);
			handled += 1;
		}
		let due = match task.scheduler().due_at() {
			Some(due) if due <= deadline => due,
			_ => return handled,
		};
		let clock = task.scheduler().clock().clone();
		if clock.now() < due {
			clock.set(due);
		}
		task.scheduler().fire_due();
	}
}

impl SystemClock {
	pub fn new() -> SystemClock {
		SystemClock {
			epoch: Instant::now(),
		}
	}
}

impl Default for SystemClock {
	fn default() -> SystemClock {
		SystemClock::new()
	}
}

impl Clock for SystemClock {
	fn now(&self) -> u64 {
		let elapsed = self.epoch.elapsed();
		elapsed.as_secs() * 1000 + u64::from(elapsed.subsec_millis())
	}

	fn pause(&self, ms: u64) {
		thread::sleep(Duration::from_millis(ms));
	}
}

impl ManualClock {
	pub fn new() -> ManualClock {
		ManualClock::default()
	}

	/// Move time forward by `ms`.
	pub fn advance(&self, ms: u64) {
		self.now.fetch_add(ms, Ordering::SeqCst);
	}

	/// Jump to an absolute time. Going backwards is ignored.
	pub fn set(&self, ms: u64) {
		self.now.fetch_max(ms, Ordering::SeqCst);
	}
}

impl Clock for ManualClock {
	fn now(&self) -> u64 {
		self.now.load(Ordering::SeqCst)
	}

	fn pause(&self, ms: u64) {
		self.advance(ms);
	}
}

impl<M, C: Clock> Scheduler<M, C> {
	/// `tx` must feed the queue the owning task reads.
	pub fn new(tx: mpsc::Sender<M>, clock: C) -> Scheduler<M, C> {
		Scheduler {
			tx: tx,
			clock: clock,
			deferred: None,
		}
	}

	pub fn clock(&self) -> &C {
		&self.clock
	}

	/// Post a message to the owning task right away. It is handled after
	/// anything already queued.
	pub fn tell(&self, msg: M) {
		if self.tx.send(msg).is_err() {
			warn!("Task queue has gone - message dropped");
		}
	}

	/// Post a message to the owning task after `delay_ms`. Replaces any
	/// deferred message that has not fired yet.
	pub fn tell_after(&mut self, msg: M, delay_ms: u64) {
		if self.deferred.is_some() {
			trace!("Re-arming deferred message");
		}
		self.deferred = Some(Deferred {
			msg: msg,
			due: self.clock.now().saturating_add(delay_ms),
		});
	}

	/// Drop the deferred message, if any. Returns whether there was one.
	pub fn cancel(&mut self) -> bool {
		self.deferred.take().is_some()
	}

	pub fn is_armed(&self) -> bool {
		self.deferred.is_some()
	}

	/// When the deferred message is due, in clock milliseconds.
	pub fn due_at(&self) -> Option<u64> {
		self.deferred.as_ref().map(|d| d.due)
	}

	/// How long until the deferred message is due; zero if it is overdue.
	pub fn due_in(&self) -> Option<u64> {
		let now = self.clock.now();
		self.deferred.as_ref().map(|d| d.due.saturating_sub(now))
	}

	/// If the deferred message is due, post it onto the queue.
	pub fn fire_due(&mut self) -> bool {
		let now = self.clock.now();
		let due = match self.deferred {
			Some(ref d) => d.due <= now,
			None => false,
		};
		if due {
			if let Some(d) = self.deferred.take() {
				self.tell(d.msg);
			}
		}
		due
	}
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
