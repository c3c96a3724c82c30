//! Run-to-quiescence trampoline.
//!
//! Tasks scheduled on the same trampoline run strictly one at a time, to
//! completion, in submission order. A task that schedules further tasks only
//! enqueues them; the thread that is already draining picks them up after the
//! current task returns, so long synchronous chains never grow the stack.

use std::{
  collections::VecDeque,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  thread,
  time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::trace;

use super::{QueuedTask, Scheduler, Task};
use crate::{cancellable::CancellationFlag, certificate::Ledger};

pub struct Trampoline {
  queue: Mutex<VecDeque<QueuedTask>>,
  draining: AtomicBool,
  ledger: Arc<Ledger>,
  epoch: Instant,
}

impl Trampoline {
  pub fn new(ledger: Arc<Ledger>) -> Arc<Self> {
    Arc::new(Self {
      queue: Mutex::new(VecDeque::new()),
      draining: AtomicBool::new(false),
      ledger,
      epoch: Instant::now(),
    })
  }

  /// Number of tasks waiting to run.
  pub fn pending_count(&self) -> usize { self.queue.lock().len() }

  /// `true` while some thread is draining the queue.
  pub fn is_draining(&self) -> bool { self.draining.load(Ordering::Acquire) }

  /// Run `f` as if it were a task of this trampoline: anything it schedules
  /// is held back until `f` returns, then drained.
  ///
  /// When the trampoline is already draining `f` runs inline and its tasks
  /// join the current queue.
  pub fn hold<R>(&self, f: impl FnOnce() -> R) -> R {
    if !self.try_enter() {
      return f();
    }
    let result = f();
    self.drain();
    result
  }

  fn try_enter(&self) -> bool {
    self
      .draining
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  fn drain(&self) {
    loop {
      let next = self.queue.lock().pop_front();
      match next {
        Some(task) => {
          trace!(queue_len = self.pending_count(), "trampoline task");
          task.run();
        }
        None => {
          self.draining.store(false, Ordering::Release);
          // Another thread may have enqueued between the pop and the store.
          if self.queue.lock().is_empty() || !self.try_enter() {
            return;
          }
        }
      }
    }
  }
}

impl Scheduler for Trampoline {
  fn now(&self) -> Duration { self.epoch.elapsed() }

  fn ledger(&self) -> &Arc<Ledger> { &self.ledger }

  /// Delayed tasks block the draining thread until they are due, the way a
  /// current-thread scheduler does.
  fn schedule_relative(&self, due: Duration, task: Task, cancellation: Option<CancellationFlag>) {
    let task: Task = if due.is_zero() {
      task
    } else {
      let deadline = Instant::now() + due;
      Box::new(move || {
        let now = Instant::now();
        if deadline > now {
          thread::sleep(deadline - now);
        }
        task()
      })
    };
    self
      .queue
      .lock()
      .push_back(QueuedTask::new(task, cancellation));
    if self.try_enter() {
      self.drain();
    }
  }
}
