//! Virtual-time scheduler for deterministic tests.
//!
//! Time only advances when told to. Tasks run synchronously on the thread
//! calling [`TestScheduler::advance_by`] or [`TestScheduler::flush`], ordered by
//! due time and, for equal due times, by submission order.
//!
//! ```rust
//! use std::{
//!   sync::{
//!     atomic::{AtomicBool, Ordering},
//!     Arc,
//!   },
//!   time::Duration,
//! };
//! use rxflow::{
//!   certificate::Certificate,
//!   scheduler::{Scheduler, TestScheduler},
//! };
//!
//! let scheduler = TestScheduler::new();
//! let ran = Arc::new(AtomicBool::new(false));
//! let flag = ran.clone();
//! scheduler.schedule_relative(
//!   Duration::from_millis(10),
//!   Box::new(move || {
//!     flag.store(true, Ordering::SeqCst);
//!     Certificate::empty()
//!   }),
//!   None,
//! );
//!
//! scheduler.advance_by(Duration::from_millis(10));
//! assert_eq!(scheduler.now(), Duration::from_millis(10));
//! assert!(ran.load(Ordering::SeqCst));
//! ```

use std::{cmp::Ordering, collections::BinaryHeap, sync::Arc, time::Duration};

use parking_lot::Mutex;

use super::{QueuedTask, Scheduler, Task};
use crate::{cancellable::CancellationFlag, certificate::Ledger};

// ==================== Internal State ====================

#[derive(Default)]
struct TestSchedulerState {
  virtual_time: Duration,
  task_queue: BinaryHeap<ScheduledTask>,
  next_task_id: usize,
}

struct ScheduledTask {
  scheduled_time: Duration,
  task_id: usize,
  task: QueuedTask,
}

impl PartialEq for ScheduledTask {
  fn eq(&self, other: &Self) -> bool {
    self.scheduled_time == other.scheduled_time && self.task_id == other.task_id
  }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl Ord for ScheduledTask {
  fn cmp(&self, other: &Self) -> Ordering {
    // Min-heap: earlier times first, then FIFO by task_id
    other
      .scheduled_time
      .cmp(&self.scheduled_time)
      .then_with(|| other.task_id.cmp(&self.task_id))
  }
}

// ==================== TestScheduler ====================

/// A virtual time scheduler for deterministic testing.
///
/// Cloning shares the clock and the queue.
#[derive(Clone)]
pub struct TestScheduler {
  state: Arc<Mutex<TestSchedulerState>>,
  ledger: Arc<Ledger>,
}

impl Default for TestScheduler {
  fn default() -> Self { Self::with_ledger(Ledger::new()) }
}

impl TestScheduler {
  pub fn new() -> Self { Self::default() }

  pub fn with_ledger(ledger: Arc<Ledger>) -> Self {
    Self { state: Arc::new(Mutex::new(TestSchedulerState::default())), ledger }
  }

  /// Get the number of pending tasks in the queue.
  pub fn pending_count(&self) -> usize { self.state.lock().task_queue.len() }

  pub fn is_empty(&self) -> bool { self.state.lock().task_queue.is_empty() }

  fn execute_tasks_until(&self, target_time: Option<Duration>) {
    loop {
      let task = {
        let mut state = self.state.lock();
        let due = state
          .task_queue
          .peek()
          .is_some_and(|peek| target_time.is_none_or(|limit| peek.scheduled_time <= limit));
        if !due {
          break;
        }
        state.task_queue.pop().map(|scheduled| {
          state.virtual_time = scheduled.scheduled_time;
          scheduled.task
        })
      };
      // The lock is released while the task runs so it can schedule more.
      if let Some(task) = task {
        task.run();
      }
    }
  }

  /// Advance virtual time by `duration`, running every task that falls due.
  pub fn advance_by(&self, duration: Duration) {
    let target_time = self.state.lock().virtual_time + duration;
    self.advance_to(target_time);
  }

  /// Advance virtual time to `target_time`, running every task that falls due.
  pub fn advance_to(&self, target_time: Duration) {
    self.execute_tasks_until(Some(target_time));
    let mut state = self.state.lock();
    if state.virtual_time < target_time {
      state.virtual_time = target_time;
    }
  }

  /// Run every pending task, jumping the clock to each task's due time.
  pub fn flush(&self) { self.execute_tasks_until(None); }
}

impl Scheduler for TestScheduler {
  fn now(&self) -> Duration { self.state.lock().virtual_time }

  fn ledger(&self) -> &Arc<Ledger> { &self.ledger }

  fn schedule_relative(&self, due: Duration, task: Task, cancellation: Option<CancellationFlag>) {
    let mut state = self.state.lock();
    let task_id = state.next_task_id;
    state.next_task_id += 1;
    let scheduled_time = state.virtual_time + due;
    state.task_queue.push(ScheduledTask {
      scheduled_time,
      task_id,
      task: QueuedTask::new(task, cancellation),
    });
  }
}
