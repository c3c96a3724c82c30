use std::{
  sync::Arc,
  thread,
  time::{Duration, Instant},
};

use futures::executor::ThreadPool;

use super::{QueuedTask, Scheduler, Task};
use crate::{cancellable::CancellationFlag, certificate::Ledger};

/// Runs tasks on a `futures` thread pool.
///
/// Delayed tasks park their pool thread until they are due.
#[derive(Clone)]
pub struct ThreadPoolScheduler {
  pool: ThreadPool,
  ledger: Arc<Ledger>,
  epoch: Instant,
}

impl ThreadPoolScheduler {
  pub fn new(ledger: Arc<Ledger>) -> std::io::Result<Self> {
    Ok(Self { pool: ThreadPool::new()?, ledger, epoch: Instant::now() })
  }
}

impl Scheduler for ThreadPoolScheduler {
  fn now(&self) -> Duration { self.epoch.elapsed() }

  fn ledger(&self) -> &Arc<Ledger> { &self.ledger }

  fn schedule_relative(&self, due: Duration, task: Task, cancellation: Option<CancellationFlag>) {
    let queued = QueuedTask::new(task, cancellation);
    let deadline = Instant::now() + due;
    self.pool.spawn_ok(async move {
      let now = Instant::now();
      if deadline > now {
        thread::sleep(deadline - now);
      }
      queued.run();
    });
  }
}

impl std::fmt::Debug for ThreadPoolScheduler {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ThreadPoolScheduler")
      .field("ledger", &self.ledger)
      .finish()
  }
}
