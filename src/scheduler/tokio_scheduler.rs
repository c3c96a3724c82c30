use std::{
  sync::Arc,
  time::{Duration, Instant},
};

use tokio::runtime::Handle;

use super::{QueuedTask, Scheduler, Task};
use crate::{cancellable::CancellationFlag, certificate::Ledger};

/// Runs tasks on a tokio runtime; delays use `tokio::time::sleep`.
#[derive(Clone)]
pub struct TokioScheduler {
  handle: Handle,
  ledger: Arc<Ledger>,
  epoch: Instant,
}

impl TokioScheduler {
  pub fn new(handle: Handle, ledger: Arc<Ledger>) -> Self {
    Self { handle, ledger, epoch: Instant::now() }
  }

  /// Scheduler bound to the runtime the caller is running in.
  ///
  /// # Panics
  ///
  /// Panics when called outside a tokio runtime.
  pub fn current(ledger: Arc<Ledger>) -> Self { Self::new(Handle::current(), ledger) }
}

impl Scheduler for TokioScheduler {
  fn now(&self) -> Duration { self.epoch.elapsed() }

  fn ledger(&self) -> &Arc<Ledger> { &self.ledger }

  fn schedule_relative(&self, due: Duration, task: Task, cancellation: Option<CancellationFlag>) {
    let queued = QueuedTask::new(task, cancellation);
    self.handle.spawn(async move {
      if !due.is_zero() {
        tokio::time::sleep(due).await;
      }
      queued.run();
    });
  }
}
