//! Scheduling contract consumed by the combinator core.
//!
//! A scheduler runs each task at most once, and never when its cancellation
//! flag was set before it started. The certificate a task returns when it runs
//! is redeemed by the scheduler. Scheduling creates no weight: a task that
//! finishes a producer returns the grant that producer held, taken from the
//! producer's own cell rather than owned by the closure, so a skipped task
//! loses nothing.
//!
//! | Scheduler | Time | Use |
//! |-----------|------|-----|
//! | [`Trampoline`] | wall clock | run-to-quiescence execution of nested continuations |
//! | [`TestScheduler`] | virtual | deterministic tests of timed sources |
//! | [`ThreadPoolScheduler`] | wall clock | `futures` thread pool (feature `futures-scheduler`) |
//! | [`TokioScheduler`] | wall clock | tokio runtime handle (feature `tokio-scheduler`) |

use std::{sync::Arc, time::Duration};

use tracing::{error, trace};

use crate::{
  cancellable::{Cancellable, CancellationFlag},
  certificate::{Certificate, Ledger},
  error::catch_execution,
};

mod test_scheduler;
#[cfg(feature = "futures-scheduler")]
mod thread_pool_scheduler;
#[cfg(feature = "tokio-scheduler")]
mod tokio_scheduler;
mod trampoline;

pub use test_scheduler::TestScheduler;
#[cfg(feature = "futures-scheduler")]
pub use thread_pool_scheduler::ThreadPoolScheduler;
#[cfg(feature = "tokio-scheduler")]
pub use tokio_scheduler::TokioScheduler;
pub use trampoline::Trampoline;

/// A unit of work, returning whatever weight it hands back.
pub type Task = Box<dyn FnOnce() -> Certificate + Send>;

pub trait Scheduler: Send + Sync {
  /// Time elapsed since the scheduler's epoch.
  fn now(&self) -> Duration;

  /// Ledger the certificates returned by tasks are redeemed in.
  fn ledger(&self) -> &Arc<Ledger>;

  /// Run `task` once `due` has elapsed.
  fn schedule_relative(&self, due: Duration, task: Task, cancellation: Option<CancellationFlag>);

  /// Run `task` as soon as possible.
  fn schedule(&self, task: Task, cancellation: Option<CancellationFlag>) {
    self.schedule_relative(Duration::ZERO, task, cancellation)
  }

  /// Run `task` once the scheduler's clock reaches `at`.
  fn schedule_absolute(&self, at: Duration, task: Task, cancellation: Option<CancellationFlag>) {
    let due = at.saturating_sub(self.now());
    self.schedule_relative(due, task, cancellation)
  }
}

pub type SchedulerRef = Arc<dyn Scheduler>;

// ============================================================================
// Queued task
// ============================================================================

/// A task waiting in a scheduler queue.
pub(crate) struct QueuedTask {
  task: Task,
  cancellation: Option<CancellationFlag>,
}

impl QueuedTask {
  pub(crate) fn new(task: Task, cancellation: Option<CancellationFlag>) -> Self {
    Self { task, cancellation }
  }

  pub(crate) fn is_cancelled(&self) -> bool {
    self
      .cancellation
      .as_ref()
      .is_some_and(|c| c.is_cancelled())
  }

  /// Invoke the task and redeem the certificate it hands back.
  ///
  /// Delivery paths turn downstream panics into `on_error` themselves; a
  /// panic that still reaches this point has nowhere to go and is logged.
  pub(crate) fn run(self) {
    if self.is_cancelled() {
      trace!("skipping cancelled task");
      return;
    }
    match catch_execution(self.task) {
      Ok(cert) => {
        cert.redeem();
      }
      Err(err) => error!(%err, "scheduled task panicked"),
    }
  }
}
