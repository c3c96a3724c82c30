//! Entry point: configuring and starting runs.
//!
//! A [`RunContext`] owns the trampoline, the execution scheduler and the
//! ledger shared by every subscription started through it.
//!
//! ```rust
//! use std::time::Duration;
//! use rxflow::prelude::*;
//!
//! let (ctx, scheduler) = RunContext::with_test_scheduler();
//! let rec = RecordingObserver::new(ctx.runtime()).into_ref();
//! let source = sources::timeline(vec![(Duration::from_millis(5), 1)], None);
//!
//! ctx.subscribe(&source, rec.clone()).detach();
//! scheduler.flush();
//!
//! assert_eq!(rec.values(), vec![1]);
//! assert!(ctx.ledger().is_balanced());
//! ```

use std::{fmt, sync::Arc};

use tracing::info_span;

use crate::{
  certificate::{Ledger, Weight},
  flowable::{subscribe_root, Flowable},
  observer::ObserverRef,
  scheduler::{Scheduler, SchedulerRef, TestScheduler, Trampoline},
  state::{Runtime, SubscriptionResult},
};

/// Options for a [`RunContext`].
#[derive(Clone, Default)]
pub struct RunConfig {
  /// Root weight of every subscription. Defaults to what discovery asks for.
  pub weight: Option<Weight>,
  /// Scheduler for timed work. Defaults to the trampoline.
  pub scheduler: Option<SchedulerRef>,
  /// Ledger to account in. Defaults to the scheduler's ledger, or a new one.
  pub ledger: Option<Arc<Ledger>>,
  /// Name recorded on the tracing span of each subscription.
  pub name: Option<&'static str>,
}

impl RunConfig {
  pub fn weight(mut self, weight: Weight) -> Self {
    self.weight = Some(weight);
    self
  }

  pub fn scheduler(mut self, scheduler: SchedulerRef) -> Self {
    self.scheduler = Some(scheduler);
    self
  }

  pub fn ledger(mut self, ledger: Arc<Ledger>) -> Self {
    self.ledger = Some(ledger);
    self
  }

  pub fn name(mut self, name: &'static str) -> Self {
    self.name = Some(name);
    self
  }
}

impl fmt::Debug for RunConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RunConfig")
      .field("weight", &self.weight)
      .field("scheduler", &self.scheduler.is_some())
      .field("name", &self.name)
      .finish()
  }
}

pub struct RunContext {
  runtime: Runtime,
  weight: Option<Weight>,
  name: &'static str,
}

impl RunContext {
  pub fn new(config: RunConfig) -> Self {
    let ledger = config
      .ledger
      .or_else(|| config.scheduler.as_ref().map(|s| s.ledger().clone()))
      .unwrap_or_else(Ledger::new);
    let trampoline = Trampoline::new(ledger);
    let scheduler: SchedulerRef = match config.scheduler {
      Some(scheduler) => scheduler,
      None => trampoline.clone(),
    };
    Self {
      runtime: Runtime::new(trampoline, scheduler),
      weight: config.weight,
      name: config.name.unwrap_or("run"),
    }
  }

  /// A context whose timed work runs on a fresh virtual-time scheduler.
  pub fn with_test_scheduler() -> (Self, TestScheduler) {
    let scheduler = TestScheduler::new();
    let ctx = Self::new(RunConfig::default().scheduler(Arc::new(scheduler.clone())));
    (ctx, scheduler)
  }

  pub fn runtime(&self) -> &Runtime { &self.runtime }

  pub fn ledger(&self) -> &Arc<Ledger> { self.runtime.ledger() }

  /// Subscribe `observer` to `flowable`.
  ///
  /// Subscribing runs as one trampoline turn: nothing is emitted before every
  /// node of the tree is wired, so shared nodes see all their subscribers
  /// before their first value.
  pub fn subscribe<V>(
    &self, flowable: &Flowable<V>, observer: ObserverRef<V>,
  ) -> SubscriptionResult {
    let span = info_span!("subscribe", run = self.name, node = ?flowable.id());
    let _guard = span.enter();
    self
      .runtime
      .trampoline()
      .hold(|| subscribe_root(&self.runtime, flowable, observer, self.weight))
  }
}

impl fmt::Debug for RunContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RunContext")
      .field("name", &self.name)
      .field("ledger", self.ledger())
      .finish()
  }
}
