//! Leaf flowables.
//!
//! Every source emits from scheduled tasks, never from inside `subscribe`, and
//! waits for each ack before producing the next value. The last value is sent
//! fused with completion whenever the source knows it is the last one.
//!
//! A source keeps its grant in its [`CancellationFlag`] and takes it out
//! exactly once: into its terminal answer, into the answer to a `Stop`, or
//! into the answer to `cancel`.

use std::{iter::Peekable, sync::Arc, time::Duration};

use crate::{
  ack::Signal,
  cancellable::{Cancellable, CancellationFlag},
  certificate::{Certificate, Weight},
  error::{catch_execution, FlowError},
  flowable::{Flowable, FlowableNode},
  observer::{deliver_terminal, fail_observer, ObserverRef},
  scheduler::Scheduler,
  state::{Runtime, State, SubscribeArgs, SubscriptionResult},
};

type IterFactory<V> = Arc<dyn Fn() -> Box<dyn Iterator<Item = V> + Send> + Send + Sync>;

// ============================================================================
// from_iter / of / empty
// ============================================================================

struct IterNode<V> {
  make: IterFactory<V>,
}

/// Emit every item of `iter`, once per subscription.
pub fn from_iter<I>(iter: I) -> Flowable<I::Item>
where
  I: IntoIterator + Clone + Send + Sync + 'static,
  I::Item: Send + 'static,
  I::IntoIter: Send + 'static,
{
  Flowable::new(IterNode {
    make: Arc::new(move || {
      Box::new(iter.clone().into_iter()) as Box<dyn Iterator<Item = I::Item> + Send>
    }),
  })
}

pub fn of<V>(values: Vec<V>) -> Flowable<V>
where
  V: Clone + Send + Sync + 'static,
{
  from_iter(values)
}

/// Complete without emitting.
pub fn empty<V: Send + 'static>() -> Flowable<V> { from_iter(std::iter::empty::<V>()) }

impl<V: Send + 'static> FlowableNode<V> for IterNode<V> {
  fn discover(&self, _: &mut State) -> Weight { 1 }

  fn assign_weight(&self, _: &mut State, _: Weight) {}

  fn subscribe(&self, state: State, args: SubscribeArgs<V>) -> (State, SubscriptionResult) {
    let runtime = state.runtime().clone();
    let flag = CancellationFlag::new(args.grant);
    let emitter = IterEmitter {
      iter: (self.make)().peekable(),
      observer: args.observer,
      flag: flag.clone(),
      runtime: runtime.clone(),
    };
    runtime
      .trampoline()
      .schedule(Box::new(move || emitter.step()), Some(flag.clone()));
    (state, SubscriptionResult::new(Certificate::empty(), Arc::new(flag)))
  }
}

struct IterEmitter<V> {
  iter: Peekable<Box<dyn Iterator<Item = V> + Send>>,
  observer: ObserverRef<V>,
  flag: CancellationFlag,
  runtime: Runtime,
}

impl<V: Send + 'static> IterEmitter<V> {
  fn step(mut self) -> Certificate {
    if self.flag.is_cancelled() {
      return self.flag.release();
    }
    let iter = &mut self.iter;
    let pulled = catch_execution(|| {
      let value = iter.next();
      (value, iter.peek().is_none())
    });
    match pulled {
      Err(err) => finish(&self.observer, &self.flag, |o| o.on_error(err)),
      Ok((None, _)) => finish(&self.observer, &self.flag, |o| o.on_completed()),
      Ok((Some(value), true)) => {
        finish(&self.observer, &self.flag, |o| o.on_next_and_complete(value))
      }
      Ok((Some(value), false)) => {
        let observer = self.observer.clone();
        match catch_execution(|| observer.on_next(value)) {
          Err(err) => fail_observer(&self.observer, err).merge(self.flag.release()),
          Ok(ack) => {
            let trampoline = self.runtime.trampoline().clone();
            ack.then(&trampoline, move |signal| match signal {
              Signal::Continue => self.step(),
              Signal::Stop => self.flag.release(),
            });
            Certificate::empty()
          }
        }
      }
    }
  }
}

/// Make the source's terminal call and hand back the grant with its answer.
fn finish<V>(
  observer: &ObserverRef<V>, flag: &CancellationFlag,
  call: impl FnOnce(&ObserverRef<V>) -> Certificate,
) -> Certificate {
  deliver_terminal(observer, call).merge(flag.release())
}

// ============================================================================
// throw / never
// ============================================================================

struct ThrowNode {
  err: FlowError,
}

/// Fail with `err` without emitting.
pub fn throw<V: Send + 'static>(err: FlowError) -> Flowable<V> {
  Flowable::new(ThrowNode { err })
}

impl<V: Send + 'static> FlowableNode<V> for ThrowNode {
  fn discover(&self, _: &mut State) -> Weight { 1 }

  fn assign_weight(&self, _: &mut State, _: Weight) {}

  fn subscribe(&self, state: State, args: SubscribeArgs<V>) -> (State, SubscriptionResult) {
    let flag = CancellationFlag::new(args.grant);
    let err = self.err.clone();
    let (observer, held) = (args.observer, flag.clone());
    state.runtime().trampoline().schedule(
      Box::new(move || finish(&observer, &held, |o| o.on_error(err))),
      Some(flag.clone()),
    );
    (state, SubscriptionResult::new(Certificate::empty(), Arc::new(flag)))
  }
}

struct NeverNode;

/// Never emit and never terminate.
pub fn never<V: Send + 'static>() -> Flowable<V> { Flowable::new(NeverNode) }

impl<V: Send + 'static> FlowableNode<V> for NeverNode {
  fn discover(&self, _: &mut State) -> Weight { 1 }

  fn assign_weight(&self, _: &mut State, _: Weight) {}

  fn subscribe(&self, state: State, args: SubscribeArgs<V>) -> (State, SubscriptionResult) {
    let flag = CancellationFlag::new(args.grant);
    (state, SubscriptionResult::new(Certificate::empty(), Arc::new(flag)))
  }
}

// ============================================================================
// timeline
// ============================================================================

struct TimelineNode<V> {
  items: Arc<Vec<(Duration, V)>>,
  complete_at: Option<Duration>,
}

/// Emit each value at its absolute time on the runtime's scheduler.
///
/// A value whose ack arrives late is sent as soon as the ack resolves. With
/// `complete_at` unset, the last value is fused with completion; otherwise
/// completion is sent at `complete_at`, or after the last ack if that is
/// later.
pub fn timeline<V>(items: Vec<(Duration, V)>, complete_at: Option<Duration>) -> Flowable<V>
where
  V: Clone + Send + Sync + 'static,
{
  Flowable::new(TimelineNode { items: Arc::new(items), complete_at })
}

impl<V: Clone + Send + Sync + 'static> FlowableNode<V> for TimelineNode<V> {
  fn discover(&self, _: &mut State) -> Weight { 1 }

  fn assign_weight(&self, _: &mut State, _: Weight) {}

  fn subscribe(&self, state: State, args: SubscribeArgs<V>) -> (State, SubscriptionResult) {
    let flag = CancellationFlag::new(args.grant);
    let emitter = TimelineEmitter {
      items: self.items.clone(),
      next: 0,
      complete_at: self.complete_at,
      observer: args.observer,
      flag: flag.clone(),
      runtime: state.runtime().clone(),
    };
    emitter.schedule_next();
    (state, SubscriptionResult::new(Certificate::empty(), Arc::new(flag)))
  }
}

struct TimelineEmitter<V> {
  items: Arc<Vec<(Duration, V)>>,
  next: usize,
  complete_at: Option<Duration>,
  observer: ObserverRef<V>,
  flag: CancellationFlag,
  runtime: Runtime,
}

impl<V: Clone + Send + Sync + 'static> TimelineEmitter<V> {
  fn schedule_next(self) {
    let at = match self.items.get(self.next) {
      Some((at, _)) => *at,
      None => self.complete_at.unwrap_or_default(),
    };
    let scheduler = self.runtime.scheduler().clone();
    let flag = self.flag.clone();
    scheduler.schedule_absolute(at, Box::new(move || self.step()), Some(flag))
  }

  fn step(mut self) -> Certificate {
    if self.flag.is_cancelled() {
      return self.flag.release();
    }
    let Some((_, value)) = self.items.get(self.next).cloned() else {
      return finish(&self.observer, &self.flag, |o| o.on_completed());
    };
    self.next += 1;
    let is_last = self.next == self.items.len();
    if is_last && self.complete_at.is_none() {
      return finish(&self.observer, &self.flag, |o| o.on_next_and_complete(value));
    }
    let observer = self.observer.clone();
    let ack = match catch_execution(|| observer.on_next(value)) {
      Ok(ack) => ack,
      Err(err) => return fail_observer(&self.observer, err).merge(self.flag.release()),
    };
    let trampoline = self.runtime.trampoline().clone();
    ack.then(&trampoline, move |signal| match signal {
      Signal::Continue => {
        self.schedule_next();
        Certificate::empty()
      }
      Signal::Stop => self.flag.release(),
    });
    Certificate::empty()
  }
}
