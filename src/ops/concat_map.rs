//! Sequential flattening.
//!
//! The outer value's ack is held until the inner flowable it mapped to has
//! completed, so at most one inner stream is subscribed at any time and inner
//! streams never overlap. The operator keeps one unit of its grant for itself;
//! inner streams are subscribed with an empty grant.

use std::{fmt, panic::Location, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
  ack::{Ack, AckResolver, Signal},
  cancellable::{Cancellable, CancellableRef},
  certificate::{keep_one, Certificate, Weight},
  error::{catch_execution, catch_operator, FlowError},
  flowable::{subscribe_inner, Flowable, FlowableNode},
  observer::{deliver_terminal, fail_observer, Observer, ObserverRef},
  ops::Teardown,
  scheduler::Scheduler,
  state::{Runtime, State, SubscribeArgs, SubscriptionResult},
};

type Selector<V, U> = Arc<dyn Fn(V) -> Flowable<U> + Send + Sync>;

pub struct ConcatMapNode<V, U> {
  source: Flowable<V>,
  f: Selector<V, U>,
  location: &'static Location<'static>,
}

impl<V, U> ConcatMapNode<V, U> {
  pub fn new<F>(source: Flowable<V>, f: F, location: &'static Location<'static>) -> Self
  where
    F: Fn(V) -> Flowable<U> + Send + Sync + 'static,
  {
    Self { source, f: Arc::new(f), location }
  }
}

impl<V: Send + 'static, U: Send + 'static> FlowableNode<U> for ConcatMapNode<V, U> {
  fn discover(&self, state: &mut State) -> Weight { self.source.discover(state) + 1 }

  fn assign_weight(&self, state: &mut State, weight: Weight) {
    self.source.assign_weight(state, weight - weight.min(1))
  }

  fn subscribe(&self, state: State, args: SubscribeArgs<U>) -> (State, SubscriptionResult) {
    let (own, rest) = keep_one(args.grant);
    let core = Arc::new(ConcatCore {
      runtime: state.runtime().clone(),
      downstream: args.observer,
      memory: Mutex::new(ConcatMemory {
        phase: Phase::Active,
        outer_done: false,
        outer_resolver: None,
        inner: None,
        next_id: 0,
        upstream: None,
        own: Some(own),
      }),
    });
    let outer = ConcatOuter { core: core.clone(), f: self.f.clone(), location: self.location };
    let (state, result) = self
      .source
      .subscribe(state, SubscribeArgs::new(Arc::new(outer), rest));
    core.set_upstream(result.cancellable);
    (state, SubscriptionResult::new(result.certificate, core))
  }
}

// ==================== Shared State ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
  Active,
  Completed,
  Errored,
  Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
  Outer,
  Inner,
}

struct InnerSlot {
  id: u64,
  cancellable: Option<CancellableRef>,
}

struct ConcatMemory {
  phase: Phase,
  outer_done: bool,
  // held until the running inner completes
  outer_resolver: Option<AckResolver>,
  inner: Option<InnerSlot>,
  next_id: u64,
  upstream: Option<CancellableRef>,
  own: Option<Certificate>,
}

impl ConcatMemory {
  fn is_current(&self, id: u64) -> bool {
    self.phase == Phase::Active && self.inner.as_ref().is_some_and(|inner| inner.id == id)
  }

  fn take_own(&mut self) -> Certificate { self.own.take().unwrap_or_default() }

  fn terminate(&mut self, phase: Phase, origin: Option<Origin>) -> Teardown {
    self.phase = phase;
    let inner = self.inner.take().and_then(|inner| inner.cancellable);
    let upstream = self.upstream.take();
    let mut cancellables = Vec::with_capacity(2);
    if origin != Some(Origin::Inner) {
      cancellables.extend(inner);
    }
    if origin != Some(Origin::Outer) {
      cancellables.extend(upstream);
    }
    Teardown { resolvers: self.outer_resolver.take().into_iter().collect(), cancellables }
  }
}

struct ConcatCore<U> {
  runtime: Runtime,
  downstream: ObserverRef<U>,
  memory: Mutex<ConcatMemory>,
}

impl<U: Send + 'static> ConcatCore<U> {
  fn set_upstream(&self, cancellable: CancellableRef) {
    let mut memory = self.memory.lock();
    if memory.phase == Phase::Active && !memory.outer_done {
      memory.upstream = Some(cancellable);
      return;
    }
    let stale = memory.phase == Phase::Errored || memory.phase == Phase::Cancelled;
    drop(memory);
    if stale {
      cancellable.cancel().redeem();
    }
  }

  /// Subscribe the inner flowable of the next outer value.
  fn start_inner(self: &Arc<Self>, inner: Flowable<U>, resolver: Option<AckResolver>) -> bool {
    let mut memory = self.memory.lock();
    if memory.phase != Phase::Active {
      drop(memory);
      if let Some(resolver) = resolver {
        resolver.resolve(Signal::Stop);
      }
      return false;
    }
    let id = memory.next_id;
    memory.next_id += 1;
    memory.inner = Some(InnerSlot { id, cancellable: None });
    memory.outer_resolver = resolver;
    if memory.outer_done {
      memory.upstream = None;
    }
    drop(memory);

    trace!(inner = id, "concat_map inner started");
    let observer = Arc::new(ConcatInner { core: self.clone(), id });
    let result = self
      .runtime
      .trampoline()
      .hold(|| subscribe_inner(&self.runtime, &inner, observer, Certificate::empty()));
    let cancellable = result.detach();

    let mut memory = self.memory.lock();
    if memory.is_current(id) {
      if let Some(slot) = memory.inner.as_mut() {
        slot.cancellable = Some(cancellable);
      }
      return true;
    }
    let stale = memory.phase == Phase::Errored || memory.phase == Phase::Cancelled;
    drop(memory);
    if stale {
      cancellable.cancel().redeem();
    }
    true
  }

  fn outer_completed(&self) -> Certificate {
    let mut memory = self.memory.lock();
    if memory.phase != Phase::Active {
      return Certificate::empty();
    }
    memory.outer_done = true;
    memory.upstream = None;
    if memory.inner.is_some() {
      return Certificate::empty();
    }
    memory.phase = Phase::Completed;
    let own = memory.take_own();
    drop(memory);
    debug!("concat_map completed with the outer");
    deliver_terminal(&self.downstream, |o| o.on_completed()).merge(own)
  }

  /// The current inner completed. Completes downstream if the outer is done,
  /// otherwise lets the outer send its next value.
  fn inner_finished(&self, id: u64) -> Certificate {
    let mut memory = self.memory.lock();
    if !memory.is_current(id) {
      return Certificate::empty();
    }
    memory.inner = None;
    if memory.outer_done {
      memory.phase = Phase::Completed;
      let own = memory.take_own();
      drop(memory);
      debug!(inner = id, "concat_map completed with its last inner");
      return deliver_terminal(&self.downstream, |o| o.on_completed()).merge(own);
    }
    let resolver = memory.outer_resolver.take();
    drop(memory);
    trace!(inner = id, "concat_map inner completed");
    if let Some(resolver) = resolver {
      resolver.resolve(Signal::Continue);
    }
    Certificate::empty()
  }

  /// Send `value` downstream, `None` if downstream panicked receiving it.
  fn send(&self, value: U) -> Option<Ack> {
    let downstream = self.downstream.clone();
    match catch_execution(|| downstream.on_next(value)) {
      Ok(ack) => Some(ack),
      Err(err) => {
        self.downstream_panicked(err).redeem();
        None
      }
    }
  }

  fn inner_next(self: &Arc<Self>, id: u64, value: U) -> Ack {
    if !self.memory.lock().is_current(id) {
      return Ack::stop();
    }
    let Some(sent) = self.send(value) else {
      return Ack::stop();
    };
    let (ack, resolver) = Ack::pending(self.runtime.trampoline());
    let core = self.clone();
    sent.then(self.runtime.trampoline(), move |signal| {
      if signal == Signal::Stop {
        resolver.resolve(Signal::Stop);
        return core.stop();
      }
      // a value acknowledged after the operator terminated must not restart
      // its inner
      let current = core.memory.lock().is_current(id);
      resolver.resolve(if current { Signal::Continue } else { Signal::Stop });
      Certificate::empty()
    });
    ack
  }

  fn inner_next_and_complete(self: &Arc<Self>, id: u64, value: U) -> Certificate {
    let mut memory = self.memory.lock();
    if !memory.is_current(id) {
      return Certificate::empty();
    }
    if memory.outer_done {
      memory.inner = None;
      memory.phase = Phase::Completed;
      let own = memory.take_own();
      drop(memory);
      debug!(inner = id, "concat_map completed with fused value");
      return deliver_terminal(&self.downstream, |o| o.on_next_and_complete(value)).merge(own);
    }
    drop(memory);
    if let Some(sent) = self.send(value) {
      let core = self.clone();
      sent.then(self.runtime.trampoline(), move |signal| match signal {
        Signal::Continue => core.inner_finished(id),
        Signal::Stop => core.stop(),
      });
    }
    Certificate::empty()
  }

  fn fail(&self, origin: Origin, err: FlowError) -> Certificate {
    let mut memory = self.memory.lock();
    if memory.phase != Phase::Active {
      return Certificate::empty();
    }
    let teardown = memory.terminate(Phase::Errored, Some(origin));
    let own = memory.take_own();
    drop(memory);
    debug!(?origin, %err, "concat_map failed");
    let released = teardown.run();
    deliver_terminal(&self.downstream, |o| o.on_error(err))
      .merge(released)
      .merge(own)
  }

  fn inner_error(&self, id: u64, err: FlowError) -> Certificate {
    if !self.memory.lock().is_current(id) {
      return Certificate::empty();
    }
    self.fail(Origin::Inner, err)
  }

  fn downstream_panicked(&self, err: FlowError) -> Certificate {
    let mut memory = self.memory.lock();
    if memory.phase != Phase::Active {
      return Certificate::empty();
    }
    let teardown = memory.terminate(Phase::Errored, None);
    let own = memory.take_own();
    drop(memory);
    warn!(%err, "concat_map downstream panicked");
    let released = teardown.run();
    fail_observer(&self.downstream, err).merge(released).merge(own)
  }

  /// Downstream asked to stop, or the subscription was cancelled.
  fn stop(&self) -> Certificate {
    let mut memory = self.memory.lock();
    if memory.phase != Phase::Active {
      return Certificate::empty();
    }
    let teardown = memory.terminate(Phase::Cancelled, None);
    let own = memory.take_own();
    drop(memory);
    debug!("concat_map stopped");
    own.merge(teardown.run())
  }
}

impl<U: Send + 'static> Cancellable for ConcatCore<U> {
  fn cancel(&self) -> Certificate { self.stop() }

  fn is_cancelled(&self) -> bool { self.memory.lock().phase == Phase::Cancelled }
}

impl<U> fmt::Debug for ConcatCore<U> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let memory = self.memory.lock();
    f.debug_struct("ConcatCore")
      .field("phase", &memory.phase)
      .field("outer_done", &memory.outer_done)
      .field("inner", &memory.inner.as_ref().map(|inner| inner.id))
      .finish()
  }
}

// ==================== Observers ====================

struct ConcatOuter<V, U> {
  core: Arc<ConcatCore<U>>,
  f: Selector<V, U>,
  location: &'static Location<'static>,
}

impl<V, U: Send + 'static> ConcatOuter<V, U> {
  fn select(&self, value: V) -> Option<Flowable<U>> {
    match catch_operator("concat_map", self.location, || (self.f)(value)) {
      Ok(inner) => Some(inner),
      Err(err) => {
        self.core.fail(Origin::Outer, err).redeem();
        None
      }
    }
  }
}

impl<V: Send, U: Send + 'static> Observer<V> for ConcatOuter<V, U> {
  fn on_next(&self, value: V) -> Ack {
    let Some(inner) = self.select(value) else {
      return Ack::stop();
    };
    let (ack, resolver) = Ack::pending(self.core.runtime.trampoline());
    if !self.core.start_inner(inner, Some(resolver)) {
      return Ack::stop();
    }
    ack
  }

  fn on_next_and_complete(&self, value: V) -> Certificate {
    let Some(inner) = self.select(value) else {
      return Certificate::empty();
    };
    self.core.memory.lock().outer_done = true;
    self.core.start_inner(inner, None);
    Certificate::empty()
  }

  fn on_completed(&self) -> Certificate { self.core.outer_completed() }

  fn on_error(&self, err: FlowError) -> Certificate { self.core.fail(Origin::Outer, err) }
}

struct ConcatInner<U> {
  core: Arc<ConcatCore<U>>,
  id: u64,
}

impl<U: Send + 'static> Observer<U> for ConcatInner<U> {
  fn on_next(&self, value: U) -> Ack { self.core.inner_next(self.id, value) }

  fn on_next_and_complete(&self, value: U) -> Certificate {
    self.core.inner_next_and_complete(self.id, value)
  }

  fn on_completed(&self) -> Certificate { self.core.inner_finished(self.id) }

  fn on_error(&self, err: FlowError) -> Certificate { self.core.inner_error(self.id, err) }
}
