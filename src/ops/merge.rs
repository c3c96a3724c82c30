//! Fan-in in first-arrival order.
//!
//! Values from all children are forwarded one at a time. A value arriving
//! while another is still waiting for its downstream ack is queued, and its
//! child is acknowledged only once the value was forwarded and acknowledged in
//! turn. Completion is deferred until every child completed; the first error
//! wins and stops every other child.
//!
//! [`MergeCore`] is also the engine behind `flat_map`, where children are
//! added while the outer source is still running. Children leave the registry
//! as soon as they finish, so a long-running flattening keeps only its live
//! inner streams.

use std::{
  collections::{HashMap, VecDeque},
  fmt,
  sync::Arc,
};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::{
  ack::{Ack, AckResolver, Signal},
  cancellable::{Cancellable, CancellableRef},
  certificate::{split_weight, Certificate, Weight},
  error::{catch_execution, FlowError},
  flowable::{Flowable, FlowableNode},
  observer::{deliver_terminal, fail_observer, Observer, ObserverRef},
  ops::Teardown,
  scheduler::Scheduler,
  state::{Runtime, State, SubscribeArgs, SubscriptionResult},
};

// ============================================================================
// MergeNode
// ============================================================================

pub struct MergeNode<V> {
  sources: Vec<Flowable<V>>,
}

impl<V> MergeNode<V> {
  pub fn new(sources: Vec<Flowable<V>>) -> Self { Self { sources } }
}

impl<V: Send + 'static> FlowableNode<V> for MergeNode<V> {
  fn discover(&self, state: &mut State) -> Weight {
    let demand: Weight = self.sources.iter().map(|s| s.discover(state)).sum();
    demand.max(1)
  }

  fn assign_weight(&self, state: &mut State, weight: Weight) {
    let parts = split_weight(weight, self.sources.len());
    for (source, part) in self.sources.iter().zip(parts) {
      source.assign_weight(state, part);
    }
  }

  fn subscribe(&self, mut state: State, args: SubscribeArgs<V>) -> (State, SubscriptionResult) {
    let runtime = state.runtime().clone();
    if self.sources.is_empty() {
      // nothing to wait for; the merge itself holds the grant until it completes
      let core = MergeCore::new(runtime.clone(), args.observer, args.grant);
      let sealing = core.clone();
      runtime
        .trampoline()
        .schedule(Box::new(move || sealing.seal().unwrap_or_default()), None);
      return (state, SubscriptionResult::new(Certificate::empty(), core));
    }

    let parts = split_weight(args.weight(), self.sources.len());
    let grants = args.grant.split_into(&parts);
    let core = MergeCore::new(runtime, args.observer, Certificate::empty());
    let mut certs: SmallVec<[Certificate; 4]> = SmallVec::new();
    for (source, grant) in self.sources.iter().zip(grants) {
      let Some(id) = core.add_child() else {
        certs.push(grant);
        continue;
      };
      let child = Arc::new(MergeChild { core: core.clone(), id });
      let (next, result) = source.subscribe(state, SubscribeArgs::new(child, grant));
      state = next;
      core.set_child_cancellable(id, result.cancellable);
      certs.push(result.certificate);
    }
    certs.extend(core.seal());
    let certificate = Certificate::merge_all(certs).unwrap_or_default();
    (state, SubscriptionResult::new(certificate, core))
  }
}

// ============================================================================
// MergeCore
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
  Active,
  Completed,
  Errored,
  Cancelled,
}

/// Where an error came from, so it is not cancelled back into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
  Child(usize),
  Upstream,
}

struct Queued<V> {
  child: usize,
  value: V,
  // `None` when the child sent this value fused with its completion.
  resolver: Option<AckResolver>,
}

struct MergeMemory<V> {
  phase: Phase,
  in_flight: bool,
  waiting: VecDeque<Queued<V>>,
  /// Live children by id; `None` until the child's subscription is wired.
  children: HashMap<usize, Option<CancellableRef>>,
  next_id: usize,
  sealed: bool,
  upstream: Option<CancellableRef>,
  /// Weight the merge holds itself, released with its final call.
  own: Option<Certificate>,
}

impl<V> MergeMemory<V> {
  fn completion_ready(&self) -> bool {
    self.phase == Phase::Active
      && self.sealed
      && self.children.is_empty()
      && !self.in_flight
      && self.waiting.is_empty()
  }

  /// Would the merge be complete once the value just popped was delivered?
  fn completion_ready_after_release(&self) -> bool {
    self.phase == Phase::Active
      && self.sealed
      && self.children.is_empty()
      && self.waiting.is_empty()
  }

  fn take_own(&mut self) -> Certificate { self.own.take().unwrap_or_default() }

  /// Leave the active phase, handing back every queued resolver and every
  /// cancellable still worth cancelling.
  fn terminate(&mut self, phase: Phase, origin: Option<Origin>) -> Teardown {
    self.phase = phase;
    let resolvers = self
      .waiting
      .drain(..)
      .filter_map(|queued| queued.resolver)
      .collect();
    let mut cancellables: Vec<CancellableRef> = self
      .children
      .drain()
      .filter_map(|(_, cancellable)| cancellable)
      .collect();
    let upstream = self.upstream.take();
    if origin != Some(Origin::Upstream) {
      cancellables.extend(upstream);
    }
    Teardown { resolvers, cancellables }
  }
}

pub(crate) struct MergeCore<V> {
  runtime: Runtime,
  downstream: ObserverRef<V>,
  memory: Mutex<MergeMemory<V>>,
}

impl<V: Send + 'static> MergeCore<V> {
  /// `own` is the weight the merge keeps for itself: everything its children
  /// do not hold.
  pub(crate) fn new(runtime: Runtime, downstream: ObserverRef<V>, own: Certificate) -> Arc<Self> {
    Arc::new(Self {
      runtime,
      downstream,
      memory: Mutex::new(MergeMemory {
        phase: Phase::Active,
        in_flight: false,
        waiting: VecDeque::new(),
        children: HashMap::new(),
        next_id: 0,
        sealed: false,
        upstream: None,
        own: Some(own),
      }),
    })
  }

  pub(crate) fn runtime(&self) -> &Runtime { &self.runtime }

  pub(crate) fn is_terminated(&self) -> bool { self.memory.lock().phase != Phase::Active }

  /// Children registered and not finished yet.
  pub(crate) fn live_children(&self) -> usize { self.memory.lock().children.len() }

  /// Register one more child, `None` once the merge terminated.
  pub(crate) fn add_child(&self) -> Option<usize> {
    let mut memory = self.memory.lock();
    if memory.phase != Phase::Active {
      return None;
    }
    let id = memory.next_id;
    memory.next_id += 1;
    memory.children.insert(id, None);
    Some(id)
  }

  pub(crate) fn set_child_cancellable(&self, id: usize, cancellable: CancellableRef) {
    let mut memory = self.memory.lock();
    if let Some(slot) = memory.children.get_mut(&id) {
      *slot = Some(cancellable);
      return;
    }
    // Either finished already, or torn down before it was wired.
    let torn_down = memory.phase == Phase::Errored || memory.phase == Phase::Cancelled;
    drop(memory);
    if torn_down {
      cancellable.cancel().redeem();
    }
  }

  /// Keep the outer subscription of a flattening operator, cancelled with the
  /// children.
  pub(crate) fn set_upstream(&self, cancellable: CancellableRef) {
    let mut memory = self.memory.lock();
    if memory.phase == Phase::Active {
      memory.upstream = Some(cancellable);
      return;
    }
    drop(memory);
    cancellable.cancel().redeem();
  }

  /// No more children will be added. Returns the answer of the downstream
  /// completion if that completed the merge.
  pub(crate) fn seal(&self) -> Option<Certificate> {
    let mut memory = self.memory.lock();
    memory.sealed = true;
    memory.upstream = None;
    if !memory.completion_ready() {
      return None;
    }
    memory.phase = Phase::Completed;
    let own = memory.take_own();
    drop(memory);
    debug!("merge completed on seal");
    Some(deliver_terminal(&self.downstream, |o| o.on_completed()).merge(own))
  }

  fn child_next(self: &Arc<Self>, id: usize, value: V) -> Ack {
    let mut memory = self.memory.lock();
    if memory.phase != Phase::Active || !memory.children.contains_key(&id) {
      return Ack::stop();
    }
    let (ack, resolver) = Ack::pending(self.runtime.trampoline());
    if memory.in_flight {
      trace!(child = id, queued = memory.waiting.len() + 1, "merge queued value");
      memory
        .waiting
        .push_back(Queued { child: id, value, resolver: Some(resolver) });
      return ack;
    }
    memory.in_flight = true;
    drop(memory);
    self.forward(value, Some(resolver)).redeem();
    ack
  }

  fn child_next_and_complete(self: &Arc<Self>, id: usize, value: V) -> Certificate {
    let mut memory = self.memory.lock();
    if memory.phase != Phase::Active || memory.children.remove(&id).is_none() {
      return Certificate::empty();
    }
    if memory.in_flight {
      memory.waiting.push_back(Queued { child: id, value, resolver: None });
      return Certificate::empty();
    }
    memory.in_flight = true;
    let last = memory.sealed && memory.children.is_empty();
    if !last {
      drop(memory);
      return self.forward(value, None);
    }
    memory.phase = Phase::Completed;
    let own = memory.take_own();
    drop(memory);
    debug!(child = id, "merge completed with fused value");
    deliver_terminal(&self.downstream, |o| o.on_next_and_complete(value)).merge(own)
  }

  fn child_completed(&self, id: usize) -> Certificate {
    let mut memory = self.memory.lock();
    if memory.phase != Phase::Active || memory.children.remove(&id).is_none() {
      return Certificate::empty();
    }
    trace!(child = id, live = memory.children.len(), "merge child completed");
    if !memory.completion_ready() {
      return Certificate::empty();
    }
    memory.phase = Phase::Completed;
    let own = memory.take_own();
    drop(memory);
    debug!("merge completed");
    deliver_terminal(&self.downstream, |o| o.on_completed()).merge(own)
  }

  /// Forward `err` downstream unless the merge already terminated, stopping
  /// everything else.
  pub(crate) fn fail(&self, origin: Origin, err: FlowError) -> Certificate {
    let mut memory = self.memory.lock();
    if memory.phase != Phase::Active {
      return Certificate::empty();
    }
    if let Origin::Child(id) = origin {
      memory.children.remove(&id);
    }
    let teardown = memory.terminate(Phase::Errored, Some(origin));
    let own = memory.take_own();
    drop(memory);
    debug!(?origin, %err, "merge failed");
    let released = teardown.run();
    deliver_terminal(&self.downstream, |o| o.on_error(err))
      .merge(released)
      .merge(own)
  }

  fn forward(self: &Arc<Self>, value: V, resolver: Option<AckResolver>) -> Certificate {
    let downstream = self.downstream.clone();
    match catch_execution(|| downstream.on_next(value)) {
      Ok(ack) => {
        let core = self.clone();
        ack.then(self.runtime.trampoline(), move |signal| core.acknowledged(signal, resolver));
        Certificate::empty()
      }
      Err(err) => self.downstream_panicked(err, resolver),
    }
  }

  /// Downstream panicked in `on_next`: report it as the merge's error.
  fn downstream_panicked(&self, err: FlowError, resolver: Option<AckResolver>) -> Certificate {
    let mut memory = self.memory.lock();
    memory.in_flight = false;
    if memory.phase != Phase::Active {
      drop(memory);
      if let Some(resolver) = resolver {
        resolver.resolve(Signal::Stop);
      }
      return Certificate::empty();
    }
    let mut teardown = memory.terminate(Phase::Errored, None);
    teardown.resolvers.extend(resolver);
    let own = memory.take_own();
    drop(memory);
    warn!(%err, "merge downstream panicked");
    let released = teardown.run();
    fail_observer(&self.downstream, err).merge(released).merge(own)
  }

  /// Downstream acknowledged the value in flight.
  fn acknowledged(self: &Arc<Self>, signal: Signal, resolver: Option<AckResolver>) -> Certificate {
    let mut memory = self.memory.lock();
    memory.in_flight = false;
    if memory.phase != Phase::Active {
      // terminated while the value was in flight: its child must not go on
      drop(memory);
      if let Some(resolver) = resolver {
        resolver.resolve(Signal::Stop);
      }
      return Certificate::empty();
    }
    if signal == Signal::Stop {
      let mut teardown = memory.terminate(Phase::Cancelled, None);
      teardown.resolvers.extend(resolver);
      let own = memory.take_own();
      drop(memory);
      debug!("merge stopped by downstream");
      return own.merge(teardown.run());
    }

    let Some(next) = memory.waiting.pop_front() else {
      let done = memory.completion_ready();
      let own = if done {
        memory.phase = Phase::Completed;
        memory.take_own()
      } else {
        Certificate::empty()
      };
      drop(memory);
      if let Some(resolver) = resolver {
        resolver.resolve(Signal::Continue);
      }
      if !done {
        return own;
      }
      debug!("merge completed after last ack");
      return deliver_terminal(&self.downstream, |o| o.on_completed()).merge(own);
    };
    memory.in_flight = true;
    let fuse = next.resolver.is_none() && memory.completion_ready_after_release();
    let own = if fuse {
      memory.phase = Phase::Completed;
      memory.take_own()
    } else {
      Certificate::empty()
    };
    drop(memory);
    if let Some(resolver) = resolver {
      resolver.resolve(Signal::Continue);
    }
    trace!(child = next.child, fuse, "merge released queued value");
    if fuse {
      let value = next.value;
      return deliver_terminal(&self.downstream, |o| o.on_next_and_complete(value)).merge(own);
    }
    self.forward(next.value, next.resolver)
  }
}

impl<V: Send + 'static> Cancellable for MergeCore<V> {
  fn cancel(&self) -> Certificate {
    let mut memory = self.memory.lock();
    if memory.phase != Phase::Active {
      return Certificate::empty();
    }
    let teardown = memory.terminate(Phase::Cancelled, None);
    let own = memory.take_own();
    drop(memory);
    debug!(own = own.weight(), "merge cancelled");
    own.merge(teardown.run())
  }

  fn is_cancelled(&self) -> bool { self.memory.lock().phase == Phase::Cancelled }
}

impl<V> fmt::Debug for MergeCore<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let memory = self.memory.lock();
    f.debug_struct("MergeCore")
      .field("phase", &memory.phase)
      .field("live", &memory.children.len())
      .field("waiting", &memory.waiting.len())
      .finish()
  }
}

// ============================================================================
// MergeChild
// ============================================================================

/// Observer handed to one child of a merge.
pub(crate) struct MergeChild<V> {
  pub(crate) core: Arc<MergeCore<V>>,
  pub(crate) id: usize,
}

impl<V: Send + 'static> Observer<V> for MergeChild<V> {
  fn on_next(&self, value: V) -> Ack { self.core.child_next(self.id, value) }

  fn on_next_and_complete(&self, value: V) -> Certificate {
    self.core.child_next_and_complete(self.id, value)
  }

  fn on_completed(&self) -> Certificate { self.core.child_completed(self.id) }

  fn on_error(&self, err: FlowError) -> Certificate { self.core.fail(Origin::Child(self.id), err) }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::{
    cancellable::CancellationFlag,
    context::{RunConfig, RunContext},
    flowable::merge_all,
    observer::{testing::Fragile, RecordingObserver},
    sources,
  };

  fn ms(n: u64) -> Duration { Duration::from_millis(n) }

  #[test]
  fn forwards_in_arrival_order() {
    let (ctx, scheduler) = RunContext::with_test_scheduler();
    let rec = RecordingObserver::new(ctx.runtime()).into_ref();
    let a = sources::timeline(vec![(ms(1), 'a'), (ms(4), 'c')], None);
    let b = sources::timeline(vec![(ms(2), 'b'), (ms(3), 'x')], None);
    ctx.subscribe(&a.merge(b), rec.clone()).detach();
    scheduler.flush();

    assert_eq!(rec.values(), vec!['a', 'b', 'x', 'c']);
    assert_eq!(rec.completed_at(), Some(ms(4)));
    assert_eq!(rec.terminal_count(), 1);
    assert!(rec.violations().is_empty());
    assert!(ctx.ledger().is_balanced());
  }

  #[test]
  fn queues_while_downstream_is_busy() {
    let (ctx, scheduler) = RunContext::with_test_scheduler();
    let rec = RecordingObserver::new(ctx.runtime())
      .with_ack_delay(ms(10))
      .into_ref();
    let a = sources::timeline(vec![(ms(1), 1), (ms(2), 2)], None);
    let b = sources::timeline(vec![(ms(1), 10), (ms(2), 20)], None);
    ctx.subscribe(&a.merge(b), rec.clone()).detach();
    scheduler.flush();

    let mut values = rec.values();
    assert_eq!(values.len(), 4);
    values.sort_unstable();
    assert_eq!(values, vec![1, 2, 10, 20]);
    assert!(rec.violations().is_empty());
    assert_eq!(rec.terminal_count(), 1);
    assert!(ctx.ledger().is_balanced());
  }

  #[test]
  fn first_error_wins() {
    let (ctx, scheduler) = RunContext::with_test_scheduler();
    let rec = RecordingObserver::new(ctx.runtime()).into_ref();
    let failing = sources::throw(FlowError::message("boom"));
    let slow = sources::timeline(vec![(ms(5), 1)], None);
    let also_failing = sources::throw(FlowError::message("second"));
    ctx
      .subscribe(&merge_all(vec![failing, slow, also_failing]), rec.clone())
      .detach();
    scheduler.flush();

    assert_eq!(rec.error().map(|e| e.to_string()), Some("boom".to_string()));
    assert!(rec.values().is_empty());
    assert_eq!(rec.terminal_count(), 1);
    assert!(ctx.ledger().is_balanced());
  }

  #[test]
  fn empty_merge_completes() {
    let ctx = RunContext::new(RunConfig::default());
    let rec = RecordingObserver::<i32>::new(ctx.runtime()).into_ref();
    ctx.subscribe(&merge_all(Vec::new()), rec.clone()).detach();
    assert!(rec.is_completed());
    assert!(ctx.ledger().is_balanced());
  }

  #[test]
  fn cancel_stops_every_child() {
    let (ctx, scheduler) = RunContext::with_test_scheduler();
    let rec = RecordingObserver::new(ctx.runtime()).into_ref();
    let a = sources::timeline(vec![(ms(1), 1), (ms(10), 2)], None);
    let b = sources::timeline(vec![(ms(20), 3)], None);
    let cancellable = ctx.subscribe(&a.merge(b), rec.clone()).detach();
    scheduler.advance_to(ms(5));
    // each child still holds its unit
    assert_eq!(cancellable.cancel().redeem(), 2);
    assert!(cancellable.is_cancelled());
    scheduler.flush();

    assert_eq!(rec.values(), vec![1]);
    assert_eq!(rec.terminal_count(), 0);
    // second cancel is answered, not propagated
    assert_eq!(cancellable.cancel().redeem(), 0);
    assert!(ctx.ledger().is_balanced());
  }

  #[test]
  fn finished_children_leave_the_registry() {
    let ctx = RunContext::new(RunConfig::default());
    let rec = RecordingObserver::new(ctx.runtime()).into_ref();
    let core = MergeCore::new(ctx.runtime().clone(), rec.clone(), Certificate::empty());
    ctx.runtime().trampoline().hold(|| {
      for v in 0..100 {
        let id = core.add_child().unwrap();
        MergeChild { core: core.clone(), id }
          .on_next_and_complete(v)
          .redeem();
      }
      assert_eq!(core.live_children(), 0);
    });
    assert_eq!(rec.values(), (0..100).collect::<Vec<_>>());
    assert!(!rec.is_completed());

    core.seal().unwrap().redeem();
    assert_eq!(rec.terminal_count(), 1);
    assert!(ctx.ledger().is_balanced());
  }

  #[test]
  fn cancel_empties_the_registry() {
    let ctx = RunContext::new(RunConfig::default());
    let rec = RecordingObserver::<i32>::new(ctx.runtime()).into_ref();
    let core = MergeCore::new(ctx.runtime().clone(), rec.clone(), ctx.ledger().mint(1));
    let flags: Vec<_> = (0..3)
      .map(|_| {
        let id = core.add_child().unwrap();
        let flag = CancellationFlag::new(ctx.ledger().mint(1));
        core.set_child_cancellable(id, Arc::new(flag.clone()));
        flag
      })
      .collect();
    assert_eq!(core.live_children(), 3);

    assert_eq!(core.cancel().redeem(), 4);
    assert_eq!(core.live_children(), 0);
    assert!(flags.iter().all(|flag| flag.is_cancelled()));
    assert_eq!(core.cancel().redeem(), 0);
    assert!(ctx.ledger().is_balanced());
  }

  #[test]
  fn in_flight_child_is_stopped_after_failure() {
    let (ctx, scheduler) = RunContext::with_test_scheduler();
    let rec = RecordingObserver::new(ctx.runtime())
      .with_ack_delay(ms(10))
      .into_ref();
    let core = MergeCore::new(ctx.runtime().clone(), rec.clone(), Certificate::empty());
    let trampoline = ctx.runtime().trampoline().clone();
    let seen = Arc::new(Mutex::new(None));
    trampoline.hold(|| {
      let first = MergeChild { core: core.clone(), id: core.add_child().unwrap() };
      let second = MergeChild { core: core.clone(), id: core.add_child().unwrap() };
      let s = seen.clone();
      first.on_next(1).then(&trampoline, move |signal| {
        *s.lock() = Some(signal);
        Certificate::empty()
      });
      second
        .on_error(FlowError::message("second failed"))
        .redeem();
    });
    scheduler.flush();

    assert_eq!(*seen.lock(), Some(Signal::Stop));
    assert_eq!(rec.values(), vec![1]);
    assert_eq!(rec.terminal_count(), 1);
    assert!(ctx.ledger().is_balanced());
  }

  #[test]
  fn panicking_downstream_fails_the_merge() {
    let (ctx, scheduler) = RunContext::with_test_scheduler();
    let rec = RecordingObserver::new(ctx.runtime()).into_ref();
    let a = sources::timeline(vec![(ms(1), 1), (ms(3), 3)], None);
    let b = sources::timeline(vec![(ms(2), 2), (ms(4), 4)], None);
    ctx
      .subscribe(&a.merge(b), Fragile::new(rec.clone(), 2))
      .detach();
    scheduler.flush();

    assert_eq!(rec.values(), vec![1, 2]);
    assert_eq!(rec.error().map(|e| e.as_label()), Some("execution"));
    assert_eq!(rec.terminal_count(), 1);
    assert!(ctx.ledger().is_balanced());
  }
}
