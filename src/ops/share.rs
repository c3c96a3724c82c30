//! Multicast: one upstream subscription, many independently paced
//! subscribers.
//!
//! Every upstream value gets the next index of a conceptual infinite
//! sequence. Each subscriber owns a cursor into that sequence. A subscriber
//! that asks for more while its cursor is behind replays the buffered value at
//! once; a subscriber at the newest index asks upstream for the next value by
//! resolving the upstream's held ack, or joins the request already made.
//! Buffered values are evicted once every live cursor has moved past them.
//!
//! Upstream is cancelled once every subscriber cancelled or terminated.
//!
//! An upstream error reaches each subscriber exactly once, after the
//! buffered values it has not seen yet.
//!
//! The first subscriber's grant goes upstream. Every later subscriber keeps
//! its own grant until it terminates or cancels.

use std::{collections::VecDeque, fmt, sync::Arc};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::{
  ack::{Ack, AckResolver, Signal},
  cancellable::{Cancellable, CancellableRef},
  certificate::{Certificate, Weight},
  error::{catch_execution, FlowError},
  flowable::{Flowable, FlowableNode},
  observer::{deliver_terminal, fail_observer, Observer, ObserverRef},
  scheduler::Scheduler,
  state::{NodeId, Runtime, State, SubscribeArgs, SubscriptionResult},
};

pub struct ShareNode<V> {
  source: Flowable<V>,
  // identity of this node across clones of its handle
  identity: Arc<()>,
}

impl<V> ShareNode<V> {
  pub fn new(source: Flowable<V>) -> Self { Self { source, identity: Arc::new(()) } }

  fn id(&self) -> NodeId { NodeId::of(&self.identity) }
}

impl<V: Clone + Send + 'static> FlowableNode<V> for ShareNode<V> {
  fn discover(&self, state: &mut State) -> Weight {
    if state.discover_shared(self.id()) {
      self.source.discover(state)
    } else {
      0
    }
  }

  fn assign_weight(&self, state: &mut State, weight: Weight) {
    if let Some(total) = state.assign_shared(self.id(), weight) {
      self.source.assign_weight(state, total);
    }
  }

  fn subscribe(&self, mut state: State, args: SubscribeArgs<V>) -> (State, SubscriptionResult) {
    let id = self.id();
    if let Some(core) = state.shared_memory::<Arc<ShareCore<V>>>(id).cloned() {
      let result = core.add_subscriber(args.observer, args.grant);
      return (state, result);
    }

    debug!(node = ?id, total = state.shared_weight(id), "share subscribing upstream");
    let core = ShareCore::new(state.runtime().clone());
    state.set_shared_memory(id, core.clone());
    let first = core.add_subscriber(args.observer, Certificate::empty());

    let upstream = Arc::new(ShareUpstream { core: core.clone() });
    let (state, result) = self
      .source
      .subscribe(state, SubscribeArgs::new(upstream, args.grant));
    core.set_upstream(result.cancellable);
    let certificate = first.certificate.merge(result.certificate);
    (state, SubscriptionResult::new(certificate, first.cancellable))
  }
}

// ==================== Shared State ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
  /// Waiting for the value at its cursor.
  Requesting,
  /// A value was sent; waiting for the subscriber's ack.
  Delivering,
  Done,
  Cancelled,
}

impl Status {
  fn is_live(self) -> bool { matches!(self, Status::Requesting | Status::Delivering) }
}

struct ShareSubscriber<V> {
  observer: ObserverRef<V>,
  held: Option<Certificate>,
  cursor: u64,
  status: Status,
}

#[derive(Clone)]
enum UpstreamEnd {
  Completed,
  Failed(FlowError),
}

struct ShareMemory<V> {
  buffer: VecDeque<V>,
  // index of `buffer[0]`
  first_index: u64,
  // index the next upstream value will get
  next_index: u64,
  subscribers: Vec<ShareSubscriber<V>>,
  // upstream is waiting for someone to ask for the next value
  upstream_ack: Option<AckResolver>,
  upstream: Option<CancellableRef>,
  end: Option<UpstreamEnd>,
  // every subscriber left before upstream terminated
  abandoned: bool,
}

/// Side effects of a transition, run once the lock is released.
enum Effect<V> {
  Next(usize, V),
  Last(usize, V),
  Completed(usize),
  Failed(usize, FlowError),
  Resolve(AckResolver, Signal),
  Cancel(CancellableRef),
  Release(Certificate),
}

type Effects<V> = SmallVec<[Effect<V>; 4]>;

impl<V: Clone> ShareMemory<V> {
  /// Subscriber `k` is ready for the value at its cursor.
  fn serve(&mut self, k: usize, effects: &mut Effects<V>) {
    let cursor = self.subscribers[k].cursor;
    if cursor < self.next_index {
      let value = self.buffer[(cursor - self.first_index) as usize].clone();
      self.subscribers[k].cursor = cursor + 1;
      let completed = matches!(self.end, Some(UpstreamEnd::Completed));
      if completed && cursor + 1 == self.next_index {
        effects.push(Effect::Last(k, value));
        self.retire(k, Status::Done, effects);
      } else {
        self.subscribers[k].status = Status::Delivering;
        effects.push(Effect::Next(k, value));
      }
      return;
    }
    match self.end.clone() {
      Some(UpstreamEnd::Completed) => {
        effects.push(Effect::Completed(k));
        self.retire(k, Status::Done, effects);
      }
      Some(UpstreamEnd::Failed(err)) => {
        effects.push(Effect::Failed(k, err));
        self.retire(k, Status::Done, effects);
      }
      None => {
        self.subscribers[k].status = Status::Requesting;
        if let Some(resolver) = self.upstream_ack.take() {
          trace!(subscriber = k, index = self.next_index, "share requesting upstream");
          effects.push(Effect::Resolve(resolver, Signal::Continue));
        }
      }
    }
  }

  /// Serve every subscriber waiting at the newest index.
  fn serve_requesting(&mut self, effects: &mut Effects<V>) {
    for k in 0..self.subscribers.len() {
      if self.subscribers[k].status == Status::Requesting {
        self.serve(k, effects);
      }
    }
  }

  /// Subscriber `k` leaves for good, handing back the grant it held.
  fn retire(&mut self, k: usize, status: Status, effects: &mut Effects<V>) {
    let sub = &mut self.subscribers[k];
    sub.status = status;
    if let Some(held) = sub.held.take() {
      effects.push(Effect::Release(held));
    }
  }

  fn evict(&mut self) {
    let min_cursor = self
      .subscribers
      .iter()
      .filter(|sub| sub.status.is_live())
      .map(|sub| sub.cursor)
      .min()
      .unwrap_or(self.next_index);
    while self.first_index < min_cursor && self.buffer.pop_front().is_some() {
      self.first_index += 1;
    }
  }

  /// Stop upstream once no subscriber is left to serve.
  fn release_if_abandoned(&mut self, effects: &mut Effects<V>) {
    let live = self.subscribers.iter().any(|s| s.status.is_live());
    if self.abandoned || self.end.is_some() || live {
      return;
    }
    self.abandoned = true;
    debug!("share abandoned by every subscriber; cancelling upstream");
    if let Some(resolver) = self.upstream_ack.take() {
      effects.push(Effect::Resolve(resolver, Signal::Stop));
    }
    if let Some(upstream) = self.upstream.take() {
      effects.push(Effect::Cancel(upstream));
    }
  }
}

struct ShareCore<V> {
  runtime: Runtime,
  memory: Mutex<ShareMemory<V>>,
}

impl<V: Clone + Send + 'static> ShareCore<V> {
  fn new(runtime: Runtime) -> Arc<Self> {
    Arc::new(Self {
      runtime,
      memory: Mutex::new(ShareMemory {
        buffer: VecDeque::new(),
        first_index: 0,
        next_index: 0,
        subscribers: Vec::new(),
        upstream_ack: None,
        upstream: None,
        end: None,
        abandoned: false,
      }),
    })
  }

  fn add_subscriber(
    self: &Arc<Self>, observer: ObserverRef<V>, grant: Certificate,
  ) -> SubscriptionResult {
    let mut memory = self.memory.lock();
    let cursor = memory.next_index;
    let late = memory.end.clone();
    let joins = late.is_none() && !memory.abandoned;
    let (status, held, kept) = if joins {
      (Status::Requesting, Some(grant), Certificate::empty())
    } else {
      (Status::Done, None, grant)
    };
    memory
      .subscribers
      .push(ShareSubscriber { observer: observer.clone(), held, cursor, status });
    let index = memory.subscribers.len() - 1;
    drop(memory);
    trace!(subscriber = index, cursor, "share subscriber added");

    let cancellable = Arc::new(ShareSubscription { core: self.clone(), index });
    let certificate = match late {
      // A late joiner sees completion but is not resent an error.
      Some(UpstreamEnd::Completed) => {
        self.runtime.trampoline().schedule(
          Box::new(move || deliver_terminal(&observer, |o| o.on_completed()).merge(kept)),
          None,
        );
        Certificate::empty()
      }
      _ => kept,
    };
    SubscriptionResult::new(certificate, cancellable)
  }

  fn set_upstream(&self, cancellable: CancellableRef) {
    let mut memory = self.memory.lock();
    if !memory.abandoned && memory.end.is_none() {
      memory.upstream = Some(cancellable);
      return;
    }
    let abandoned = memory.abandoned;
    drop(memory);
    if abandoned {
      cancellable.cancel().redeem();
    }
  }

  fn run(self: &Arc<Self>, effects: Effects<V>) -> Certificate {
    let mut cert = Certificate::empty();
    for effect in effects {
      let next = match effect {
        Effect::Next(k, value) => self.send(k, value),
        Effect::Last(k, value) => {
          deliver_terminal(&self.observer(k), |o| o.on_next_and_complete(value))
        }
        Effect::Completed(k) => deliver_terminal(&self.observer(k), |o| o.on_completed()),
        Effect::Failed(k, err) => deliver_terminal(&self.observer(k), |o| o.on_error(err)),
        Effect::Resolve(resolver, signal) => {
          resolver.resolve(signal);
          Certificate::empty()
        }
        Effect::Cancel(upstream) => upstream.cancel(),
        Effect::Release(held) => held,
      };
      cert = cert.merge(next);
    }
    cert
  }

  fn observer(&self, k: usize) -> ObserverRef<V> {
    self.memory.lock().subscribers[k].observer.clone()
  }

  fn send(self: &Arc<Self>, k: usize, value: V) -> Certificate {
    let observer = self.observer(k);
    match catch_execution(|| observer.on_next(value)) {
      Ok(ack) => {
        let core = self.clone();
        ack.then(self.runtime.trampoline(), move |signal| core.requested(k, signal));
        Certificate::empty()
      }
      Err(err) => self.subscriber_panicked(k, &observer, err),
    }
  }

  /// Subscriber `k` panicked while taking a value: it is failed and dropped.
  fn subscriber_panicked(
    self: &Arc<Self>, k: usize, observer: &ObserverRef<V>, err: FlowError,
  ) -> Certificate {
    let mut effects = Effects::new();
    {
      let mut memory = self.memory.lock();
      if memory.subscribers[k].status != Status::Delivering {
        return Certificate::empty();
      }
      memory.retire(k, Status::Done, &mut effects);
      memory.release_if_abandoned(&mut effects);
      memory.evict();
    }
    warn!(subscriber = k, %err, "share subscriber panicked");
    fail_observer(observer, err).merge(self.run(effects))
  }

  /// Subscriber `k` acknowledged its last value.
  fn requested(self: &Arc<Self>, k: usize, signal: Signal) -> Certificate {
    let mut effects = Effects::new();
    {
      let mut memory = self.memory.lock();
      if memory.subscribers[k].status != Status::Delivering {
        return Certificate::empty();
      }
      match signal {
        Signal::Continue => memory.serve(k, &mut effects),
        Signal::Stop => {
          memory.retire(k, Status::Cancelled, &mut effects);
          memory.release_if_abandoned(&mut effects);
        }
      }
      memory.evict();
    }
    self.run(effects)
  }

  /// Take an upstream value, fused with `end` when upstream said it was the
  /// last one. Returns the ack for upstream and what the deliveries released.
  fn upstream_value(self: &Arc<Self>, value: V, end: Option<UpstreamEnd>) -> (Ack, Certificate) {
    let mut effects = Effects::new();
    let ack = {
      let mut memory = self.memory.lock();
      if memory.abandoned || memory.end.is_some() {
        return (Ack::stop(), Certificate::empty());
      }
      memory.buffer.push_back(value);
      memory.next_index += 1;
      trace!(
        index = memory.next_index - 1,
        buffered = memory.buffer.len(),
        "share received value"
      );
      let ack = match end {
        Some(end) => {
          memory.end = Some(end);
          memory.upstream = None;
          Ack::stop()
        }
        None => {
          let (ack, resolver) = Ack::pending(self.runtime.trampoline());
          memory.upstream_ack = Some(resolver);
          ack
        }
      };
      memory.serve_requesting(&mut effects);
      memory.evict();
      ack
    };
    (ack, self.run(effects))
  }

  fn upstream_end(self: &Arc<Self>, end: UpstreamEnd) -> Certificate {
    let mut effects = Effects::new();
    {
      let mut memory = self.memory.lock();
      if memory.abandoned || memory.end.is_some() {
        return Certificate::empty();
      }
      if let UpstreamEnd::Failed(err) = &end {
        debug!(%err, "share upstream failed");
      }
      memory.end = Some(end);
      memory.upstream = None;
      memory.serve_requesting(&mut effects);
    }
    self.run(effects)
  }

  fn cancel_subscriber(self: &Arc<Self>, k: usize) -> Certificate {
    let mut effects = Effects::new();
    {
      let mut memory = self.memory.lock();
      if !memory.subscribers[k].status.is_live() {
        return Certificate::empty();
      }
      memory.retire(k, Status::Cancelled, &mut effects);
      memory.release_if_abandoned(&mut effects);
      memory.evict();
    }
    debug!(subscriber = k, "share subscriber cancelled");
    self.run(effects)
  }
}

impl<V> fmt::Debug for ShareCore<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let memory = self.memory.lock();
    f.debug_struct("ShareCore")
      .field("first_index", &memory.first_index)
      .field("next_index", &memory.next_index)
      .field("subscribers", &memory.subscribers.len())
      .finish()
  }
}

// ==================== Observers and Handles ====================

struct ShareUpstream<V> {
  core: Arc<ShareCore<V>>,
}

impl<V: Clone + Send + 'static> Observer<V> for ShareUpstream<V> {
  fn on_next(&self, value: V) -> Ack {
    let (ack, released) = self.core.upstream_value(value, None);
    released.redeem();
    ack
  }

  fn on_next_and_complete(&self, value: V) -> Certificate {
    let (_, released) = self.core.upstream_value(value, Some(UpstreamEnd::Completed));
    released
  }

  fn on_completed(&self) -> Certificate { self.core.upstream_end(UpstreamEnd::Completed) }

  fn on_error(&self, err: FlowError) -> Certificate {
    self.core.upstream_end(UpstreamEnd::Failed(err))
  }
}

/// One subscriber's handle. Cancelling it answers at once, whatever the
/// upstream is doing.
struct ShareSubscription<V> {
  core: Arc<ShareCore<V>>,
  index: usize,
}

impl<V: Clone + Send + 'static> Cancellable for ShareSubscription<V> {
  fn cancel(&self) -> Certificate { self.core.cancel_subscriber(self.index) }

  fn is_cancelled(&self) -> bool {
    self.core.memory.lock().subscribers[self.index].status == Status::Cancelled
  }
}

#[cfg(test)]
mod tests {
  use std::{
    sync::{
      atomic::{AtomicUsize, Ordering},
      Arc,
    },
    time::Duration,
  };

  use crate::{
    cancellable::CancellableRef,
    context::{RunConfig, RunContext},
    error::FlowError,
    flowable::Flowable,
    observer::{testing::Fragile, ObserverRef, RecordingObserver},
    sources,
    state::{State, SubscribeArgs},
  };

  fn ms(n: u64) -> Duration { Duration::from_millis(n) }

  /// Subscribe two observers to `shared` in one run, one unit of weight each.
  fn subscribe_both<V: Clone + Send + 'static>(
    ctx: &RunContext, shared: &Flowable<V>, first: ObserverRef<V>, second: ObserverRef<V>,
  ) -> (CancellableRef, CancellableRef) {
    ctx.runtime().trampoline().hold(|| {
      let mut state = State::new(ctx.runtime().clone());
      shared.discover(&mut state);
      shared.discover(&mut state);
      shared.assign_weight(&mut state, 1);
      shared.assign_weight(&mut state, 1);
      let (state, a) = shared.subscribe(state, SubscribeArgs::new(first, ctx.ledger().mint(1)));
      let (_, b) = shared.subscribe(state, SubscribeArgs::new(second, ctx.ledger().mint(1)));
      a.certificate.redeem();
      b.certificate.redeem();
      (a.cancellable, b.cancellable)
    })
  }

  #[test]
  fn subscribers_see_the_same_values() {
    let (ctx, scheduler) = RunContext::with_test_scheduler();
    let shared = sources::of(vec![1, 2]).share();
    let both = shared.clone().zip(shared);
    let rec = RecordingObserver::new(ctx.runtime()).into_ref();
    ctx.subscribe(&both, rec.clone()).detach();
    scheduler.flush();

    assert_eq!(rec.values(), vec![(1, 1), (2, 2)]);
    assert!(rec.is_completed());
    assert!(ctx.ledger().is_balanced());
  }

  #[test]
  fn upstream_is_subscribed_once() {
    let ctx = RunContext::new(RunConfig::default());
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let counter = subscriptions.clone();
    let shared = sources::of(vec![1])
      .concat_map(move |v| {
        counter.fetch_add(1, Ordering::SeqCst);
        sources::of(vec![v])
      })
      .share();
    let rec = RecordingObserver::new(ctx.runtime()).into_ref();
    ctx
      .subscribe(&shared.clone().merge(shared.map(|v| v * 10)), rec.clone())
      .detach();

    assert_eq!(subscriptions.load(Ordering::SeqCst), 1);
    let mut values = rec.values();
    values.sort_unstable();
    assert_eq!(values, vec![1, 10]);
    assert!(rec.is_completed());
    assert!(ctx.ledger().is_balanced());
  }

  #[test]
  fn error_reaches_every_subscriber_once() {
    let ctx = RunContext::new(RunConfig::default());
    let shared = sources::throw::<i32>(FlowError::message("shared failure")).share();
    let rec = RecordingObserver::new(ctx.runtime()).into_ref();
    ctx
      .subscribe(&shared.clone().merge(shared), rec.clone())
      .detach();
    assert_eq!(rec.terminal_count(), 1);
    assert!(rec.error().is_some());
    assert!(ctx.ledger().is_balanced());
  }

  #[test]
  fn slow_subscriber_replays_buffered_values() {
    let (ctx, scheduler) = RunContext::with_test_scheduler();
    let shared = sources::from_iter(1..=3).share();
    let delayed = shared
      .clone()
      .concat_map(|v| sources::timeline(vec![(ms(5), v)], None));
    let rec = RecordingObserver::new(ctx.runtime()).into_ref();
    ctx
      .subscribe(&shared.merge(delayed), rec.clone())
      .detach();
    scheduler.flush();

    let values = rec.values();
    assert_eq!(values.len(), 6);
    assert_eq!(&values[..3], &[1, 2, 3]);
    assert!(rec.is_completed());
    assert!(ctx.ledger().is_balanced());
  }

  #[test]
  fn cancelling_one_subscriber_leaves_the_other_running() {
    let (ctx, scheduler) = RunContext::with_test_scheduler();
    let shared = sources::timeline(vec![(ms(1), 1), (ms(2), 2), (ms(3), 3)], None).share();
    let first = RecordingObserver::new(ctx.runtime()).into_ref();
    let second = RecordingObserver::new(ctx.runtime()).into_ref();
    let (cancel_first, _) = subscribe_both(&ctx, &shared, first.clone(), second.clone());

    scheduler.advance_by(Duration::from_micros(1500));
    assert_eq!(cancel_first.cancel().redeem(), 0);
    assert_eq!(cancel_first.cancel().redeem(), 0);
    scheduler.flush();

    assert_eq!(first.values(), vec![1]);
    assert_eq!(first.terminal_count(), 0);
    assert_eq!(second.values(), vec![1, 2, 3]);
    assert!(second.is_completed());
    assert_eq!(ctx.ledger().minted(), 2);
    assert!(ctx.ledger().is_balanced());
  }

  #[test]
  fn cancelling_every_subscriber_returns_all_weight() {
    let (ctx, scheduler) = RunContext::with_test_scheduler();
    let shared = sources::timeline(vec![(ms(1), 1), (ms(5), 2)], None).share();
    let first = RecordingObserver::new(ctx.runtime()).into_ref();
    let second = RecordingObserver::new(ctx.runtime()).into_ref();
    let (a, b) = subscribe_both(&ctx, &shared, first.clone(), second.clone());

    scheduler.advance_by(ms(2));
    assert_eq!(b.cancel().redeem(), 1);
    assert_eq!(a.cancel().redeem(), 1);
    scheduler.flush();

    assert_eq!(first.values(), vec![1]);
    assert_eq!(second.values(), vec![1]);
    assert!(ctx.ledger().is_balanced());
  }

  #[test]
  fn lagging_subscriber_sees_buffered_values_before_the_error() {
    let (ctx, scheduler) = RunContext::with_test_scheduler();
    let shared = sources::of(vec![1, 2, 3])
      .try_map(|v| if v == 3 { Err("three") } else { Ok(v) })
      .share();
    let fast = RecordingObserver::new(ctx.runtime()).into_ref();
    let slow = RecordingObserver::new(ctx.runtime())
      .with_ack_delay(ms(10))
      .into_ref();
    subscribe_both(&ctx, &shared, fast.clone(), slow.clone());
    scheduler.flush();

    assert_eq!(fast.values(), vec![1, 2]);
    assert!(fast.error().is_some());
    assert_eq!(slow.values(), vec![1, 2]);
    assert!(slow.error().is_some());
    assert_eq!(slow.terminal_count(), 1);
    assert!(slow.violations().is_empty());
    assert!(ctx.ledger().is_balanced());
  }

  #[test]
  fn panicking_subscriber_fails_alone() {
    let ctx = RunContext::new(RunConfig::default());
    let shared = sources::of(vec![1, 2, 3]).share();
    let fragile = RecordingObserver::new(ctx.runtime()).into_ref();
    let steady = RecordingObserver::new(ctx.runtime()).into_ref();
    subscribe_both(&ctx, &shared, Fragile::new(fragile.clone(), 1), steady.clone());

    assert_eq!(fragile.values(), vec![1]);
    assert_eq!(fragile.error().map(|e| e.as_label()), Some("execution"));
    assert_eq!(fragile.terminal_count(), 1);
    assert_eq!(steady.values(), vec![1, 2, 3]);
    assert!(steady.is_completed());
    assert!(ctx.ledger().is_balanced());
  }
}
