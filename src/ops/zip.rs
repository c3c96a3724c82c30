//! Zip: fan-in by rounds.
//!
//! Each child holds at most one value at a time, since it cannot send the
//! next one before its ack resolves. Once every child has a value the round is
//! forwarded downstream as a `Vec` ordered by child index, and every child of
//! the round is acknowledged together after the downstream ack.
//!
//! The first child to complete with no value waiting ends the zip: the
//! output is as long as the shortest input. A child whose value is part of
//! the round in flight is still waiting on its ack, so it cannot complete
//! before that round was acknowledged.

use std::{fmt, panic::Location, sync::Arc};

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

// ==================== Zip Operator ====================

pub struct ZipNode<V> {
  sources: Vec<Flowable<V>>,
}

impl<V> ZipNode<V> {
  pub fn new(sources: Vec<Flowable<V>>) -> Self { Self { sources } }
}

/// Pair two flowables of different item types.
#[track_caller]
pub fn zip_pair<A, B>(a: Flowable<A>, b: Flowable<B>) -> Flowable<(A, B)>
where
  A: Send + 'static,
  B: Send + 'static,
{
  let location: &'static Location<'static> = Location::caller();
  let rounds = Flowable::new(ZipNode::new(vec![a.map(Either::Left), b.map(Either::Right)]));
  Flowable::new(crate::ops::map::MapNode::new(
    rounds,
    |mut round: Vec<Either<A, B>>| match (round.pop(), round.pop()) {
      (Some(Either::Right(b)), Some(Either::Left(a))) => Ok((a, b)),
      _ => unreachable!("a zip round holds one value per child, in child order"),
    },
    location,
  ))
}

enum Either<A, B> {
  Left(A),
  Right(B),
}

impl<V: Send + 'static> FlowableNode<Vec<V>> for ZipNode<V> {
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

  fn subscribe(
    &self, mut state: State, args: SubscribeArgs<Vec<V>>,
  ) -> (State, SubscriptionResult) {
    let runtime = state.runtime().clone();
    if self.sources.is_empty() {
      let core = ZipCore::new(runtime.clone(), args.observer, 0, args.grant);
      let completing = core.clone();
      runtime
        .trampoline()
        .schedule(Box::new(move || completing.complete_now()), None);
      return (state, SubscriptionResult::new(Certificate::empty(), core));
    }

    let parts = split_weight(args.weight(), self.sources.len());
    let grants = args.grant.split_into(&parts);
    let core = ZipCore::new(runtime, args.observer, self.sources.len(), Certificate::empty());
    let mut certs: SmallVec<[Certificate; 4]> = SmallVec::new();
    for (index, (source, grant)) in self.sources.iter().zip(grants).enumerate() {
      let child = Arc::new(ZipChild { core: core.clone(), index });
      let (next, result) = source.subscribe(state, SubscribeArgs::new(child, grant));
      state = next;
      core.set_child_cancellable(index, result.cancellable);
      certs.push(result.certificate);
    }
    let certificate = Certificate::merge_all(certs).unwrap_or_default();
    (state, SubscriptionResult::new(certificate, core))
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

struct ZipSlot<V> {
  value: Option<V>,
  resolver: Option<AckResolver>,
  fused: bool,
  finished: bool,
  cancellable: Option<CancellableRef>,
}

struct ZipMemory<V> {
  phase: Phase,
  slots: Vec<ZipSlot<V>>,
  filled: usize,
  // only a zip of no children holds weight itself
  own: Option<Certificate>,
}

impl<V> ZipMemory<V> {
  fn take_own(&mut self) -> Certificate { self.own.take().unwrap_or_default() }

  fn terminate(&mut self, phase: Phase) -> Teardown {
    self.phase = phase;
    let mut teardown = Teardown::default();
    for slot in &mut self.slots {
      slot.value = None;
      teardown.resolvers.extend(slot.resolver.take());
      if !slot.finished {
        slot.finished = true;
        teardown.cancellables.extend(slot.cancellable.take());
      }
    }
    teardown
  }

  /// Take the values of a full round, in child order, with their resolvers.
  fn take_round(&mut self) -> (Vec<V>, Vec<AckResolver>, bool) {
    self.filled = 0;
    let mut fused = false;
    let mut values = Vec::with_capacity(self.slots.len());
    let mut resolvers = Vec::with_capacity(self.slots.len());
    for slot in &mut self.slots {
      fused |= slot.fused;
      values.extend(slot.value.take());
      resolvers.extend(slot.resolver.take());
    }
    (values, resolvers, fused)
  }
}

struct ZipCore<V> {
  runtime: Runtime,
  downstream: ObserverRef<Vec<V>>,
  memory: Mutex<ZipMemory<V>>,
}

impl<V: Send + 'static> ZipCore<V> {
  fn new(
    runtime: Runtime, downstream: ObserverRef<Vec<V>>, children: usize, own: Certificate,
  ) -> Arc<Self> {
    let slots = (0..children)
      .map(|_| ZipSlot {
        value: None,
        resolver: None,
        fused: false,
        finished: false,
        cancellable: None,
      })
      .collect();
    Arc::new(Self {
      runtime,
      downstream,
      memory: Mutex::new(ZipMemory { phase: Phase::Active, slots, filled: 0, own: Some(own) }),
    })
  }

  fn set_child_cancellable(&self, index: usize, cancellable: CancellableRef) {
    let mut memory = self.memory.lock();
    if memory.phase == Phase::Active {
      memory.slots[index].cancellable = Some(cancellable);
      return;
    }
    drop(memory);
    cancellable.cancel().redeem();
  }

  /// Complete a zip of no children.
  fn complete_now(&self) -> Certificate {
    let mut memory = self.memory.lock();
    if memory.phase != Phase::Active {
      return Certificate::empty();
    }
    memory.phase = Phase::Completed;
    let own = memory.take_own();
    drop(memory);
    deliver_terminal(&self.downstream, |o| o.on_completed()).merge(own)
  }

  fn child_next(self: &Arc<Self>, index: usize, value: V) -> Ack {
    let mut memory = self.memory.lock();
    if memory.phase != Phase::Active {
      return Ack::stop();
    }
    let (ack, resolver) = Ack::pending(self.runtime.trampoline());
    let slot = &mut memory.slots[index];
    slot.value = Some(value);
    slot.resolver = Some(resolver);
    memory.filled += 1;
    if memory.filled < memory.slots.len() {
      trace!(child = index, filled = memory.filled, "zip value buffered");
      return ack;
    }
    let (values, resolvers, fused) = memory.take_round();
    if fused {
      let teardown = memory.terminate(Phase::Completed);
      let own = memory.take_own();
      drop(memory);
      self.finish_fused(values, resolvers, teardown).merge(own).redeem();
      return ack;
    }
    drop(memory);
    self.forward(values, resolvers).redeem();
    ack
  }

  fn child_next_and_complete(self: &Arc<Self>, index: usize, value: V) -> Certificate {
    let mut memory = self.memory.lock();
    if memory.phase != Phase::Active {
      return Certificate::empty();
    }
    let slot = &mut memory.slots[index];
    slot.value = Some(value);
    slot.fused = true;
    slot.finished = true;
    slot.cancellable = None;
    memory.filled += 1;
    if memory.filled < memory.slots.len() {
      trace!(child = index, "zip fused value buffered");
      return Certificate::empty();
    }
    let (values, resolvers, _) = memory.take_round();
    let teardown = memory.terminate(Phase::Completed);
    let own = memory.take_own();
    drop(memory);
    self.finish_fused(values, resolvers, teardown).merge(own)
  }

  /// Forward the last round fused with completion.
  fn finish_fused(
    &self, values: Vec<V>, resolvers: Vec<AckResolver>, mut teardown: Teardown,
  ) -> Certificate {
    debug!(round_len = values.len(), "zip completed with fused round");
    teardown.resolvers.extend(resolvers);
    let released = teardown.run();
    deliver_terminal(&self.downstream, |o| o.on_next_and_complete(values)).merge(released)
  }

  fn forward(self: &Arc<Self>, values: Vec<V>, resolvers: Vec<AckResolver>) -> Certificate {
    let downstream = self.downstream.clone();
    match catch_execution(|| downstream.on_next(values)) {
      Ok(ack) => {
        let core = self.clone();
        ack.then(self.runtime.trampoline(), move |signal| {
          core.round_acknowledged(signal, resolvers)
        });
        Certificate::empty()
      }
      Err(err) => self.downstream_panicked(err, resolvers),
    }
  }

  /// Downstream acknowledged a round: release every child of it together.
  fn round_acknowledged(&self, signal: Signal, resolvers: Vec<AckResolver>) -> Certificate {
    let mut memory = self.memory.lock();
    if memory.phase == Phase::Active && signal == Signal::Continue {
      drop(memory);
      for resolver in resolvers {
        resolver.resolve(Signal::Continue);
      }
      return Certificate::empty();
    }
    let mut teardown = if memory.phase == Phase::Active {
      debug!("zip stopped by downstream");
      memory.terminate(Phase::Cancelled)
    } else {
      Teardown::default()
    };
    let own = memory.take_own();
    drop(memory);
    teardown.resolvers.extend(resolvers);
    own.merge(teardown.run())
  }

  fn downstream_panicked(&self, err: FlowError, resolvers: Vec<AckResolver>) -> Certificate {
    let mut memory = self.memory.lock();
    let active = memory.phase == Phase::Active;
    let mut teardown = if active { memory.terminate(Phase::Errored) } else { Teardown::default() };
    let own = memory.take_own();
    drop(memory);
    teardown.resolvers.extend(resolvers);
    let released = teardown.run().merge(own);
    if !active {
      return released;
    }
    warn!(%err, "zip downstream panicked");
    fail_observer(&self.downstream, err).merge(released)
  }

  fn child_completed(&self, index: usize) -> Certificate {
    let mut memory = self.memory.lock();
    if memory.phase != Phase::Active || memory.slots[index].finished {
      return Certificate::empty();
    }
    let slot = &mut memory.slots[index];
    slot.finished = true;
    slot.cancellable = None;
    let teardown = memory.terminate(Phase::Completed);
    let own = memory.take_own();
    drop(memory);
    debug!(child = index, "zip completed by shortest child");
    let released = teardown.run();
    deliver_terminal(&self.downstream, |o| o.on_completed())
      .merge(released)
      .merge(own)
  }

  fn child_error(&self, index: usize, err: FlowError) -> Certificate {
    let mut memory = self.memory.lock();
    if memory.phase != Phase::Active {
      return Certificate::empty();
    }
    memory.slots[index].finished = true;
    let teardown = memory.terminate(Phase::Errored);
    let own = memory.take_own();
    drop(memory);
    debug!(child = index, %err, "zip failed");
    let released = teardown.run();
    deliver_terminal(&self.downstream, |o| o.on_error(err))
      .merge(released)
      .merge(own)
  }
}

impl<V: Send + 'static> Cancellable for ZipCore<V> {
  fn cancel(&self) -> Certificate {
    let mut memory = self.memory.lock();
    if memory.phase != Phase::Active {
      return Certificate::empty();
    }
    let teardown = memory.terminate(Phase::Cancelled);
    let own = memory.take_own();
    drop(memory);
    debug!("zip cancelled");
    own.merge(teardown.run())
  }

  fn is_cancelled(&self) -> bool { self.memory.lock().phase == Phase::Cancelled }
}

impl<V> fmt::Debug for ZipCore<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let memory = self.memory.lock();
    f.debug_struct("ZipCore")
      .field("phase", &memory.phase)
      .field("filled", &memory.filled)
      .finish()
  }
}

// ==================== Child Observer ====================

struct ZipChild<V> {
  core: Arc<ZipCore<V>>,
  index: usize,
}

impl<V: Send + 'static> Observer<V> for ZipChild<V> {
  fn on_next(&self, value: V) -> Ack { self.core.child_next(self.index, value) }

  fn on_next_and_complete(&self, value: V) -> Certificate {
    self.core.child_next_and_complete(self.index, value)
  }

  fn on_completed(&self) -> Certificate { self.core.child_completed(self.index) }

  fn on_error(&self, err: FlowError) -> Certificate { self.core.child_error(self.index, err) }
}
