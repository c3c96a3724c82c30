//! Producer/consumer decoupling.
//!
//! Upstream values are acknowledged at once and appended to an unbounded
//! queue. A delivery loop, started when the first value arrives while it is
//! idle, drains the queue downstream one value per ack. An upstream terminal
//! event is queued behind the values already buffered.
//!
//! The delivery loop is a producer of its own: the buffer keeps one unit of
//! its grant for it and hands the rest to its upstream.

use std::{collections::VecDeque, fmt, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
  ack::{Ack, Signal},
  cancellable::{Cancellable, CancellableRef},
  certificate::{keep_one, Certificate, Weight},
  error::{catch_execution, FlowError},
  flowable::{Flowable, FlowableNode},
  observer::{deliver_terminal, fail_observer, Observer, ObserverRef},
  scheduler::Scheduler,
  state::{Runtime, State, SubscribeArgs, SubscriptionResult},
};

pub struct BufferNode<V> {
  source: Flowable<V>,
}

impl<V> BufferNode<V> {
  pub fn new(source: Flowable<V>) -> Self { Self { source } }
}

impl<V: Send + 'static> FlowableNode<V> for BufferNode<V> {
  fn discover(&self, state: &mut State) -> Weight { self.source.discover(state) + 1 }

  fn assign_weight(&self, state: &mut State, weight: Weight) {
    self.source.assign_weight(state, weight - weight.min(1))
  }

  fn subscribe(&self, state: State, args: SubscribeArgs<V>) -> (State, SubscriptionResult) {
    let (own, rest) = keep_one(args.grant);
    let core = Arc::new(BufferCore {
      runtime: state.runtime().clone(),
      downstream: args.observer,
      memory: Mutex::new(BufferMemory {
        phase: Phase::Running,
        delivery: Delivery::Inactive,
        buffered: VecDeque::new(),
        upstream_end: None,
        upstream: None,
        own: Some(own),
      }),
    });
    let upstream = BufferUpstream { core: core.clone() };
    let (state, result) = self
      .source
      .subscribe(state, SubscribeArgs::new(Arc::new(upstream), rest));
    core.set_upstream(result.cancellable);
    (state, SubscriptionResult::new(result.certificate, core))
  }
}

// ==================== Shared State ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
  Running,
  Terminated,
  Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
  /// No value in flight downstream; the next upstream value restarts the loop.
  Inactive,
  Active,
}

enum UpstreamEnd {
  Completed,
  Failed(FlowError),
}

struct BufferMemory<V> {
  phase: Phase,
  delivery: Delivery,
  buffered: VecDeque<V>,
  upstream_end: Option<UpstreamEnd>,
  upstream: Option<CancellableRef>,
  /// Grant of the delivery loop, released with the final downstream call.
  own: Option<Certificate>,
}

/// What one step of the delivery loop sends downstream.
enum Step<V> {
  Idle,
  Next(V),
  Last(V),
  Completed,
  Failed(FlowError),
}

struct BufferCore<V> {
  runtime: Runtime,
  downstream: ObserverRef<V>,
  memory: Mutex<BufferMemory<V>>,
}

impl<V: Send + 'static> BufferCore<V> {
  fn take_own(&self) -> Certificate { self.memory.lock().own.take().unwrap_or_default() }

  fn set_upstream(&self, cancellable: CancellableRef) {
    let mut memory = self.memory.lock();
    if memory.phase == Phase::Running && memory.upstream_end.is_none() {
      memory.upstream = Some(cancellable);
      return;
    }
    let cancelled = memory.phase == Phase::Cancelled;
    drop(memory);
    if cancelled {
      cancellable.cancel().redeem();
    }
  }

  /// Queue `value`, starting the delivery loop if it was idle.
  fn push(self: &Arc<Self>, value: V, end: Option<UpstreamEnd>) -> bool {
    let mut memory = self.memory.lock();
    if memory.phase != Phase::Running || memory.upstream_end.is_some() {
      return false;
    }
    memory.buffered.push_back(value);
    if end.is_some() {
      memory.upstream_end = end;
      memory.upstream = None;
    }
    let start = memory.delivery == Delivery::Inactive;
    if start {
      memory.delivery = Delivery::Active;
    }
    trace!(buffered = memory.buffered.len(), start, "buffer queued value");
    drop(memory);
    if start {
      self.start_loop();
    }
    true
  }

  fn start_loop(self: &Arc<Self>) {
    let core = self.clone();
    self
      .runtime
      .trampoline()
      .schedule(Box::new(move || core.deliver()), None);
  }

  /// Upstream terminated. Delivered at once when nothing is buffered.
  fn end(&self, end: UpstreamEnd) -> Certificate {
    let mut memory = self.memory.lock();
    if memory.phase != Phase::Running || memory.upstream_end.is_some() {
      return Certificate::empty();
    }
    memory.upstream = None;
    if memory.delivery == Delivery::Active {
      memory.upstream_end = Some(end);
      return Certificate::empty();
    }
    memory.phase = Phase::Terminated;
    let own = memory.own.take().unwrap_or_default();
    drop(memory);
    debug!("buffer idle; forwarding upstream end");
    let answer = match end {
      UpstreamEnd::Completed => deliver_terminal(&self.downstream, |o| o.on_completed()),
      UpstreamEnd::Failed(err) => deliver_terminal(&self.downstream, |o| o.on_error(err)),
    };
    answer.merge(own)
  }

  fn next_step(&self) -> Step<V> {
    let mut memory = self.memory.lock();
    if memory.phase != Phase::Running {
      memory.delivery = Delivery::Inactive;
      return Step::Idle;
    }
    let Some(value) = memory.buffered.pop_front() else {
      return match memory.upstream_end.take() {
        None => {
          memory.delivery = Delivery::Inactive;
          Step::Idle
        }
        Some(end) => {
          memory.phase = Phase::Terminated;
          match end {
            UpstreamEnd::Completed => Step::Completed,
            UpstreamEnd::Failed(err) => Step::Failed(err),
          }
        }
      };
    };
    let last = memory.buffered.is_empty()
      && matches!(memory.upstream_end, Some(UpstreamEnd::Completed));
    if last {
      memory.upstream_end = None;
      memory.phase = Phase::Terminated;
      return Step::Last(value);
    }
    Step::Next(value)
  }

  /// One turn of the delivery loop.
  fn deliver(self: Arc<Self>) -> Certificate {
    let answer = match self.next_step() {
      Step::Idle => return Certificate::empty(),
      Step::Next(value) => {
        let downstream = self.downstream.clone();
        return match catch_execution(|| downstream.on_next(value)) {
          Ok(ack) => {
            let core = self.clone();
            ack.then(self.runtime.trampoline(), move |signal| match signal {
              Signal::Continue => core.deliver(),
              Signal::Stop => core.cancel(),
            });
            Certificate::empty()
          }
          Err(err) => self.abort(err),
        };
      }
      Step::Last(value) => {
        debug!("buffer drained; completing with last value");
        deliver_terminal(&self.downstream, |o| o.on_next_and_complete(value))
      }
      Step::Completed => {
        debug!("buffer drained; completing");
        deliver_terminal(&self.downstream, |o| o.on_completed())
      }
      Step::Failed(err) => {
        debug!(%err, "buffer drained; failing");
        deliver_terminal(&self.downstream, |o| o.on_error(err))
      }
    };
    answer.merge(self.take_own())
  }

  /// Downstream panicked while receiving a value: stop upstream and report
  /// the panic as the terminal error.
  fn abort(&self, err: FlowError) -> Certificate {
    let mut memory = self.memory.lock();
    memory.phase = Phase::Terminated;
    memory.buffered.clear();
    memory.upstream_end = None;
    let upstream = memory.upstream.take();
    let own = memory.own.take().unwrap_or_default();
    drop(memory);
    warn!(%err, "buffer downstream panicked");
    let released = upstream.map(|u| u.cancel()).unwrap_or_default();
    fail_observer(&self.downstream, err).merge(released).merge(own)
  }
}

impl<V: Send + 'static> Cancellable for BufferCore<V> {
  fn cancel(&self) -> Certificate {
    let mut memory = self.memory.lock();
    if memory.phase != Phase::Running {
      return Certificate::empty();
    }
    memory.phase = Phase::Cancelled;
    let dropped = memory.buffered.len();
    memory.buffered.clear();
    memory.upstream_end = None;
    let was_active = memory.delivery == Delivery::Active;
    let upstream = memory.upstream.take();
    let own = memory.own.take().unwrap_or_default();
    drop(memory);
    debug!(dropped, was_active, "buffer cancelled");
    let released = upstream.map(|u| u.cancel()).unwrap_or_default();
    own.merge(released)
  }

  fn is_cancelled(&self) -> bool { self.memory.lock().phase == Phase::Cancelled }
}

impl<V> fmt::Debug for BufferCore<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let memory = self.memory.lock();
    f.debug_struct("BufferCore")
      .field("phase", &memory.phase)
      .field("delivery", &memory.delivery)
      .field("buffered", &memory.buffered.len())
      .finish()
  }
}

// ==================== Upstream Observer ====================

struct BufferUpstream<V> {
  core: Arc<BufferCore<V>>,
}

impl<V: Send + 'static> Observer<V> for BufferUpstream<V> {
  fn on_next(&self, value: V) -> Ack {
    if self.core.push(value, None) {
      Ack::proceed()
    } else {
      Ack::stop()
    }
  }

  fn on_next_and_complete(&self, value: V) -> Certificate {
    self.core.push(value, Some(UpstreamEnd::Completed));
    Certificate::empty()
  }

  fn on_completed(&self) -> Certificate { self.core.end(UpstreamEnd::Completed) }

  fn on_error(&self, err: FlowError) -> Certificate { self.core.end(UpstreamEnd::Failed(err)) }
}
