//! Observer trait and the terminal observers shipped with the crate.
//!
//! Every call except `on_next` hands back a [`Certificate`]. `on_next` hands
//! back an [`Ack`] that resolves once the observer is ready for the next value;
//! a producer must not call `on_next` again before then.
//!
//! A terminal answer carries whatever weight the observer still held for the
//! stream it consumed. Observers at the end of a chain hold none and answer
//! with [`Certificate::empty`].

use std::{fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tracing::error;

use crate::{
  ack::{Ack, Signal},
  certificate::Certificate,
  error::{catch_execution, FlowError},
  scheduler::Scheduler,
  state::Runtime,
};

// ============================================================================
// Observer Trait
// ============================================================================

/// The consumer side of a flowable.
///
/// After `on_completed`, `on_error` or `on_next_and_complete` no further call
/// is made on the same observer.
pub trait Observer<V>: Send + Sync {
  /// Receive a value. The returned ack resolves when the next one may come.
  fn on_next(&self, value: V) -> Ack;

  /// Receive the last value together with completion.
  fn on_next_and_complete(&self, value: V) -> Certificate;

  fn on_completed(&self) -> Certificate;

  fn on_error(&self, err: FlowError) -> Certificate;
}

pub type ObserverRef<V> = Arc<dyn Observer<V>>;

/// Deliver `err` to `observer` after one of its calls panicked.
///
/// A panic inside `on_error` itself has nowhere left to go; it is logged and
/// answered with an empty certificate.
pub(crate) fn fail_observer<V>(observer: &ObserverRef<V>, err: FlowError) -> Certificate {
  catch_execution(|| observer.on_error(err)).unwrap_or_else(|err| {
    error!(%err, "observer panicked while receiving an error");
    Certificate::empty()
  })
}

/// Make a terminal call on `observer`, turning a panic into `on_error`.
pub(crate) fn deliver_terminal<V>(
  observer: &ObserverRef<V>, call: impl FnOnce(&ObserverRef<V>) -> Certificate,
) -> Certificate {
  catch_execution(|| call(observer)).unwrap_or_else(|err| fail_observer(observer, err))
}

// ============================================================================
// SinkObserver
// ============================================================================

type NextFn<V> = Box<dyn FnMut(V) + Send>;
type ErrorFn = Box<dyn FnOnce(FlowError) + Send>;
type CompleteFn = Box<dyn FnOnce() + Send>;

struct SinkHandlers<V> {
  next: NextFn<V>,
  error: Option<ErrorFn>,
  complete: Option<CompleteFn>,
}

/// Closure-backed terminal observer that acknowledges every value at once.
pub struct SinkObserver<V> {
  handlers: Mutex<SinkHandlers<V>>,
}

impl<V> SinkObserver<V> {
  pub fn new(next: impl FnMut(V) + Send + 'static) -> Self {
    Self {
      handlers: Mutex::new(SinkHandlers { next: Box::new(next), error: None, complete: None }),
    }
  }

  pub fn on_error_with(self, f: impl FnOnce(FlowError) + Send + 'static) -> Self {
    self.handlers.lock().error = Some(Box::new(f));
    self
  }

  pub fn on_completed_with(self, f: impl FnOnce() + Send + 'static) -> Self {
    self.handlers.lock().complete = Some(Box::new(f));
    self
  }

  fn complete(&self) -> Certificate {
    let complete = self.handlers.lock().complete.take();
    if let Some(f) = complete {
      f();
    }
    Certificate::empty()
  }
}

impl<V: Send> Observer<V> for SinkObserver<V> {
  fn on_next(&self, value: V) -> Ack {
    (self.handlers.lock().next)(value);
    Ack::proceed()
  }

  fn on_next_and_complete(&self, value: V) -> Certificate {
    (self.handlers.lock().next)(value);
    self.complete()
  }

  fn on_completed(&self) -> Certificate { self.complete() }

  fn on_error(&self, err: FlowError) -> Certificate {
    let error = self.handlers.lock().error.take();
    if let Some(f) = error {
      f(err);
    }
    Certificate::empty()
  }
}

// ============================================================================
// RecordingObserver
// ============================================================================

/// One call received by a [`RecordingObserver`].
#[derive(Debug, Clone)]
pub enum Notification<V> {
  Next(V),
  Completed,
  Error(FlowError),
}

struct Recorder<V> {
  records: Vec<(Duration, Notification<V>)>,
  in_flight: bool,
  terminated: bool,
  violations: Vec<String>,
}

/// Observer that records every call with the runtime clock's timestamp.
///
/// It acknowledges values immediately, or after a virtual delay on the
/// runtime's scheduler. Protocol violations (a call after termination, an
/// `on_next` before the previous ack resolved) are recorded, not panicked on,
/// so tests can assert on them.
pub struct RecordingObserver<V> {
  runtime: Runtime,
  ack_delay: Option<Duration>,
  recorder: Arc<Mutex<Recorder<V>>>,
}

impl<V> RecordingObserver<V> {
  pub fn new(runtime: &Runtime) -> Self {
    Self {
      runtime: runtime.clone(),
      ack_delay: None,
      recorder: Arc::new(Mutex::new(Recorder {
        records: Vec::new(),
        in_flight: false,
        terminated: false,
        violations: Vec::new(),
      })),
    }
  }

  /// Acknowledge each value `delay` after receiving it.
  pub fn with_ack_delay(mut self, delay: Duration) -> Self {
    self.ack_delay = Some(delay);
    self
  }

  pub fn into_ref(self) -> Arc<Self>
  where
    V: Send + 'static,
  {
    Arc::new(self)
  }

  pub fn records(&self) -> Vec<(Duration, Notification<V>)>
  where
    V: Clone,
  {
    self.recorder.lock().records.clone()
  }

  pub fn values(&self) -> Vec<V>
  where
    V: Clone,
  {
    self.timed_values().into_iter().map(|(_, v)| v).collect()
  }

  pub fn timed_values(&self) -> Vec<(Duration, V)>
  where
    V: Clone,
  {
    self
      .recorder
      .lock()
      .records
      .iter()
      .filter_map(|(at, n)| match n {
        Notification::Next(v) => Some((*at, v.clone())),
        _ => None,
      })
      .collect()
  }

  pub fn is_completed(&self) -> bool { self.completed_at().is_some() }

  pub fn completed_at(&self) -> Option<Duration> {
    self
      .recorder
      .lock()
      .records
      .iter()
      .find_map(|(at, n)| matches!(n, Notification::Completed).then_some(*at))
  }

  pub fn error(&self) -> Option<FlowError> {
    self
      .recorder
      .lock()
      .records
      .iter()
      .find_map(|(_, n)| match n {
        Notification::Error(err) => Some(err.clone()),
        _ => None,
      })
  }

  /// Number of `on_completed`/`on_error` calls received, fused completions
  /// included.
  pub fn terminal_count(&self) -> usize {
    self
      .recorder
      .lock()
      .records
      .iter()
      .filter(|(_, n)| !matches!(n, Notification::Next(_)))
      .count()
  }

  pub fn violations(&self) -> Vec<String> { self.recorder.lock().violations.clone() }

  fn record(&self, notification: Notification<V>) {
    let now = self.runtime.scheduler().now();
    let mut recorder = self.recorder.lock();
    if recorder.terminated {
      recorder.violations.push(format!("call after termination at {now:?}"));
    }
    match &notification {
      Notification::Next(_) => {
        if recorder.in_flight {
          recorder
            .violations
            .push(format!("on_next before previous ack at {now:?}"));
        }
      }
      Notification::Completed | Notification::Error(_) => recorder.terminated = true,
    }
    recorder.records.push((now, notification));
  }
}

impl<V: Send + 'static> Observer<V> for RecordingObserver<V> {
  fn on_next(&self, value: V) -> Ack {
    self.record(Notification::Next(value));
    let Some(delay) = self.ack_delay else {
      return Ack::proceed();
    };
    self.recorder.lock().in_flight = true;
    let (ack, resolver) = Ack::pending(self.runtime.trampoline());
    let recorder = self.recorder.clone();
    self.runtime.scheduler().schedule_relative(
      delay,
      Box::new(move || {
        recorder.lock().in_flight = false;
        resolver.resolve(Signal::Continue);
        Certificate::empty()
      }),
      None,
    );
    ack
  }

  fn on_next_and_complete(&self, value: V) -> Certificate {
    self.record(Notification::Next(value));
    self.record(Notification::Completed);
    Certificate::empty()
  }

  fn on_completed(&self) -> Certificate {
    self.record(Notification::Completed);
    Certificate::empty()
  }

  fn on_error(&self, err: FlowError) -> Certificate {
    self.record(Notification::Error(err));
    Certificate::empty()
  }
}

impl<V> fmt::Debug for RecordingObserver<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let recorder = self.recorder.lock();
    f.debug_struct("RecordingObserver")
      .field("records", &recorder.records.len())
      .field("terminated", &recorder.terminated)
      .finish()
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::scheduler::TestScheduler;

  fn runtime() -> (Runtime, TestScheduler) {
    let scheduler = TestScheduler::new();
    let runtime = Runtime::new(
      crate::scheduler::Trampoline::new(scheduler.ledger().clone()),
      Arc::new(scheduler.clone()),
    );
    (runtime, scheduler)
  }

  #[test]
  fn sink_runs_closures() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(Mutex::new(false));
    let (s, d) = (seen.clone(), done.clone());
    let sink = SinkObserver::new(move |v: i32| s.lock().push(v))
      .on_completed_with(move || *d.lock() = true);

    assert_eq!(sink.on_next(1).peek(), Some(Signal::Continue));
    sink.on_next_and_complete(2).redeem();
    assert_eq!(*seen.lock(), vec![1, 2]);
    assert!(*done.lock());
  }

  #[test]
  fn recorder_flags_violations() {
    let (runtime, _) = runtime();
    let rec = RecordingObserver::<i32>::new(&runtime);
    rec.on_completed().redeem();
    rec.on_error(FlowError::message("late")).redeem();
    assert_eq!(rec.terminal_count(), 2);
    assert_eq!(rec.violations().len(), 1);
  }

  #[test]
  fn recorder_delays_acks_on_virtual_time() {
    let (runtime, scheduler) = runtime();
    let rec = RecordingObserver::new(&runtime).with_ack_delay(Duration::from_millis(10));
    let ack = rec.on_next(1);
    assert_eq!(ack.peek(), None);
    scheduler.advance_by(Duration::from_millis(10));
    assert_eq!(ack.peek(), Some(Signal::Continue));
    assert_eq!(rec.values(), vec![1]);
    assert!(rec.violations().is_empty());
    // the ack was resolved before anything attached to it
    ack.then(runtime.trampoline(), |_| Certificate::empty());
    assert!(runtime.ledger().is_balanced());
  }

  #[test]
  fn panicking_terminal_becomes_an_error() {
    let (runtime, _) = runtime();
    let rec = RecordingObserver::<i32>::new(&runtime).into_ref();
    let observer: ObserverRef<i32> = rec.clone();
    deliver_terminal(&observer, |_| panic!("sink gave up")).redeem();
    assert_eq!(rec.error().map(|e| e.as_label()), Some("execution"));
    assert_eq!(rec.terminal_count(), 1);
  }
}
