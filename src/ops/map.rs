use std::{
  panic::Location,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
};

use crate::{
  ack::Ack,
  certificate::{Certificate, Weight},
  error::{catch_operator, FlowError},
  flowable::{Flowable, FlowableNode},
  observer::{Observer, ObserverRef},
  state::{State, SubscribeArgs, SubscriptionResult},
};

type Selector<V, U> = Arc<dyn Fn(V) -> Result<U, String> + Send + Sync>;

pub struct MapNode<V, U> {
  source: Flowable<V>,
  f: Selector<V, U>,
  location: &'static Location<'static>,
}

impl<V, U> MapNode<V, U> {
  pub fn new<F>(source: Flowable<V>, f: F, location: &'static Location<'static>) -> Self
  where
    F: Fn(V) -> Result<U, String> + Send + Sync + 'static,
  {
    Self { source, f: Arc::new(f), location }
  }
}

impl<V: Send + 'static, U: Send + 'static> FlowableNode<U> for MapNode<V, U> {
  fn discover(&self, state: &mut State) -> Weight { self.source.discover(state) }

  fn assign_weight(&self, state: &mut State, weight: Weight) {
    self.source.assign_weight(state, weight)
  }

  fn subscribe(&self, state: State, args: SubscribeArgs<U>) -> (State, SubscriptionResult) {
    let observer = MapObserver {
      downstream: args.observer,
      f: self.f.clone(),
      location: self.location,
      failed: AtomicBool::new(false),
    };
    self
      .source
      .subscribe(state, SubscribeArgs::new(Arc::new(observer), args.grant))
  }
}

struct MapObserver<V, U> {
  downstream: ObserverRef<U>,
  f: Selector<V, U>,
  location: &'static Location<'static>,
  failed: AtomicBool,
}

impl<V, U> MapObserver<V, U> {
  fn apply(&self, value: V) -> Result<U, FlowError> {
    match catch_operator("map", self.location, || (self.f)(value)) {
      Ok(Ok(mapped)) => Ok(mapped),
      Ok(Err(message)) => Err(FlowError::operator("map", self.location, message)),
      Err(err) => Err(err),
    }
  }

  /// Send `err` downstream unless this observer already failed.
  fn fail(&self, err: FlowError) -> Certificate {
    if self.failed.swap(true, Ordering::AcqRel) {
      return Certificate::empty();
    }
    self.downstream.on_error(err)
  }

  fn is_failed(&self) -> bool { self.failed.load(Ordering::Acquire) }
}

impl<V: Send, U: Send> Observer<V> for MapObserver<V, U> {
  fn on_next(&self, value: V) -> Ack {
    if self.is_failed() {
      return Ack::stop();
    }
    match self.apply(value) {
      Ok(mapped) => self.downstream.on_next(mapped),
      Err(err) => {
        self.fail(err).redeem();
        Ack::stop()
      }
    }
  }

  fn on_next_and_complete(&self, value: V) -> Certificate {
    if self.is_failed() {
      return Certificate::empty();
    }
    match self.apply(value) {
      Ok(mapped) => self.downstream.on_next_and_complete(mapped),
      Err(err) => self.fail(err),
    }
  }

  fn on_completed(&self) -> Certificate {
    if self.is_failed() {
      return Certificate::empty();
    }
    self.downstream.on_completed()
  }

  fn on_error(&self, err: FlowError) -> Certificate { self.fail(err) }
}

#[cfg(test)]
mod tests {
  use crate::{
    context::{RunConfig, RunContext},
    observer::RecordingObserver,
    sources,
  };

  #[test]
  fn maps_values() {
    let ctx = RunContext::new(RunConfig::default());
    let rec = RecordingObserver::new(ctx.runtime()).into_ref();
    ctx
      .subscribe(&sources::of(vec![1, 2, 3]).map(|v| v + 1), rec.clone())
      .detach();
    assert_eq!(rec.values(), vec![2, 3, 4]);
    assert!(rec.is_completed());
  }

  #[test]
  fn panicking_selector_is_an_operator_error() {
    let ctx = RunContext::new(RunConfig::default());
    let rec = RecordingObserver::new(ctx.runtime()).into_ref();
    let line = line!() + 2;
    let source = sources::of(vec![1, 2, 3])
      .map(|v| if v == 2 { panic!("two") } else { v });
    ctx.subscribe(&source, rec.clone()).detach();

    assert_eq!(rec.values(), vec![1]);
    let err = rec.error().unwrap();
    assert_eq!(err.as_label(), "operator");
    assert_eq!(err.location().map(|l| l.line()), Some(line));
    assert_eq!(rec.terminal_count(), 1);
    assert!(ctx.ledger().is_balanced());
  }

  #[test]
  fn try_map_error_message() {
    let ctx = RunContext::new(RunConfig::default());
    let rec = RecordingObserver::new(ctx.runtime()).into_ref();
    let source = sources::of(vec![1, 2])
      .try_map(|v| if v > 1 { Err(format!("too big: {v}")) } else { Ok(v) });
    ctx.subscribe(&source, rec.clone()).detach();
    assert_eq!(rec.values(), vec![1]);
    assert!(rec.error().unwrap().to_string().contains("too big: 2"));
  }
}
