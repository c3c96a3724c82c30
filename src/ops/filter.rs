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

type Predicate<V> = Arc<dyn Fn(&V) -> bool + Send + Sync>;

pub struct FilterNode<V> {
  source: Flowable<V>,
  predicate: Predicate<V>,
  location: &'static Location<'static>,
}

impl<V> FilterNode<V> {
  pub fn new<F>(source: Flowable<V>, predicate: F, location: &'static Location<'static>) -> Self
  where
    F: Fn(&V) -> bool + Send + Sync + 'static,
  {
    Self { source, predicate: Arc::new(predicate), location }
  }
}

impl<V: Send + 'static> FlowableNode<V> for FilterNode<V> {
  fn discover(&self, state: &mut State) -> Weight { self.source.discover(state) }

  fn assign_weight(&self, state: &mut State, weight: Weight) {
    self.source.assign_weight(state, weight)
  }

  fn subscribe(&self, state: State, args: SubscribeArgs<V>) -> (State, SubscriptionResult) {
    let observer = FilterObserver {
      downstream: args.observer,
      predicate: self.predicate.clone(),
      location: self.location,
      failed: AtomicBool::new(false),
    };
    self
      .source
      .subscribe(state, SubscribeArgs::new(Arc::new(observer), args.grant))
  }
}

struct FilterObserver<V> {
  downstream: ObserverRef<V>,
  predicate: Predicate<V>,
  location: &'static Location<'static>,
  failed: AtomicBool,
}

impl<V> FilterObserver<V> {
  fn test(&self, value: &V) -> Result<bool, FlowError> {
    catch_operator("filter", self.location, || (self.predicate)(value))
  }

  fn fail(&self, err: FlowError) -> Certificate {
    if self.failed.swap(true, Ordering::AcqRel) {
      return Certificate::empty();
    }
    self.downstream.on_error(err)
  }
}

impl<V: Send> Observer<V> for FilterObserver<V> {
  fn on_next(&self, value: V) -> Ack {
    if self.failed.load(Ordering::Acquire) {
      return Ack::stop();
    }
    match self.test(&value) {
      Ok(true) => self.downstream.on_next(value),
      Ok(false) => Ack::proceed(),
      Err(err) => {
        self.fail(err).redeem();
        Ack::stop()
      }
    }
  }

  fn on_next_and_complete(&self, value: V) -> Certificate {
    if self.failed.load(Ordering::Acquire) {
      return Certificate::empty();
    }
    match self.test(&value) {
      Ok(true) => self.downstream.on_next_and_complete(value),
      Ok(false) => self.downstream.on_completed(),
      Err(err) => self.fail(err),
    }
  }

  fn on_completed(&self) -> Certificate {
    if self.failed.load(Ordering::Acquire) {
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
  fn keeps_matching_values() {
    let ctx = RunContext::new(RunConfig::default());
    let rec = RecordingObserver::new(ctx.runtime()).into_ref();
    ctx
      .subscribe(&sources::from_iter(1..=6).filter(|v| v % 2 == 0), rec.clone())
      .detach();
    assert_eq!(rec.values(), vec![2, 4, 6]);
    assert!(rec.is_completed());
  }

  #[test]
  fn rejected_last_value_still_completes() {
    let ctx = RunContext::new(RunConfig::default());
    let rec = RecordingObserver::new(ctx.runtime()).into_ref();
    ctx
      .subscribe(&sources::of(vec![2, 3]).filter(|v| v % 2 == 0), rec.clone())
      .detach();
    assert_eq!(rec.values(), vec![2]);
    assert_eq!(rec.terminal_count(), 1);
    assert!(ctx.ledger().is_balanced());
  }
}
