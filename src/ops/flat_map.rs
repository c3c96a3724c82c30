use std::{panic::Location, sync::Arc};

use tracing::trace;

use crate::{
  ack::Ack,
  certificate::{keep_one, Certificate, Weight},
  error::{catch_operator, FlowError},
  flowable::{subscribe_inner, Flowable, FlowableNode},
  observer::Observer,
  ops::merge::{MergeChild, MergeCore, Origin},
  state::{State, SubscribeArgs, SubscriptionResult},
};

type Selector<V, U> = Arc<dyn Fn(V) -> Flowable<U> + Send + Sync>;

/// Concurrent flattening: every inner flowable runs as soon as its outer
/// value arrives, and their values are merged in arrival order.
///
/// The merge keeps one unit of the grant for itself; the outer source gets
/// the rest. Inner streams are subscribed with an empty grant.
pub struct FlatMapNode<V, U> {
  source: Flowable<V>,
  f: Selector<V, U>,
  location: &'static Location<'static>,
}

impl<V, U> FlatMapNode<V, U> {
  pub fn new<F>(source: Flowable<V>, f: F, location: &'static Location<'static>) -> Self
  where
    F: Fn(V) -> Flowable<U> + Send + Sync + 'static,
  {
    Self { source, f: Arc::new(f), location }
  }
}

impl<V: Send + 'static, U: Send + 'static> FlowableNode<U> for FlatMapNode<V, U> {
  fn discover(&self, state: &mut State) -> Weight { self.source.discover(state) + 1 }

  fn assign_weight(&self, state: &mut State, weight: Weight) {
    self.source.assign_weight(state, weight - weight.min(1))
  }

  fn subscribe(&self, state: State, args: SubscribeArgs<U>) -> (State, SubscriptionResult) {
    let (own, rest) = keep_one(args.grant);
    let core = MergeCore::new(state.runtime().clone(), args.observer, own);
    let outer = FlatMapOuter { core: core.clone(), f: self.f.clone(), location: self.location };
    let (state, result) = self
      .source
      .subscribe(state, SubscribeArgs::new(Arc::new(outer), rest));
    core.set_upstream(result.cancellable);
    (state, SubscriptionResult::new(result.certificate, core))
  }
}

struct FlatMapOuter<V, U> {
  core: Arc<MergeCore<U>>,
  f: Selector<V, U>,
  location: &'static Location<'static>,
}

impl<V, U: Send + 'static> FlatMapOuter<V, U> {
  /// Start the inner flowable for `value`. `false` once the merge is over.
  fn spawn(&self, value: V) -> bool {
    if self.core.is_terminated() {
      return false;
    }
    let inner = match catch_operator("flat_map", self.location, || (self.f)(value)) {
      Ok(inner) => inner,
      Err(err) => {
        self.core.fail(Origin::Upstream, err).redeem();
        return false;
      }
    };
    let Some(id) = self.core.add_child() else {
      return false;
    };
    trace!(inner = id, "flat_map inner started");
    let runtime = self.core.runtime().clone();
    let child = Arc::new(MergeChild { core: self.core.clone(), id });
    let result = runtime
      .trampoline()
      .hold(|| subscribe_inner(&runtime, &inner, child, Certificate::empty()));
    self.core.set_child_cancellable(id, result.detach());
    true
  }

  fn seal(&self) -> Certificate { self.core.seal().unwrap_or_default() }
}

impl<V: Send, U: Send + 'static> Observer<V> for FlatMapOuter<V, U> {
  fn on_next(&self, value: V) -> Ack {
    if self.spawn(value) {
      Ack::proceed()
    } else {
      Ack::stop()
    }
  }

  fn on_next_and_complete(&self, value: V) -> Certificate {
    if !self.spawn(value) {
      return Certificate::empty();
    }
    self.seal()
  }

  fn on_completed(&self) -> Certificate { self.seal() }

  fn on_error(&self, err: FlowError) -> Certificate { self.core.fail(Origin::Upstream, err) }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use crate::{
    context::{RunConfig, RunContext},
    error::FlowError,
    observer::RecordingObserver,
    sources,
  };

  fn ms(n: u64) -> Duration { Duration::from_millis(n) }

  #[test]
  fn runs_inners_concurrently() {
    let (ctx, scheduler) = RunContext::with_test_scheduler();
    let rec = RecordingObserver::new(ctx.runtime()).into_ref();
    let source = sources::of(vec![30_u64, 10, 20]).flat_map(|delay| {
      sources::timeline(vec![(Duration::from_millis(delay), delay)], None)
    });
    ctx.subscribe(&source, rec.clone()).detach();
    scheduler.flush();

    assert_eq!(
      rec.timed_values(),
      vec![(ms(10), 10), (ms(20), 20), (ms(30), 30)]
    );
    assert_eq!(rec.completed_at(), Some(ms(30)));
    assert_eq!(rec.terminal_count(), 1);
    assert!(ctx.ledger().is_balanced());
  }

  #[test]
  fn completes_only_after_every_inner() {
    let (ctx, scheduler) = RunContext::with_test_scheduler();
    let rec = RecordingObserver::new(ctx.runtime()).into_ref();
    let source = sources::of(vec![1, 2])
      .flat_map(|v| sources::timeline(vec![(ms(5), v), (ms(50), v * 10)], None));
    ctx.subscribe(&source, rec.clone()).detach();
    scheduler.advance_to(ms(10));
    assert!(!rec.is_completed());
    scheduler.flush();

    assert_eq!(rec.values().len(), 4);
    assert!(rec.is_completed());
    assert!(ctx.ledger().is_balanced());
  }

  #[test]
  fn inner_error_cancels_siblings() {
    let (ctx, scheduler) = RunContext::with_test_scheduler();
    let rec = RecordingObserver::new(ctx.runtime()).into_ref();
    let source = sources::of(vec![1, 2]).flat_map(|v| {
      if v == 2 {
        sources::throw(FlowError::message("inner failed"))
      } else {
        sources::timeline(vec![(ms(5), v)], None)
      }
    });
    ctx.subscribe(&source, rec.clone()).detach();
    scheduler.flush();

    assert!(rec.values().is_empty());
    assert_eq!(
      rec.error().map(|e| e.to_string()),
      Some("inner failed".to_string())
    );
    assert_eq!(rec.terminal_count(), 1);
    assert!(ctx.ledger().is_balanced());
  }

  #[test]
  fn panicking_selector_stops_outer() {
    let ctx = RunContext::new(RunConfig::default());
    let rec = RecordingObserver::<i32>::new(ctx.runtime()).into_ref();
    let source = sources::from_iter(1..=3).flat_map(|v| {
      if v == 2 {
        panic!("no inner for two");
      }
      sources::of(vec![v])
    });
    ctx.subscribe(&source, rec.clone()).detach();

    assert_eq!(rec.values(), vec![1]);
    assert_eq!(rec.error().map(|e| e.as_label()), Some("operator"));
    assert_eq!(rec.terminal_count(), 1);
    assert!(ctx.ledger().is_balanced());
  }

  #[test]
  fn cancel_hands_back_the_merge_unit() {
    let (ctx, scheduler) = RunContext::with_test_scheduler();
    let rec = RecordingObserver::new(ctx.runtime()).into_ref();
    let source = sources::of(vec![1, 2]).flat_map(|v| sources::timeline(vec![(ms(5), v)], None));
    let cancellable = ctx.subscribe(&source, rec.clone()).detach();
    scheduler.advance_to(ms(2));
    // the outer completed already and returned its share
    assert_eq!(cancellable.cancel().redeem(), 1);
    scheduler.flush();

    assert!(rec.values().is_empty());
    assert_eq!(ctx.ledger().minted(), 2);
    assert!(ctx.ledger().is_balanced());
  }
}
