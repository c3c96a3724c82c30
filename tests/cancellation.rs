//! Integration tests: cancelling from several handles and threads.

use std::{
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  },
  thread,
};

use rxflow::prelude::*;

/// A source that never emits and counts how often cancellation reaches it.
struct IdleSource {
  cancels: Arc<AtomicUsize>,
}

struct IdleHandle {
  flag: CancellationFlag,
  cancels: Arc<AtomicUsize>,
}

impl Cancellable for IdleHandle {
  fn cancel(&self) -> Certificate {
    self.cancels.fetch_add(1, Ordering::SeqCst);
    self.flag.cancel()
  }

  fn is_cancelled(&self) -> bool { self.flag.is_cancelled() }
}

impl FlowableNode<u32> for IdleSource {
  fn discover(&self, _: &mut State) -> Weight { 1 }

  fn assign_weight(&self, _: &mut State, _: Weight) {}

  fn subscribe(&self, state: State, args: SubscribeArgs<u32>) -> (State, SubscriptionResult) {
    let handle = IdleHandle {
      flag: CancellationFlag::new(args.grant),
      cancels: self.cancels.clone(),
    };
    (state, SubscriptionResult::new(Certificate::empty(), Arc::new(handle)))
  }
}

fn idle() -> (Flowable<u32>, Arc<AtomicUsize>) {
  let cancels = Arc::new(AtomicUsize::new(0));
  (Flowable::new(IdleSource { cancels: cancels.clone() }), cancels)
}

#[test]
fn concurrent_cancel_propagates_once() {
  let ctx = RunContext::new(RunConfig::default());
  let rec = RecordingObserver::new(ctx.runtime()).into_ref();
  let (left, left_cancels) = idle();
  let (right, right_cancels) = idle();
  let cancellable = ctx
    .subscribe(&left.merge(right).buffer(), rec.clone())
    .detach();

  let mut weights: Vec<Weight> = (0..2)
    .map(|_| {
      let cancellable = cancellable.clone();
      thread::spawn(move || cancellable.cancel().redeem())
    })
    .collect::<Vec<_>>()
    .into_iter()
    .map(|handle| handle.join().unwrap())
    .collect();
  weights.sort_unstable();

  // two idle leaves plus the unit the buffer keeps for itself
  assert_eq!(weights, vec![0, 3]);
  assert_eq!(left_cancels.load(Ordering::SeqCst), 1);
  assert_eq!(right_cancels.load(Ordering::SeqCst), 1);
  assert!(cancellable.is_cancelled());
  assert_eq!(rec.terminal_count(), 0);
  assert_eq!(ctx.ledger().minted(), 3);
  assert!(ctx.ledger().is_balanced(), "{:?}", ctx.ledger());
}

#[test]
fn repeated_cancel_returns_the_weight_once() {
  let ctx = RunContext::new(RunConfig::default().weight(3));
  let rec = RecordingObserver::new(ctx.runtime()).into_ref();
  let (source, cancels) = idle();
  let shared = source.share();
  let cancellable = ctx
    .subscribe(&shared.clone().zip(shared), rec.clone())
    .detach();

  assert_eq!(cancellable.cancel().redeem(), 3);
  assert_eq!(cancellable.cancel().redeem(), 0);
  assert_eq!(cancels.load(Ordering::SeqCst), 1);
  assert!(ctx.ledger().is_balanced(), "{:?}", ctx.ledger());
}

#[test]
fn cancel_after_completion_is_answered_without_effect() {
  let ctx = RunContext::new(RunConfig::default());
  let rec = RecordingObserver::new(ctx.runtime()).into_ref();
  let cancellable = ctx
    .subscribe(&sources::of(vec![1, 2]).concat_map(|v| sources::of(vec![v])), rec.clone())
    .detach();
  assert!(rec.is_completed());

  assert_eq!(cancellable.cancel().redeem(), 0);
  assert_eq!(rec.values(), vec![1, 2]);
  assert_eq!(rec.terminal_count(), 1);
  assert!(ctx.ledger().is_balanced());
}

#[test]
fn certificates_of_a_run_sum_to_its_weight() {
  let ctx = RunContext::new(RunConfig::default().weight(3));
  let rec = RecordingObserver::new(ctx.runtime()).into_ref();
  let result = ctx.subscribe(&sources::of(vec![1, 2]).map(|v| v * 2), rec.clone());
  let cancellable = result.detach();
  assert_eq!(rec.values(), vec![2, 4]);
  assert!(rec.is_completed());

  assert_eq!(cancellable.cancel().redeem(), 0);
  assert_eq!(cancellable.cancel().redeem(), 0);
  assert_eq!(ctx.ledger().minted(), 3);
  assert_eq!(ctx.ledger().redeemed(), 3);
  assert_eq!(ctx.ledger().leaked(), 0);
  assert!(ctx.ledger().is_balanced());
}
