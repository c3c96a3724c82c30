//! Integration tests: timed scenarios across combinators.
//!
//! Times are virtual milliseconds on a `TestScheduler`.

use std::{
  sync::{Arc, Mutex},
  time::Duration,
};

use rxflow::prelude::*;
use tracing_subscriber::EnvFilter;

fn ms(n: u64) -> Duration { Duration::from_millis(n) }

/// Route combinator traces to the test output, filtered by `RUST_LOG`.
fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

#[test]
fn merge_interleaves_by_arrival_and_waits_for_both() {
  init_tracing();
  let (ctx, scheduler) = RunContext::with_test_scheduler();
  let rec = RecordingObserver::new(ctx.runtime()).into_ref();
  let a = sources::timeline(vec![(ms(10), 1), (ms(20), 2)], None);
  let b = sources::timeline(vec![(ms(15), 3), (ms(20), 4)], Some(ms(30)));
  ctx.subscribe(&a.merge(b), rec.clone()).detach();

  scheduler.advance_to(ms(25));
  assert_eq!(rec.values(), vec![1, 3, 2, 4]);
  assert!(!rec.is_completed());

  scheduler.flush();
  assert_eq!(rec.completed_at(), Some(ms(30)));
  assert_eq!(rec.terminal_count(), 1);
  assert!(rec.violations().is_empty());
  assert!(ctx.ledger().is_balanced());
}

#[test]
fn zip_pairs_rounds_and_ends_with_the_shorter_source() {
  let (ctx, scheduler) = RunContext::with_test_scheduler();
  let rec = RecordingObserver::new(ctx.runtime()).into_ref();
  let a = sources::timeline(vec![(ms(10), 1), (ms(20), 2)], None);
  let b = sources::timeline(vec![(ms(0), 1), (ms(0), 2), (ms(30), 3)], None);
  ctx.subscribe(&a.zip(b), rec.clone()).detach();
  scheduler.flush();

  assert_eq!(
    rec.timed_values(),
    vec![(ms(10), (1, 1)), (ms(20), (2, 2))]
  );
  assert_eq!(rec.completed_at(), Some(ms(20)));
  assert_eq!(rec.terminal_count(), 1);
  assert!(ctx.ledger().is_balanced());
}

#[test]
fn concat_map_subscribes_next_inner_after_completion() {
  let (ctx, scheduler) = RunContext::with_test_scheduler();
  let rec = RecordingObserver::new(ctx.runtime()).into_ref();
  let source = sources::of(vec![0, 1]).concat_map(|i| {
    if i == 0 {
      sources::timeline(vec![(ms(5), 'a'), (ms(10), 'b')], Some(ms(20)))
    } else {
      sources::timeline(vec![(ms(0), 'c')], None)
    }
  });
  ctx.subscribe(&source, rec.clone()).detach();
  scheduler.flush();

  assert_eq!(
    rec.timed_values(),
    vec![(ms(5), 'a'), (ms(10), 'b'), (ms(20), 'c')]
  );
  assert_eq!(rec.completed_at(), Some(ms(20)));
  assert!(ctx.ledger().is_balanced());
}

#[test]
fn share_fan_out_with_differently_paced_subscribers() {
  let (ctx, scheduler) = RunContext::with_test_scheduler();
  let rec = RecordingObserver::new(ctx.runtime())
    .with_ack_delay(ms(1))
    .into_ref();
  let shared = sources::of(vec![1, 2]).share();
  let prompt = shared.clone().map(|v| ('a', v));
  // one scheduler hop behind the other subscriber
  let delayed = shared.concat_map(|v| sources::timeline(vec![(ms(0), ('b', v))], None));
  ctx.subscribe(&prompt.merge(delayed), rec.clone()).detach();
  scheduler.flush();

  let received = |tag| {
    rec
      .values()
      .into_iter()
      .filter_map(|(t, v)| (t == tag).then_some(v))
      .collect::<Vec<_>>()
  };
  assert_eq!(received('a'), vec![1, 2]);
  assert_eq!(received('b'), vec![1, 2]);
  assert!(rec.is_completed());
  assert_eq!(rec.terminal_count(), 1);
  assert!(rec.violations().is_empty());
  assert!(ctx.ledger().is_balanced());
}

#[test]
fn flat_map_through_buffer_keeps_every_value() {
  let (ctx, scheduler) = RunContext::with_test_scheduler();
  let rec = RecordingObserver::new(ctx.runtime())
    .with_ack_delay(ms(3))
    .into_ref();
  let source = sources::of(vec![1u64, 2, 3])
    .flat_map(|i| sources::timeline(vec![(ms(i), i), (ms(i + 5), i * 10)], None))
    .buffer();
  ctx.subscribe(&source, rec.clone()).detach();
  scheduler.flush();

  let mut values = rec.values();
  values.sort_unstable();
  assert_eq!(values, vec![1, 2, 3, 10, 20, 30]);
  assert_eq!(rec.terminal_count(), 1);
  assert!(rec.violations().is_empty());
  assert!(ctx.ledger().is_balanced());
}

#[test]
fn terminal_calls_happen_at_most_once() {
  init_tracing();
  let boom = || sources::throw::<i32>(FlowError::message("boom"));
  let pipelines: Vec<(&str, Flowable<i32>)> = vec![
    ("merge", merge_all(vec![boom(), sources::of(vec![1, 2]), boom()])),
    ("zip", zip_all(vec![sources::of(vec![1, 2]), boom()]).map(|r| r[0])),
    ("flat_map", sources::of(vec![1, 2, 3]).flat_map(move |_| boom())),
    ("concat_map", sources::of(vec![1, 2]).concat_map(|v| sources::of(vec![v]))),
    ("buffer", boom().buffer()),
    ("share", {
      let shared = boom().share();
      shared.clone().merge(shared)
    }),
    ("try_map", sources::of(vec![1, 2, 3]).try_map(|v| if v < 2 { Ok(v) } else { Err("two") })),
  ];

  for (name, flowable) in pipelines {
    let (ctx, scheduler) = RunContext::with_test_scheduler();
    let rec = RecordingObserver::new(ctx.runtime())
      .with_ack_delay(ms(1))
      .into_ref();
    ctx.subscribe(&flowable, rec.clone()).detach();
    scheduler.flush();

    assert_eq!(rec.terminal_count(), 1, "{name}");
    assert!(rec.violations().is_empty(), "{name}: {:?}", rec.violations());
    assert!(ctx.ledger().is_balanced(), "{name}: {:?}", ctx.ledger());
  }
}

#[test]
fn panicking_sink_is_failed_with_an_execution_error() {
  init_tracing();
  let (ctx, scheduler) = RunContext::with_test_scheduler();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let failures = Arc::new(Mutex::new(Vec::new()));
  let (s, f) = (seen.clone(), failures.clone());
  let sink = SinkObserver::new(move |v: i32| {
    assert!(v < 3, "sink cannot take {v}");
    s.lock().unwrap().push(v);
  })
  .on_error_with(move |err| f.lock().unwrap().push(err.as_label()));
  let a = sources::timeline(vec![(ms(1), 1), (ms(3), 3)], None);
  let b = sources::timeline(vec![(ms(2), 2), (ms(4), 4)], None);
  ctx.subscribe(&a.merge(b), Arc::new(sink)).detach();
  scheduler.flush();

  assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
  assert_eq!(*failures.lock().unwrap(), vec!["execution"]);
  assert!(ctx.ledger().is_balanced(), "{:?}", ctx.ledger());
}
