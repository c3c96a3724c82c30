//! Forward references through a [`ConnectToken`].
//!
//! `connect_to` registers a shared node under a token during discovery;
//! `connected` resolves the token when subscribing. A connected edge adds no
//! shared-node edge and takes no weight, so a feedback loop built with it
//! is discovered once and never recursed into.

use crate::{
  certificate::Weight,
  flowable::{Flowable, FlowableNode},
  state::{ConnectToken, State, SubscribeArgs, SubscriptionResult},
};

pub struct ConnectTargetNode<V> {
  token: ConnectToken,
  target: Flowable<V>,
}

impl<V> ConnectTargetNode<V> {
  pub fn new(token: ConnectToken, target: Flowable<V>) -> Self { Self { token, target } }
}

impl<V: Send + 'static> FlowableNode<V> for ConnectTargetNode<V> {
  fn discover(&self, state: &mut State) -> Weight {
    state.register_connectable(self.token, self.target.clone());
    self.target.discover(state)
  }

  fn assign_weight(&self, state: &mut State, weight: Weight) {
    self.target.assign_weight(state, weight)
  }

  fn subscribe(&self, state: State, args: SubscribeArgs<V>) -> (State, SubscriptionResult) {
    self.target.subscribe(state, args)
  }
}

pub struct ConnectedNode {
  token: ConnectToken,
}

impl ConnectedNode {
  pub fn new(token: ConnectToken) -> Self { Self { token } }
}

impl<V: Send + 'static> FlowableNode<V> for ConnectedNode {
  fn discover(&self, _: &mut State) -> Weight { 0 }

  fn assign_weight(&self, _: &mut State, _: Weight) {}

  /// # Panics
  ///
  /// Panics if no `connect_to` with this token was discovered in the same
  /// run.
  fn subscribe(&self, state: State, args: SubscribeArgs<V>) -> (State, SubscriptionResult) {
    let target = state.connectable::<Flowable<V>>(self.token).clone();
    target.subscribe(state, args)
  }
}

#[cfg(test)]
mod tests {
  use crate::{
    context::{RunConfig, RunContext},
    flowable::Flowable,
    observer::RecordingObserver,
    sources,
    state::ConnectToken,
  };

  #[test]
  fn feedback_loop_through_token() {
    let ctx = RunContext::new(RunConfig::default());
    let rec = RecordingObserver::new(ctx.runtime()).into_ref();
    let token = ConnectToken::new();
    let feedback = Flowable::<i32>::connected(token)
      .filter(|v| *v < 4)
      .map(|v| v + 1);
    let looped = sources::of(vec![1]).merge(feedback).connect_to(token);
    ctx.subscribe(&looped, rec.clone()).detach();

    assert_eq!(rec.values(), vec![1, 2, 3, 4]);
    assert!(!rec.is_completed());
    assert!(rec.violations().is_empty());
  }

  #[test]
  fn forward_reference_before_target() {
    let ctx = RunContext::new(RunConfig::default());
    let rec = RecordingObserver::new(ctx.runtime()).into_ref();
    let token = ConnectToken::new();
    let early = Flowable::<i32>::connected(token).map(|v| v * 100);
    let target = sources::of(vec![1, 2]).connect_to(token);
    ctx
      .subscribe(&early.zip(target), rec.clone())
      .detach();

    assert_eq!(rec.values(), vec![(100, 1), (200, 2)]);
    assert!(rec.is_completed());
    assert!(ctx.ledger().is_balanced());
  }

  #[test]
  #[should_panic(expected = "never registered")]
  fn unregistered_token_panics() {
    let ctx = RunContext::new(RunConfig::default());
    let rec = RecordingObserver::<i32>::new(ctx.runtime()).into_ref();
    let _ = ctx.subscribe(&Flowable::connected(ConnectToken::new()), rec);
  }
}
