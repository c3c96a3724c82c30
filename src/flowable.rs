//! Flowable nodes: immutable descriptions of stream producers.
//!
//! A [`Flowable`] is a cheap, clonable handle to a [`FlowableNode`]. Operators
//! build new nodes that own their inputs, so a composed pipeline is a tree.
//! Cloning a handle does not copy the node: two clones of a shared node are
//! the same node, which is what multicast relies on.
//!
//! ```rust
//! use rxflow::prelude::*;
//!
//! let ctx = RunContext::new(RunConfig::default());
//! let rec = RecordingObserver::new(ctx.runtime()).into_ref();
//!
//! let source = sources::of(vec![1, 2, 3]).map(|v| v * 10);
//! ctx.subscribe(&source, rec.clone()).detach();
//!
//! assert_eq!(rec.values(), vec![10, 20, 30]);
//! assert!(rec.is_completed());
//! ```

use std::{fmt, panic::Location, sync::Arc};

use tracing::debug;

use crate::{
  certificate::{Certificate, Weight},
  observer::ObserverRef,
  ops::{
    buffer::BufferNode,
    concat_map::ConcatMapNode,
    connect::{ConnectTargetNode, ConnectedNode},
    filter::FilterNode,
    flat_map::FlatMapNode,
    map::MapNode,
    merge::MergeNode,
    share::ShareNode,
    zip::{zip_pair, ZipNode},
  },
  state::{ConnectToken, NodeId, Runtime, State, SubscribeArgs, SubscriptionResult},
};

/// A producer description. Nodes are never mutated after construction.
pub trait FlowableNode<V>: Send + Sync {
  /// Discovery pass: register shared nodes and connect targets below this one.
  ///
  /// Returns the weight this subtree asks for, one per independent producer.
  fn discover(&self, state: &mut State) -> Weight;

  /// Weight-assignment pass: push `weight` down to the children.
  fn assign_weight(&self, state: &mut State, weight: Weight);

  /// Wire `args.observer` to this node, handing it `args.grant`.
  fn subscribe(&self, state: State, args: SubscribeArgs<V>) -> (State, SubscriptionResult);
}

/// Handle to a [`FlowableNode`].
pub struct Flowable<V>(Arc<dyn FlowableNode<V>>);

impl<V> Clone for Flowable<V> {
  fn clone(&self) -> Self { Flowable(self.0.clone()) }
}

impl<V> fmt::Debug for Flowable<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("Flowable").field(&self.id()).finish()
  }
}

impl<V> Flowable<V> {
  pub fn id(&self) -> NodeId { NodeId::of(&self.0) }

  pub fn discover(&self, state: &mut State) -> Weight { self.0.discover(state) }

  pub fn assign_weight(&self, state: &mut State, weight: Weight) {
    self.0.assign_weight(state, weight)
  }

  pub fn subscribe(&self, state: State, args: SubscribeArgs<V>) -> (State, SubscriptionResult) {
    self.0.subscribe(state, args)
  }
}

impl<V: Send + 'static> Flowable<V> {
  pub fn new(node: impl FlowableNode<V> + 'static) -> Self { Flowable(Arc::new(node)) }

  // ==================== Multicast ====================

  /// Serve every downstream subscriber from one upstream subscription.
  pub fn share(self) -> Flowable<V>
  where
    V: Clone,
  {
    Flowable::new(ShareNode::new(self))
  }

  /// Register this flowable under `token` so that
  /// [`Flowable::connected`] can reach it without owning it.
  pub fn connect_to(self, token: ConnectToken) -> Flowable<V>
  where
    V: Clone,
  {
    Flowable::new(ConnectTargetNode::new(token, self.share()))
  }

  /// Forward reference to the flowable registered under `token`.
  pub fn connected(token: ConnectToken) -> Flowable<V>
  where
    V: Clone,
  {
    Flowable::new(ConnectedNode::new(token))
  }

  // ==================== Fan-in ====================

  /// Interleave both sources in arrival order.
  pub fn merge(self, other: Flowable<V>) -> Flowable<V> { merge_all(vec![self, other]) }

  /// Pair values by position; ends with the shorter source.
  #[track_caller]
  pub fn zip<U>(self, other: Flowable<U>) -> Flowable<(V, U)>
  where
    U: Send + 'static,
  {
    zip_pair(self, other)
  }

  // ==================== Flattening ====================

  /// Map each value to a flowable and run those strictly one after another.
  #[track_caller]
  pub fn concat_map<U, F>(self, f: F) -> Flowable<U>
  where
    U: Send + 'static,
    F: Fn(V) -> Flowable<U> + Send + Sync + 'static,
  {
    Flowable::new(ConcatMapNode::new(self, f, Location::caller()))
  }

  /// Map each value to a flowable and run those concurrently.
  #[track_caller]
  pub fn flat_map<U, F>(self, f: F) -> Flowable<U>
  where
    U: Send + 'static,
    F: Fn(V) -> Flowable<U> + Send + Sync + 'static,
  {
    Flowable::new(FlatMapNode::new(self, f, Location::caller()))
  }

  // ==================== Decoupling ====================

  /// Acknowledge upstream at once and deliver downstream at its own pace.
  pub fn buffer(self) -> Flowable<V> { Flowable::new(BufferNode::new(self)) }

  // ==================== Transforms ====================

  #[track_caller]
  pub fn map<U, F>(self, f: F) -> Flowable<U>
  where
    U: Send + 'static,
    F: Fn(V) -> U + Send + Sync + 'static,
  {
    Flowable::new(MapNode::new(self, move |v| Ok(f(v)), Location::caller()))
  }

  /// Like [`Flowable::map`], with a selector that may fail.
  #[track_caller]
  pub fn try_map<U, E, F>(self, f: F) -> Flowable<U>
  where
    U: Send + 'static,
    E: fmt::Display,
    F: Fn(V) -> Result<U, E> + Send + Sync + 'static,
  {
    Flowable::new(MapNode::new(
      self,
      move |v| f(v).map_err(|e| e.to_string()),
      Location::caller(),
    ))
  }

  #[track_caller]
  pub fn filter<F>(self, f: F) -> Flowable<V>
  where
    F: Fn(&V) -> bool + Send + Sync + 'static,
  {
    Flowable::new(FilterNode::new(self, f, Location::caller()))
  }
}

/// Merge any number of flowables.
pub fn merge_all<V: Send + 'static>(sources: Vec<Flowable<V>>) -> Flowable<V> {
  Flowable::new(MergeNode::new(sources))
}

/// Zip any number of flowables into rounds ordered by source index.
pub fn zip_all<V: Send + 'static>(sources: Vec<Flowable<V>>) -> Flowable<Vec<V>> {
  Flowable::new(ZipNode::new(sources))
}

/// Run the two-phase subscribe of `flowable` on a fresh [`State`], minting
/// the root weight of the run.
///
/// `weight` defaults to what discovery asks for, minimum 1.
pub fn subscribe_root<V>(
  runtime: &Runtime, flowable: &Flowable<V>, observer: ObserverRef<V>, weight: Option<Weight>,
) -> SubscriptionResult {
  let mut state = State::new(runtime.clone());
  let demand = flowable.discover(&mut state);
  let weight = weight.unwrap_or(demand.max(1));
  debug!(node = ?flowable.id(), demand, weight, "subscribing");
  let grant = runtime.ledger().mint(weight);
  wire(state, flowable, observer, grant)
}

/// Subscribe an inner stream started by a flattening operator, handing it
/// `grant` instead of minting.
pub(crate) fn subscribe_inner<V>(
  runtime: &Runtime, flowable: &Flowable<V>, observer: ObserverRef<V>, grant: Certificate,
) -> SubscriptionResult {
  let mut state = State::new(runtime.clone());
  let demand = flowable.discover(&mut state);
  debug!(node = ?flowable.id(), demand, weight = grant.weight(), "subscribing inner stream");
  wire(state, flowable, observer, grant)
}

fn wire<V>(
  mut state: State, flowable: &Flowable<V>, observer: ObserverRef<V>, grant: Certificate,
) -> SubscriptionResult {
  flowable.assign_weight(&mut state, grant.weight());
  assert_eq!(
    state.unassigned_shared(),
    0,
    "shared nodes discovered but never weight-assigned"
  );
  let (_, result) = flowable.subscribe(state, SubscribeArgs::new(observer, grant));
  result
}
