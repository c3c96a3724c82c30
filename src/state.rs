//! Subscribe-time context and the two-phase subscription protocol.
//!
//! Subscribing a tree of [`FlowableNode`](crate::flowable::FlowableNode)s
//! happens in three passes over the same [`State`]:
//!
//! 1. **discovery** walks the tree once and counts how many downstream edges
//!    reach each shared node, registering forward-reference targets;
//! 2. **weight assignment** pushes the root weight top-down; a shared node
//!    waits until all of its edges were assigned and hands the summed weight
//!    to its upstream;
//! 3. **subscribe** wires the observers depth-first.
//!
//! The state is threaded by value through every `subscribe` call and is never
//! global: a fresh one is built for each top-level run and for each inner
//! stream a flattening operator subscribes.

use std::{
  any::Any,
  collections::HashMap,
  fmt,
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  },
};

use tracing::debug;

use crate::{
  cancellable::CancellableRef,
  certificate::{Certificate, Ledger, Weight},
  observer::ObserverRef,
  scheduler::{Scheduler, SchedulerRef, Trampoline},
};

// ============================================================================
// Runtime
// ============================================================================

/// The schedulers a run executes on. Cheap to clone; every combinator keeps
/// one.
#[derive(Clone)]
pub struct Runtime {
  trampoline: Arc<Trampoline>,
  scheduler: SchedulerRef,
}

impl Runtime {
  pub fn new(trampoline: Arc<Trampoline>, scheduler: SchedulerRef) -> Self {
    Self { trampoline, scheduler }
  }

  /// Runtime whose execution scheduler is the trampoline itself.
  pub fn current_thread(ledger: Arc<Ledger>) -> Self {
    let trampoline = Trampoline::new(ledger);
    Self { scheduler: trampoline.clone(), trampoline }
  }

  pub fn trampoline(&self) -> &Arc<Trampoline> { &self.trampoline }

  /// Scheduler used for timed work.
  pub fn scheduler(&self) -> &SchedulerRef { &self.scheduler }

  pub fn ledger(&self) -> &Arc<Ledger> { self.trampoline.ledger() }
}

impl fmt::Debug for Runtime {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Runtime").field("ledger", self.ledger()).finish()
  }
}

// ============================================================================
// Identities
// ============================================================================

/// Identity of a node, taken from the address of its shared allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
  pub fn of<T: ?Sized>(node: &Arc<T>) -> Self { NodeId(Arc::as_ptr(node) as *const () as usize) }
}

/// Indirection token naming a node that is referenced before, or from inside,
/// its own definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectToken(usize);

impl ConnectToken {
  pub fn new() -> Self {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    ConnectToken(NEXT.fetch_add(1, Ordering::Relaxed))
  }
}

impl Default for ConnectToken {
  fn default() -> Self { Self::new() }
}

// ============================================================================
// Subscribe arguments and result
// ============================================================================

/// The observer a node is subscribed with and the grant it takes over.
///
/// The grant is the node's share of the root weight. The node hands it back
/// upstream exactly once: in its terminal answer, its cancellation answer, or
/// the initial certificate of the subscription.
pub struct SubscribeArgs<V> {
  pub observer: ObserverRef<V>,
  pub grant: Certificate,
}

impl<V> SubscribeArgs<V> {
  pub fn new(observer: ObserverRef<V>, grant: Certificate) -> Self { Self { observer, grant } }

  pub fn weight(&self) -> Weight { self.grant.weight() }
}

/// What subscribing hands back: the handle to cancel with and the initial
/// certificate, carrying whatever weight the subscription released while it
/// was being wired.
#[must_use = "the certificate must be redeemed and the cancellable kept"]
pub struct SubscriptionResult {
  pub certificate: Certificate,
  pub cancellable: CancellableRef,
}

impl SubscriptionResult {
  pub fn new(certificate: Certificate, cancellable: CancellableRef) -> Self {
    Self { certificate, cancellable }
  }

  /// Redeem the initial certificate and keep only the cancellable.
  pub fn detach(self) -> CancellableRef {
    self.certificate.redeem();
    self.cancellable
  }
}

impl fmt::Debug for SubscriptionResult {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SubscriptionResult")
      .field("certificate", &self.certificate)
      .field("cancelled", &self.cancellable.is_cancelled())
      .finish()
  }
}

// ============================================================================
// State
// ============================================================================

struct SharedEntry {
  edges: usize,
  assigned: usize,
  weight: Weight,
  memory: Option<Box<dyn Any + Send>>,
}

/// Run-scoped subscribe context.
pub struct State {
  runtime: Runtime,
  shared: HashMap<NodeId, SharedEntry>,
  connectables: HashMap<ConnectToken, Box<dyn Any + Send + Sync>>,
}

impl State {
  pub fn new(runtime: Runtime) -> Self {
    Self { runtime, shared: HashMap::new(), connectables: HashMap::new() }
  }

  pub fn runtime(&self) -> &Runtime { &self.runtime }

  // ==================== Discovery ====================

  /// Count one more downstream edge into the shared node `id`.
  ///
  /// Returns `true` the first time the node is seen, in which case the caller
  /// continues discovery into its upstream.
  pub fn discover_shared(&mut self, id: NodeId) -> bool {
    let entry = self.shared.entry(id).or_insert(SharedEntry {
      edges: 0,
      assigned: 0,
      weight: 0,
      memory: None,
    });
    entry.edges += 1;
    debug!(node = ?id, edges = entry.edges, "shared node discovered");
    entry.edges == 1
  }

  /// Register the node reachable through `token`. Returns `false` if it was
  /// registered already, which is where discovery stops on a cycle.
  pub fn register_connectable<T>(&mut self, token: ConnectToken, target: T) -> bool
  where
    T: Any + Send + Sync,
  {
    if self.connectables.contains_key(&token) {
      return false;
    }
    self.connectables.insert(token, Box::new(target));
    true
  }

  /// The node registered for `token`.
  ///
  /// # Panics
  ///
  /// Panics if nothing was registered for `token` during discovery, or if it
  /// was registered with another type.
  pub fn connectable<T>(&self, token: ConnectToken) -> &T
  where
    T: Any + Send + Sync,
  {
    let Some(target) = self.connectables.get(&token) else {
      panic!("connect token {token:?} was never registered during discovery");
    };
    match target.downcast_ref::<T>() {
      Some(target) => target,
      None => panic!("connect token {token:?} registered with a different item type"),
    }
  }

  pub fn has_connectable(&self, token: ConnectToken) -> bool {
    self.connectables.contains_key(&token)
  }

  // ==================== Weight assignment ====================

  /// Add `weight` from one downstream edge of the shared node `id`.
  ///
  /// Returns the summed weight once the last edge was assigned, which is the
  /// moment the caller propagates into its upstream.
  ///
  /// # Panics
  ///
  /// Panics if `id` was never discovered, or if more edges are assigned than
  /// were discovered.
  pub fn assign_shared(&mut self, id: NodeId, weight: Weight) -> Option<Weight> {
    let Some(entry) = self.shared.get_mut(&id) else {
      panic!("weight assigned to shared node {id:?} that was never discovered");
    };
    assert!(
      entry.assigned < entry.edges,
      "shared node {id:?} assigned more edges than were discovered"
    );
    entry.assigned += 1;
    entry.weight += weight;
    debug!(node = ?id, weight, total = entry.weight, "shared node weight assigned");
    (entry.assigned == entry.edges).then_some(entry.weight)
  }

  /// Total weight of the shared node `id`.
  ///
  /// # Panics
  ///
  /// Panics unless every discovered edge was assigned.
  pub fn shared_weight(&self, id: NodeId) -> Weight {
    let Some(entry) = self.shared.get(&id) else {
      panic!("shared node {id:?} subscribed without discovery");
    };
    assert_eq!(
      entry.assigned, entry.edges,
      "shared node {id:?} subscribed before weight assignment finished"
    );
    entry.weight
  }

  /// Per-run memory of the shared node `id`, if one was stored.
  pub fn shared_memory<T: Any + Send>(&self, id: NodeId) -> Option<&T> {
    self
      .shared
      .get(&id)
      .and_then(|entry| entry.memory.as_ref())
      .and_then(|memory| memory.downcast_ref::<T>())
  }

  /// Store the per-run memory of the shared node `id`.
  pub fn set_shared_memory<T: Any + Send>(&mut self, id: NodeId, memory: T) {
    if let Some(entry) = self.shared.get_mut(&id) {
      entry.memory = Some(Box::new(memory));
    }
  }

  /// Shared node entries registered but whose edge count never matched the
  /// assigned count.
  pub fn unassigned_shared(&self) -> usize {
    self
      .shared
      .values()
      .filter(|entry| entry.assigned != entry.edges)
      .count()
  }
}
