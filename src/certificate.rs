//! Certificates: weighted proofs that a unit of work terminated exactly once.
//!
//! The weight of a run is minted once, when the root subscription starts, and
//! handed down the tree as grant certificates: fan-out nodes split them and
//! each producer holds its share until it terminates or is cancelled. The
//! share then travels back upstream through the terminal answer or the
//! cancellation answer and is redeemed. Nothing else creates weight, so the
//! certificates redeemed for a run sum to exactly its root weight.
//!
//! Consuming a certificate ([`Certificate::redeem`]) credits the ledger; a
//! certificate that is dropped while still carrying weight is recorded as a
//! leak. Reuse is impossible because every consuming operation takes `self`.
//!
//! ```rust
//! use rxflow::prelude::*;
//!
//! let ctx = RunContext::new(RunConfig::default().weight(3));
//! let rec = RecordingObserver::new(ctx.runtime()).into_ref();
//! let cancellable = ctx.subscribe(&sources::of(vec![1, 2]), rec.clone()).detach();
//!
//! // completion handed the whole weight back; nothing is left to cancel
//! assert_eq!(cancellable.cancel().redeem(), 0);
//! assert_eq!(ctx.ledger().minted(), 3);
//! assert_eq!(ctx.ledger().redeemed(), 3);
//! assert!(ctx.ledger().is_balanced());
//! ```

use std::{
  fmt,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
};

use smallvec::SmallVec;
use tracing::{trace, warn};

/// Integer budget of outstanding termination obligations.
pub type Weight = u64;

// ============================================================================
// Ledger
// ============================================================================

/// Run-scoped accounting of the weight minted for root subscriptions and of
/// every certificate consumed.
///
/// The ledger is the audit trail that makes a lost or duplicated obligation
/// observable: once a run is quiescent, `minted == redeemed`, nothing leaked
/// and no continuation is still suspended.
#[derive(Default)]
pub struct Ledger {
  minted: AtomicU64,
  redeemed: AtomicU64,
  leaked: AtomicU64,
  suspended: AtomicU64,
}

impl Ledger {
  pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

  /// Mint the root grant of a subscription.
  pub(crate) fn mint(self: &Arc<Self>, weight: Weight) -> Certificate {
    self.minted.fetch_add(weight, Ordering::AcqRel);
    trace!(weight, "root weight minted");
    Certificate { weight, ledger: Some(self.clone()) }
  }

  pub fn minted(&self) -> Weight { self.minted.load(Ordering::Acquire) }

  pub fn redeemed(&self) -> Weight { self.redeemed.load(Ordering::Acquire) }

  pub fn leaked(&self) -> Weight { self.leaked.load(Ordering::Acquire) }

  /// Number of continuations attached to an `Ack` that has not resolved yet.
  pub fn suspended(&self) -> u64 { self.suspended.load(Ordering::Acquire) }

  /// Weight minted but neither redeemed nor leaked.
  pub fn outstanding(&self) -> Weight {
    self
      .minted()
      .saturating_sub(self.redeemed())
      .saturating_sub(self.leaked())
  }

  /// `true` once every minted unit of weight was redeemed, nothing leaked and
  /// no continuation is left waiting.
  pub fn is_balanced(&self) -> bool {
    self.minted() == self.redeemed() && self.leaked() == 0 && self.suspended() == 0
  }

  pub(crate) fn suspend(&self) { self.suspended.fetch_add(1, Ordering::AcqRel); }

  pub(crate) fn resume(&self) { self.suspended.fetch_sub(1, Ordering::AcqRel); }

  fn credit(&self, weight: Weight) { self.redeemed.fetch_add(weight, Ordering::AcqRel); }

  fn record_leak(&self, weight: Weight) { self.leaked.fetch_add(weight, Ordering::AcqRel); }
}

impl fmt::Debug for Ledger {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Ledger")
      .field("minted", &self.minted())
      .field("redeemed", &self.redeemed())
      .field("leaked", &self.leaked())
      .field("suspended", &self.suspended())
      .finish()
  }
}

// ============================================================================
// Certificate
// ============================================================================

/// Proof that a unit of work reached a terminal state.
///
/// Exactly one owner at a time. Every consuming method takes `self`, so a
/// certificate can be resolved only once; dropping one that still carries
/// weight is reported to its ledger as a leak.
#[must_use = "a certificate must be redeemed, merged, or handed back upstream"]
pub struct Certificate {
  weight: Weight,
  // `None` for the empty certificate and once consumed, so `Drop` can tell a
  // leak from a resolution.
  ledger: Option<Arc<Ledger>>,
}

impl Certificate {
  /// The weightless certificate: the answer of a call that releases no
  /// obligation, such as a late call after termination.
  pub fn empty() -> Self { Certificate { weight: 0, ledger: None } }

  pub fn weight(&self) -> Weight { self.weight }

  pub fn is_empty(&self) -> bool { self.weight == 0 }

  /// Split off a certificate of `left` weight; the remainder keeps the rest.
  ///
  /// # Panics
  ///
  /// Panics if `left` exceeds this certificate's weight.
  pub fn split(mut self, left: Weight) -> (Certificate, Certificate) {
    assert!(
      left <= self.weight,
      "cannot split {left} out of a certificate of weight {}",
      self.weight
    );
    let ledger = self.ledger.take();
    let right = self.weight - left;
    (
      Certificate { weight: left, ledger: ledger.clone() },
      Certificate { weight: right, ledger },
    )
  }

  /// Split into `parts.len()` certificates with the given weights.
  ///
  /// # Panics
  ///
  /// Panics if the parts do not sum to this certificate's weight.
  pub fn split_into(mut self, parts: &[Weight]) -> SmallVec<[Certificate; 4]> {
    let total: Weight = parts.iter().sum();
    assert_eq!(total, self.weight, "split parts must sum to the certificate weight");
    let ledger = self.ledger.take();
    parts
      .iter()
      .map(|&weight| Certificate { weight, ledger: ledger.clone() })
      .collect()
  }

  /// Join two certificates into one carrying the summed weight.
  pub fn merge(mut self, mut other: Certificate) -> Certificate {
    let ledger = match (self.ledger.take(), other.ledger.take()) {
      (Some(ledger), Some(theirs)) => {
        debug_assert!(
          Arc::ptr_eq(&ledger, &theirs),
          "merging certificates of different ledgers"
        );
        Some(ledger)
      }
      (ledger, theirs) => ledger.or(theirs),
    };
    Certificate { weight: self.weight + other.weight, ledger }
  }

  /// Merge every certificate of `certs`, `None` if there are none.
  pub fn merge_all<I>(certs: I) -> Option<Certificate>
  where
    I: IntoIterator<Item = Certificate>,
  {
    certs.into_iter().reduce(Certificate::merge)
  }

  /// Consume the certificate, crediting its weight to the ledger.
  pub fn redeem(mut self) -> Weight {
    if let Some(ledger) = self.ledger.take() {
      ledger.credit(self.weight);
    }
    self.weight
  }
}

impl Default for Certificate {
  fn default() -> Self { Self::empty() }
}

impl Drop for Certificate {
  fn drop(&mut self) {
    if let Some(ledger) = self.ledger.take() {
      if self.weight > 0 {
        warn!(weight = self.weight, "certificate dropped without being redeemed");
        ledger.record_leak(self.weight);
      }
    }
  }
}

impl fmt::Debug for Certificate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Certificate").field("weight", &self.weight).finish()
  }
}

/// Split `total` into `n` parts as evenly as possible, the remainder going to
/// the leading parts.
pub fn split_weight(total: Weight, n: usize) -> SmallVec<[Weight; 4]> {
  if n == 0 {
    return SmallVec::new();
  }
  let n_w = n as Weight;
  let base = total / n_w;
  let extra = (total % n_w) as usize;
  (0..n)
    .map(|i| if i < extra { base + 1 } else { base })
    .collect()
}

/// Split a grant between a node that drives deliveries itself, which keeps
/// one unit, and its upstream, which gets the rest.
pub(crate) fn keep_one(grant: Certificate) -> (Certificate, Certificate) {
  let own = grant.weight().min(1);
  grant.split(own)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn split_and_merge_conserve_weight() {
    let ledger = Ledger::new();
    let (a, b) = ledger.mint(7).split(3);
    assert_eq!(a.weight(), 3);
    assert_eq!(b.weight(), 4);
    let joined = a.merge(b);
    assert_eq!(joined.weight(), 7);
    joined.redeem();
    assert_eq!(ledger.minted(), 7);
    assert_eq!(ledger.redeemed(), 7);
    assert!(ledger.is_balanced());
  }

  #[test]
  fn drop_is_recorded_as_leak() {
    let ledger = Ledger::new();
    drop(ledger.mint(2));
    assert_eq!(ledger.leaked(), 2);
    assert_eq!(ledger.outstanding(), 0);
    assert!(!ledger.is_balanced());
  }

  #[test]
  fn weightless_parts_never_leak() {
    let ledger = Ledger::new();
    let (none, all) = ledger.mint(2).split(0);
    drop(none);
    drop(Certificate::empty());
    assert_eq!(ledger.leaked(), 0);
    all.redeem();
    assert!(ledger.is_balanced());
  }

  #[test]
  fn empty_merges_into_either_side() {
    let ledger = Ledger::new();
    let joined = Certificate::empty().merge(ledger.mint(3));
    assert_eq!(joined.weight(), 3);
    assert_eq!(joined.merge(Certificate::empty()).redeem(), 3);
    assert!(ledger.is_balanced());
    assert_eq!(Certificate::empty().redeem(), 0);
  }

  #[test]
  #[should_panic(expected = "cannot split")]
  fn split_beyond_weight_panics() {
    let ledger = Ledger::new();
    let cert = ledger.mint(1);
    let _ = cert.split(2);
  }

  #[test]
  fn split_into_parts() {
    let ledger = Ledger::new();
    let parts = ledger.mint(6).split_into(&[1, 2, 3]);
    let weights: Vec<_> = parts.iter().map(Certificate::weight).collect();
    assert_eq!(weights, vec![1, 2, 3]);
    if let Some(joined) = Certificate::merge_all(parts) {
      joined.redeem();
    }
    assert!(ledger.is_balanced());
  }

  #[test]
  fn merge_all_of_nothing() {
    assert!(Certificate::merge_all(std::iter::empty()).is_none());
  }

  #[test]
  fn split_weight_spreads_remainder() {
    assert_eq!(split_weight(7, 3).as_slice(), &[3, 2, 2]);
    assert_eq!(split_weight(2, 2).as_slice(), &[1, 1]);
    assert!(split_weight(5, 0).is_empty());
  }

  #[test]
  fn keep_one_leaves_the_rest_upstream() {
    let ledger = Ledger::new();
    let (own, rest) = keep_one(ledger.mint(4));
    assert_eq!((own.weight(), rest.weight()), (1, 3));
    let (none, nothing) = keep_one(Certificate::empty());
    assert_eq!((none.weight(), nothing.weight()), (0, 0));
    own.merge(rest).redeem();
    assert!(ledger.is_balanced());
  }

  #[test]
  fn outstanding_tracks_live_certificates() {
    let ledger = Ledger::new();
    let cert = ledger.mint(4);
    assert_eq!(ledger.outstanding(), 4);
    cert.redeem();
    assert_eq!(ledger.outstanding(), 0);
  }
}
