//! Cooperative cancellation handles.
//!
//! A [`Cancellable`] is owned by the subscriber of an active subscription.
//! Cancelling is idempotent: the first call stops the subscription and hands
//! back the weight it still held; later calls answer with an empty
//! certificate and propagate nothing.

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use parking_lot::Mutex;
use tracing::debug;

use crate::certificate::{Certificate, Weight};

/// Handle used to request early termination of a subscription.
pub trait Cancellable: Send + Sync {
  /// Request termination, returning the weight the subscription released.
  fn cancel(&self) -> Certificate;

  fn is_cancelled(&self) -> bool;
}

pub type CancellableRef = Arc<dyn Cancellable>;

// ============================================================================
// CancellationFlag
// ============================================================================

struct FlagInner {
  cancelled: AtomicBool,
  held: Mutex<Option<Certificate>>,
}

/// A flag checked by sources before every emission and by schedulers before
/// running a task, holding the grant of the producer it guards.
///
/// The grant leaves the flag exactly once: through [`CancellationFlag::release`]
/// when the producer terminates, or through `cancel`.
#[derive(Clone)]
pub struct CancellationFlag {
  inner: Arc<FlagInner>,
}

impl CancellationFlag {
  pub fn new(grant: Certificate) -> Self {
    Self {
      inner: Arc::new(FlagInner {
        cancelled: AtomicBool::new(false),
        held: Mutex::new(Some(grant)),
      }),
    }
  }

  /// Set the flag, returning `true` only for the call that flipped it.
  pub fn set(&self) -> bool { !self.inner.cancelled.swap(true, Ordering::AcqRel) }

  /// Take the held grant; empty once it was taken.
  pub fn release(&self) -> Certificate { self.inner.held.lock().take().unwrap_or_default() }

  /// Weight still held.
  pub fn weight(&self) -> Weight { self.inner.held.lock().as_ref().map_or(0, Certificate::weight) }
}

impl Cancellable for CancellationFlag {
  fn cancel(&self) -> Certificate {
    if self.set() {
      debug!(weight = self.weight(), "cancellation flag set");
    }
    self.release()
  }

  fn is_cancelled(&self) -> bool { self.inner.cancelled.load(Ordering::Acquire) }
}

/// Cancel every handle in `children`, merging what they release.
pub fn cancel_all<'a, I>(children: I) -> Option<Certificate>
where
  I: IntoIterator<Item = &'a CancellableRef>,
{
  Certificate::merge_all(children.into_iter().map(|c| c.cancel()))
}
