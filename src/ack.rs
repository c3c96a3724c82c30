//! Acknowledgments: the continuation returned by `on_next`.
//!
//! An [`Ack`] resolves exactly once, with a [`Signal`] telling the producer
//! whether the consumer wants the next value. It is either already resolved
//! when returned, or pending until the matching [`AckResolver`] fires.
//!
//! Producers never block on an `Ack`. They attach a continuation with
//! [`Ack::then`], which always resumes through the trampoline. Whatever weight
//! the continuation will release stays with the producer's own state, so a
//! continuation that never runs loses nothing.

use std::{fmt, mem, sync::Arc};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::{
  certificate::Certificate,
  scheduler::{Scheduler, Trampoline},
};

/// What the consumer asks of the producer once an item was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
  /// Send the next value.
  Continue,
  /// The consumer terminated or cancelled; send nothing more.
  Stop,
}

type Continuation = Box<dyn FnOnce(Signal) -> Certificate + Send>;

enum Slot {
  Waiting,
  Resolved(Signal),
  Attached(Continuation),
  Done,
}

impl fmt::Debug for Slot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Slot::Waiting => f.write_str("Waiting"),
      Slot::Resolved(signal) => write!(f, "Resolved({signal:?})"),
      Slot::Attached(_) => f.write_str("Attached"),
      Slot::Done => f.write_str("Done"),
    }
  }
}

// ============================================================================
// Ack
// ============================================================================

#[must_use = "an ack must be continued with `then`"]
pub struct Ack(AckInner);

enum AckInner {
  Ready(Signal),
  Pending(Arc<Mutex<Slot>>),
}

impl Ack {
  /// Already resolved: ready for the next value.
  pub fn proceed() -> Self { Ack(AckInner::Ready(Signal::Continue)) }

  /// Already resolved: no more values wanted.
  pub fn stop() -> Self { Ack(AckInner::Ready(Signal::Stop)) }

  pub fn ready(signal: Signal) -> Self { Ack(AckInner::Ready(signal)) }

  /// A pending ack and the handle that resolves it.
  pub fn pending(trampoline: &Arc<Trampoline>) -> (Ack, AckResolver) {
    let slot = Arc::new(Mutex::new(Slot::Waiting));
    let resolver = AckResolver { slot: Some(slot.clone()), trampoline: trampoline.clone() };
    (Ack(AckInner::Pending(slot)), resolver)
  }

  /// The signal, if the ack is already resolved.
  pub fn peek(&self) -> Option<Signal> {
    match &self.0 {
      AckInner::Ready(signal) => Some(*signal),
      AckInner::Pending(slot) => match &*slot.lock() {
        Slot::Resolved(signal) => Some(*signal),
        _ => None,
      },
    }
  }

  /// Attach the continuation `k`, run on `trampoline` once the ack resolves.
  ///
  /// The certificate `k` returns is redeemed by the trampoline.
  pub fn then<F>(self, trampoline: &Arc<Trampoline>, k: F)
  where
    F: FnOnce(Signal) -> Certificate + Send + 'static,
  {
    let signal = match self.0 {
      AckInner::Ready(signal) => signal,
      AckInner::Pending(slot) => {
        let mut slot = slot.lock();
        match mem::replace(&mut *slot, Slot::Done) {
          Slot::Waiting => {
            *slot = Slot::Attached(Box::new(k));
            trampoline.ledger().suspend();
            trace!("continuation suspended");
            return;
          }
          Slot::Resolved(signal) => signal,
          other => unreachable!("ack continued twice: {other:?}"),
        }
      }
    };
    trampoline.schedule(Box::new(move || k(signal)), None);
  }
}

impl fmt::Debug for Ack {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("Ack").field(&self.peek()).finish()
  }
}

// ============================================================================
// AckResolver
// ============================================================================

/// Resolves a pending [`Ack`]. Dropping it unresolved resolves with
/// [`Signal::Stop`].
pub struct AckResolver {
  slot: Option<Arc<Mutex<Slot>>>,
  trampoline: Arc<Trampoline>,
}

impl AckResolver {
  /// Resolve the ack, resuming the attached continuation on the trampoline.
  pub fn resolve(mut self, signal: Signal) {
    if let Some(slot) = self.slot.take() {
      resolve_slot(&slot, &self.trampoline, signal);
    }
  }
}

fn resolve_slot(slot: &Mutex<Slot>, trampoline: &Arc<Trampoline>, signal: Signal) {
  let attached = {
    let mut slot = slot.lock();
    match mem::replace(&mut *slot, Slot::Done) {
      Slot::Waiting => {
        *slot = Slot::Resolved(signal);
        None
      }
      Slot::Attached(k) => Some(k),
      other => unreachable!("ack resolved twice: {other:?}"),
    }
  };
  if let Some(k) = attached {
    trampoline.ledger().resume();
    trampoline.schedule(Box::new(move || k(signal)), None);
  }
}

impl Drop for AckResolver {
  fn drop(&mut self) {
    if let Some(slot) = self.slot.take() {
      warn!("ack resolver dropped unresolved; stopping producer");
      resolve_slot(&slot, &self.trampoline, Signal::Stop);
    }
  }
}

impl fmt::Debug for AckResolver {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AckResolver")
      .field("resolved", &self.slot.is_none())
      .finish()
  }
}
