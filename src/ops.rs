//! Operators. Each module holds one node type and the observers it wires in.

use crate::{
  ack::{AckResolver, Signal},
  cancellable::{cancel_all, CancellableRef},
  certificate::Certificate,
};

pub mod buffer;
pub mod concat_map;
pub mod connect;
pub mod filter;
pub mod flat_map;
pub mod map;
pub mod merge;
pub mod share;
pub mod zip;

/// Effects of a combinator leaving its active phase, collected under its lock
/// and run once the lock is released.
#[derive(Default)]
pub(crate) struct Teardown {
  pub(crate) resolvers: Vec<AckResolver>,
  pub(crate) cancellables: Vec<CancellableRef>,
}

impl Teardown {
  /// Stop every producer waiting on an ack and cancel every live one.
  ///
  /// Returns the weight the cancelled producers released.
  pub(crate) fn run(self) -> Certificate {
    for resolver in self.resolvers {
      resolver.resolve(Signal::Stop);
    }
    cancel_all(&self.cancellables).unwrap_or_default()
  }
}
