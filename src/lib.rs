//! # rxflow: push-based reactive streams with per-item backpressure
//!
//! Every value is acknowledged before the next one is pushed, and every
//! subscription proves its termination by redeeming a [`Certificate`] against
//! a shared [`Ledger`]. A run whose ledger balances terminated completely.
//!
//! ## Quick Start
//!
//! ```rust
//! use rxflow::prelude::*;
//!
//! let ctx = RunContext::new(RunConfig::default());
//! let rec = RecordingObserver::new(ctx.runtime()).into_ref();
//!
//! let source = sources::of(vec![1, 2, 3])
//!   .merge(sources::of(vec![4]))
//!   .filter(|v| v % 2 == 0);
//! ctx.subscribe(&source, rec.clone()).detach();
//!
//! assert_eq!(rec.values(), vec![2, 4]);
//! assert!(rec.is_completed());
//! assert!(ctx.ledger().is_balanced());
//! ```
//!
//! ## Key Concepts
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Flowable`] | Immutable, clonable description of a producer |
//! | [`Observer`] | Receives values and answers each with an [`Ack`] |
//! | [`Certificate`] | Weighted proof that part of a subscription terminated |
//! | [`Cancellable`] | Handle that stops a subscription and returns its certificate |
//! | [`RunContext`] | Owns the trampoline, scheduler and ledger of a run |
//!
//! ## Feature Flags
//!
//! - **`futures-scheduler`** (default): thread-pool scheduler on `futures`
//! - **`tokio-scheduler`**: scheduler on a tokio runtime handle
//!
//! [`Flowable`]: flowable::Flowable
//! [`Observer`]: observer::Observer
//! [`Ack`]: ack::Ack
//! [`Certificate`]: certificate::Certificate
//! [`Ledger`]: certificate::Ledger
//! [`Cancellable`]: cancellable::Cancellable
//! [`RunContext`]: context::RunContext

pub mod ack;
pub mod cancellable;
pub mod certificate;
pub mod context;
pub mod error;
pub mod flowable;
pub mod observer;
pub mod ops;
pub mod prelude;
pub mod scheduler;
pub mod sources;
pub mod state;

// Re-export the prelude module
pub use prelude::*;
