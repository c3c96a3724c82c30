//! Prelude module for convenient imports
//!
//! This module re-exports commonly used types and traits for easy access.

pub use crate::{
  ack::{Ack, AckResolver, Signal},
  cancellable::{Cancellable, CancellableRef, CancellationFlag},
  certificate::{Certificate, Ledger, Weight},
  context::{RunConfig, RunContext},
  error::FlowError,
  flowable::{merge_all, subscribe_root, zip_all, Flowable, FlowableNode},
  observer::{Notification, Observer, ObserverRef, RecordingObserver, SinkObserver},
  scheduler::{Scheduler, SchedulerRef, TestScheduler, Trampoline},
  sources,
  state::{ConnectToken, Runtime, State, SubscribeArgs, SubscriptionResult},
};
#[cfg(feature = "futures-scheduler")]
pub use crate::scheduler::ThreadPoolScheduler;
#[cfg(feature = "tokio-scheduler")]
pub use crate::scheduler::TokioScheduler;
