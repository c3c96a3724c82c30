//! Errors delivered through `on_error`.
//!
//! Two kinds are raised by the engine itself:
//!
//! - [`FlowError::Operator`]: a user function passed to an operator panicked or
//!   returned `Err`. Carries the call site where the operator was composed.
//! - [`FlowError::Execution`]: a panic raised while a scheduled task was
//!   delivering values. Carries the backtrace captured where it was caught.
//!
//! Neither is ever re-raised through the caller's stack; both travel
//! downstream as values.

use std::{
  any::Any,
  backtrace::Backtrace,
  panic::{self, AssertUnwindSafe, Location},
  sync::Arc,
};

use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum FlowError {
  /// A user-supplied function failed inside an operator.
  #[error("operator `{operator}` composed at {location} failed: {message}")]
  Operator {
    operator: &'static str,
    location: &'static Location<'static>,
    message: String,
  },

  /// A panic escaped a scheduled task.
  #[error("execution failed: {message}")]
  Execution { message: String, backtrace: Arc<Backtrace> },

  /// An error emitted by a source.
  #[error(transparent)]
  Source(Arc<dyn std::error::Error + Send + Sync>),

  #[error("{0}")]
  Message(String),
}

impl FlowError {
  pub fn operator(
    operator: &'static str, location: &'static Location<'static>, message: impl Into<String>,
  ) -> Self {
    FlowError::Operator { operator, location, message: message.into() }
  }

  pub fn execution(message: impl Into<String>) -> Self {
    FlowError::Execution {
      message: message.into(),
      backtrace: Arc::new(Backtrace::capture()),
    }
  }

  pub fn source<E>(err: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    FlowError::Source(Arc::new(err))
  }

  pub fn message(message: impl Into<String>) -> Self { FlowError::Message(message.into()) }

  /// Returns a short stable label for logs and assertions.
  pub fn as_label(&self) -> &'static str {
    match self {
      FlowError::Operator { .. } => "operator",
      FlowError::Execution { .. } => "execution",
      FlowError::Source(_) => "source",
      FlowError::Message(_) => "message",
    }
  }

  /// Call site of the failing operator, if this is an operator error.
  pub fn location(&self) -> Option<&'static Location<'static>> {
    match self {
      FlowError::Operator { location, .. } => Some(location),
      _ => None,
    }
  }
}

/// Run a user function for `operator`, converting a panic into
/// [`FlowError::Operator`].
pub fn catch_operator<R>(
  operator: &'static str, location: &'static Location<'static>, f: impl FnOnce() -> R,
) -> Result<R, FlowError> {
  panic::catch_unwind(AssertUnwindSafe(f))
    .map_err(|payload| FlowError::operator(operator, location, panic_message(payload)))
}

/// Run a delivery step, converting a panic into [`FlowError::Execution`].
pub fn catch_execution<R>(f: impl FnOnce() -> R) -> Result<R, FlowError> {
  panic::catch_unwind(AssertUnwindSafe(f))
    .map_err(|payload| FlowError::execution(panic_message(payload)))
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(s) = payload.downcast_ref::<&'static str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "opaque panic payload".to_string()
  }
}
