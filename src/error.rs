use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by promises, their sources and cancellation sources.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PromiseError {
  #[error("Protocol violation: {0}")]
  ProtocolViolation(#[from] Violation),

  #[error("Not yet completed, the result may only be read once the promise has settled")]
  NotYetCompleted,

  #[error("Operation was cancelled: {0}")]
  Canceled(String),

  #[error("Operation faulted: {0}")]
  Faulted(Fault),

  #[error("Driven future panicked while being polled")]
  Panicked,
}

impl PromiseError {
  /// Returns `true` for the terminal outcomes a source can settle with.
  pub fn is_outcome(&self) -> bool {
    matches!(self, PromiseError::Canceled(_) | PromiseError::Faulted(_) | PromiseError::Panicked)
  }

  /// Returns the wrapped fault, if this is a `Faulted` error.
  pub fn fault(&self) -> Option<&Fault> {
    match self {
      PromiseError::Faulted(fault) => Some(fault),
      _ => None,
    }
  }
}

/// Misuse of the handle/token protocol. These always indicate a bug in the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
  #[error("Token {token} does not match version {version}; the handle was already awaited or its source recycled")]
  StaleToken { token: u16, version: u16 },

  #[error("A continuation is already registered; a promise can only be awaited once")]
  ContinuationAlreadyRegistered,

  #[error("Cancellation source is already cancelled or cancelling")]
  AlreadyCancelled,

  #[error("Cannot dispose a cancellation source while it is notifying its registrations")]
  DisposeWhileNotifying,

  #[error("Cannot register on the default cancellation token")]
  DefaultToken,

  #[error("Result was already taken from this awaiter")]
  AlreadyConsumed,
}

/// An arbitrary error a promise was rejected with.
///
/// Cloning a `Fault` shares the same underlying error, so identity survives
/// being stored in a source and handed back out by `get_result`.
#[derive(Clone)]
pub struct Fault(Arc<dyn StdError + Send + Sync + 'static>);

impl Fault {
  pub fn new<E>(error: E) -> Self
  where
    E: StdError + Send + Sync + 'static,
  {
    Fault(Arc::new(error))
  }

  pub fn from_arc(error: Arc<dyn StdError + Send + Sync + 'static>) -> Self {
    Fault(error)
  }

  /// The wrapped error.
  pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
    &*self.0
  }

  pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
    self.0.downcast_ref::<E>()
  }

  /// Whether both faults wrap the very same error instance.
  pub fn ptr_eq(&self, other: &Fault) -> bool {
    Arc::ptr_eq(&self.0, &other.0)
  }
}

impl<E> From<E> for Fault
where
  E: StdError + Send + Sync + 'static,
{
  fn from(error: E) -> Self {
    Fault::new(error)
  }
}

impl PartialEq for Fault {
  fn eq(&self, other: &Self) -> bool {
    self.ptr_eq(other)
  }
}

impl fmt::Debug for Fault {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("Fault").field(&self.0).finish()
  }
}

impl fmt::Display for Fault {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(&self.0, f)
  }
}
