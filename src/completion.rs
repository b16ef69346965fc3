//! The single-shot completion state machine shared by every source.
//!
//! Settlement is decided by `completed_count`: the call that moves it from 0 to 1
//! owns the outcome. The continuation slot is guarded by `continuation_state`, an
//! atomic tag that resolves the race between registering a continuation and
//! publishing an outcome without holding a lock across either call:
//!
//! ```text
//!   EMPTY ──register──▶ REGISTERING ──▶ REGISTERED ──publish──▶ DELIVERED
//!     │                      │
//!  publish                publish
//!     ▼                      ▼
//!  SETTLED             HANDED_BACK ──registrar invokes──▶ DELIVERED
//!     │
//!  register (invoke inline) ──▶ DELIVERED
//! ```
//!
//! Whichever side finds the other's marker runs the continuation, so it fires
//! exactly once. `HANDED_BACK` is owned by the registrar in flight; any other
//! registration attempt against it is rejected.

use crate::diagnostics::{report_unhandled_error, violation};
use crate::error::{Fault, PromiseError, Violation};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::trace;

/// Resumption callback, invoked once by whichever thread settles the source.
pub type Continuation = Box<dyn FnOnce() + Send + 'static>;

/// Core without a payload.
pub type UnitCompletionCore = CompletionCore<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
  Pending,
  Succeeded,
  Canceled,
  Faulted,
}

impl Status {
  pub fn is_completed(self) -> bool {
    self != Status::Pending
  }

  fn to_u8(self) -> u8 {
    match self {
      Status::Pending => 0,
      Status::Succeeded => 1,
      Status::Canceled => 2,
      Status::Faulted => 3,
    }
  }

  fn from_u8(value: u8) -> Self {
    match value {
      1 => Status::Succeeded,
      2 => Status::Canceled,
      3 => Status::Faulted,
      _ => Status::Pending,
    }
  }
}

const EMPTY: u8 = 0;
const REGISTERING: u8 = 1;
const REGISTERED: u8 = 2;
const SETTLED: u8 = 3;
const DELIVERED: u8 = 4;
const HANDED_BACK: u8 = 5;

enum Outcome<T> {
  Value(T),
  Failed(PromiseError),
}

pub struct CompletionCore<T> {
  outcome: Mutex<Option<Outcome<T>>>,
  settled_status: AtomicU8,
  version: AtomicU16,
  completed_count: AtomicUsize,
  unobserved_error: AtomicBool,
  continuation_state: AtomicU8,
  continuation: Mutex<Option<Continuation>>,
}

impl<T> CompletionCore<T> {
  pub fn new() -> Self {
    Self {
      outcome: Mutex::new(None),
      settled_status: AtomicU8::new(Status::Pending.to_u8()),
      version: AtomicU16::new(0),
      completed_count: AtomicUsize::new(0),
      unobserved_error: AtomicBool::new(false),
      continuation_state: AtomicU8::new(EMPTY),
      continuation: Mutex::new(None),
    }
  }

  pub fn version(&self) -> u16 {
    self.version.load(Ordering::Acquire)
  }

  pub fn try_set_result(&self, value: T) -> bool {
    self.try_settle(Outcome::Value(value))
  }

  pub fn try_set_exception(&self, fault: Fault) -> bool {
    self.try_settle(Outcome::Failed(PromiseError::Faulted(fault)))
  }

  pub fn try_set_canceled(&self, message: impl Into<String>) -> bool {
    self.try_settle(Outcome::Failed(PromiseError::Canceled(message.into())))
  }

  /// Settles with an error, keeping cancellations as cancellations. Anything
  /// that is not a settlement outcome is wrapped as a fault.
  pub fn try_set_error(&self, err: PromiseError) -> bool {
    let err = if err.is_outcome() { err } else { PromiseError::Faulted(Fault::new(err)) };
    self.try_settle(Outcome::Failed(err))
  }

  fn try_settle(&self, outcome: Outcome<T>) -> bool {
    if self.completed_count.fetch_add(1, Ordering::AcqRel) != 0 {
      return false;
    }

    let status = match &outcome {
      Outcome::Value(_) => Status::Succeeded,
      Outcome::Failed(PromiseError::Canceled(_)) => Status::Canceled,
      Outcome::Failed(_) => Status::Faulted,
    };
    if status != Status::Succeeded {
      self.unobserved_error.store(true, Ordering::Release);
    }
    *self.outcome.lock() = Some(outcome);
    self.settled_status.store(status.to_u8(), Ordering::Release);
    self.publish();
    true
  }

  fn publish(&self) {
    let mut current = self.continuation_state.load(Ordering::Acquire);
    loop {
      // A registrar mid-way gets the continuation handed back and runs it itself.
      let next = match current {
        REGISTERED => DELIVERED,
        REGISTERING => HANDED_BACK,
        _ => SETTLED,
      };
      match self
        .continuation_state
        .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
      {
        Ok(_) => break,
        Err(actual) => current = actual,
      }
    }

    if current == REGISTERED {
      let continuation = self.continuation.lock().take();
      if let Some(continuation) = continuation {
        trace!(version = self.version(), "Delivering continuation from the settling thread.");
        continuation();
      }
    }
  }

  fn is_settled(&self) -> bool {
    matches!(
      self.continuation_state.load(Ordering::Acquire),
      SETTLED | HANDED_BACK | DELIVERED
    )
  }

  fn validate_token(&self, token: u16) -> Result<(), PromiseError> {
    let version = self.version();
    if token != version {
      return Err(violation(Violation::StaleToken { token, version }));
    }
    Ok(())
  }

  pub fn status(&self, token: u16) -> Result<Status, PromiseError> {
    self.validate_token(token)?;
    Ok(self.unchecked_status())
  }

  /// Status without token validation.
  pub fn unchecked_status(&self) -> Status {
    if self.is_settled() {
      Status::from_u8(self.settled_status.load(Ordering::Acquire))
    } else {
      Status::Pending
    }
  }

  /// Takes the outcome. The caller is responsible for resetting the core afterwards.
  pub fn get_result(&self, token: u16) -> Result<T, PromiseError> {
    self.validate_token(token)?;

    let mut slot = self.outcome.lock();
    // A concurrent reader may have consumed and reset this generation since the first check.
    let version = self.version();
    if version != token {
      drop(slot);
      return Err(violation(Violation::StaleToken { token, version }));
    }
    if !self.is_settled() {
      return Err(PromiseError::NotYetCompleted);
    }
    let outcome = slot.take();
    drop(slot);

    match outcome {
      Some(Outcome::Value(value)) => Ok(value),
      Some(Outcome::Failed(err)) => {
        self.unobserved_error.store(false, Ordering::Release);
        Err(err)
      }
      None => Err(violation(Violation::AlreadyConsumed)),
    }
  }

  pub fn on_completed(&self, continuation: Continuation, token: u16) -> Result<(), PromiseError> {
    self.validate_token(token)?;

    match self
      .continuation_state
      .compare_exchange(EMPTY, REGISTERING, Ordering::AcqRel, Ordering::Acquire)
    {
      Ok(_) => {
        *self.continuation.lock() = Some(continuation);
        self.finish_registration();
        Ok(())
      }
      Err(SETTLED) => {
        if self
          .continuation_state
          .compare_exchange(SETTLED, DELIVERED, Ordering::AcqRel, Ordering::Acquire)
          .is_ok()
        {
          trace!(version = self.version(), "Already settled; running continuation inline.");
          continuation();
          Ok(())
        } else {
          Err(violation(Violation::ContinuationAlreadyRegistered))
        }
      }
      Err(_) => Err(violation(Violation::ContinuationAlreadyRegistered)),
    }
  }

  fn finish_registration(&self) {
    if self
      .continuation_state
      .compare_exchange(REGISTERING, REGISTERED, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
    {
      return;
    }
    // Settled while we were storing; the settler left the continuation to us.
    let continuation = self.continuation.lock().take();
    self.continuation_state.store(DELIVERED, Ordering::Release);
    if let Some(continuation) = continuation {
      trace!(version = self.version(), "Settled during registration; running continuation.");
      continuation();
    }
  }

  /// Starts the next generation. Tokens issued before this call become stale.
  pub fn reset(&self, report_unhandled: bool) {
    self.version.fetch_add(1, Ordering::AcqRel);

    let outcome = self.outcome.lock().take();
    if self.unobserved_error.swap(false, Ordering::AcqRel) && report_unhandled {
      if let Some(Outcome::Failed(err)) = &outcome {
        report_unhandled_error(err);
      }
    }
    drop(outcome);

    *self.continuation.lock() = None;
    self.completed_count.store(0, Ordering::Release);
    self.settled_status.store(Status::Pending.to_u8(), Ordering::Release);
    self.continuation_state.store(EMPTY, Ordering::Release);
  }
}

impl<T> Default for CompletionCore<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> fmt::Debug for CompletionCore<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompletionCore")
      .field("version", &self.version())
      .field("status", &self.unchecked_status())
      .field("completed_count", &self.completed_count.load(Ordering::Relaxed))
      .finish_non_exhaustive()
  }
}

impl<T> Drop for CompletionCore<T> {
  fn drop(&mut self) {
    if *self.unobserved_error.get_mut() {
      if let Some(Outcome::Failed(err)) = self.outcome.get_mut().take() {
        report_unhandled_error(&err);
      }
    }
  }
}
