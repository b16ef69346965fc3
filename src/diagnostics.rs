//! Process-wide sinks the promise machinery reports into.
//!
//! Three kinds of events leave the core this way:
//! - errors a source settled with that nobody ever read (`report_unhandled_error`),
//! - protocol violations, reported just before they are returned to the caller,
//! - panics raised by cancellation callbacks.
//!
//! The defaults log through `tracing`. Installing a sink replaces the default
//! until `reset_hooks` is called.

use crate::error::{PromiseError, Violation};

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, warn};

pub type UnhandledErrorSink = Arc<dyn Fn(&PromiseError) + Send + Sync + 'static>;
pub type FatalErrorReporter = Arc<dyn Fn(&Violation) + Send + Sync + 'static>;

#[derive(Default)]
struct Hooks {
  unhandled_error_sink: Option<UnhandledErrorSink>,
  fatal_error_reporter: Option<FatalErrorReporter>,
}

lazy_static::lazy_static! {
  static ref HOOKS: RwLock<Hooks> = RwLock::new(Hooks::default());
}

/// Replaces the sink that receives errors which were settled but never observed.
pub fn set_unhandled_error_sink(sink: impl Fn(&PromiseError) + Send + Sync + 'static) {
  HOOKS.write().unhandled_error_sink = Some(Arc::new(sink));
}

/// Replaces the reporter invoked for every protocol violation.
pub fn set_fatal_error_reporter(reporter: impl Fn(&Violation) + Send + Sync + 'static) {
  HOOKS.write().fatal_error_reporter = Some(Arc::new(reporter));
}

/// Restores the default `tracing` sinks.
pub fn reset_hooks() {
  *HOOKS.write() = Hooks::default();
}

/// Best effort: a panicking sink is swallowed.
pub(crate) fn report_unhandled_error(err: &PromiseError) {
  // Clone out so the lock is not held while user code runs.
  let sink = HOOKS.read().unhandled_error_sink.clone();
  let outcome = catch_unwind(AssertUnwindSafe(|| match sink {
    Some(sink) => sink(err),
    None => warn!(error = %err, "Promise settled with an error that was never observed."),
  }));
  if outcome.is_err() {
    error!("Unhandled-error sink panicked; the report was dropped.");
  }
}

/// Reports the violation and hands it back as an error, so call sites can
/// `return Err(violation(..))`.
pub(crate) fn violation(violation: Violation) -> PromiseError {
  let reporter = HOOKS.read().fatal_error_reporter.clone();
  let outcome = catch_unwind(AssertUnwindSafe(|| match reporter {
    Some(reporter) => reporter(&violation),
    None => error!(%violation, "Promise protocol violation."),
  }));
  if outcome.is_err() {
    error!(%violation, "Fatal-error reporter panicked while reporting a violation.");
  }
  PromiseError::ProtocolViolation(violation)
}

pub(crate) fn report_callback_panic(index: usize, version: u16, payload: &(dyn Any + Send)) {
  let message = payload
    .downcast_ref::<&str>()
    .map(|s| s.to_string())
    .or_else(|| payload.downcast_ref::<String>().cloned())
    .unwrap_or_else(|| "<non-string panic payload>".to_string());
  error!(%index, %version, panic = %message, "A cancellation callback panicked; continuing with the remaining callbacks.");
}
