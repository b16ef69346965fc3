use crate::completion::{Continuation, Status};
use crate::diagnostics::violation;
use crate::error::{Fault, PromiseError, Violation};
use crate::source::{PromiseSource, TaskSource};

use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::task::AtomicWaker;
use tracing::trace;

/// A handle to the eventual result of a single-shot operation.
///
/// Either carries an already-known value inline, or pairs a source with the
/// generation token it was issued for. Reading the result through a source
/// consumes it: the source moves to its next generation and any other copy of
/// this handle becomes stale.
pub struct Promise<T: Send + 'static> {
  pub(crate) repr: Repr<T>,
}

pub(crate) enum Repr<T> {
  Ready(T),
  Source { source: Arc<dyn TaskSource<T>>, token: u16 },
}

impl<T: Send + 'static> Promise<T> {
  /// A promise that is already resolved. Nothing is allocated.
  pub fn from_result(value: T) -> Self {
    Self { repr: Repr::Ready(value) }
  }

  pub fn from_error(fault: impl Into<Fault>) -> Self {
    let source = PromiseSource::new();
    source.try_reject(fault);
    source.promise()
  }

  pub fn canceled(message: impl Into<String>) -> Self {
    let source = PromiseSource::new();
    source.try_cancel(message);
    source.promise()
  }

  /// Wraps a custom backend.
  pub fn from_source(source: Arc<dyn TaskSource<T>>, token: u16) -> Self {
    Self {
      repr: Repr::Source { source, token },
    }
  }

  /// The generation token, or `None` for an inline value.
  pub fn token(&self) -> Option<u16> {
    match &self.repr {
      Repr::Ready(_) => None,
      Repr::Source { token, .. } => Some(*token),
    }
  }

  pub fn is_completed(&self) -> bool {
    match &self.repr {
      Repr::Ready(_) => true,
      Repr::Source { source, .. } => source.unchecked_status().is_completed(),
    }
  }

  pub fn status(&self) -> Result<Status, PromiseError> {
    match &self.repr {
      Repr::Ready(_) => Ok(Status::Succeeded),
      Repr::Source { source, token } => source.status(*token),
    }
  }

  /// Takes the result. Fails with `NotYetCompleted` while the source is pending.
  pub fn get_result(self) -> Result<T, PromiseError> {
    match self.repr {
      Repr::Ready(value) => Ok(value),
      Repr::Source { source, token } => source.get_result(token),
    }
  }

  /// Registers the continuation to run once the promise settles.
  ///
  /// Runs inline if it already has. Otherwise it runs on whichever thread
  /// settles the source; no context is captured or restored.
  pub fn on_completed(&self, continuation: impl FnOnce() + Send + 'static) -> Result<(), PromiseError> {
    match &self.repr {
      Repr::Ready(_) => {
        continuation();
        Ok(())
      }
      Repr::Source { source, token } => source.on_completed(Box::new(continuation), *token),
    }
  }

  /// Hands the result to `f` as soon as it is available, consuming the promise.
  pub fn subscribe(self, f: impl FnOnce(Result<T, PromiseError>) + Send + 'static) -> Result<(), PromiseError> {
    match self.repr {
      Repr::Ready(value) => {
        f(Ok(value));
        Ok(())
      }
      Repr::Source { source, token } => {
        if source.unchecked_status().is_completed() {
          f(source.get_result(token));
          return Ok(());
        }
        // The continuation lives inside the source, so it must not own it.
        let reader = Arc::downgrade(&source);
        let continuation: Continuation = Box::new(move || match reader.upgrade() {
          Some(source) => f(source.get_result(token)),
          None => trace!(%token, "Source dropped before delivering to its subscriber."),
        });
        source.on_completed(continuation, token)
      }
    }
  }
}

impl<T: Send + Clone + 'static> Clone for Promise<T> {
  fn clone(&self) -> Self {
    let repr = match &self.repr {
      Repr::Ready(value) => Repr::Ready(value.clone()),
      Repr::Source { source, token } => Repr::Source {
        source: source.clone(),
        token: *token,
      },
    };
    Self { repr }
  }
}

impl<T: Send + 'static> From<PromiseSource<T>> for Promise<T> {
  fn from(source: PromiseSource<T>) -> Self {
    source.promise()
  }
}

impl<T: Send + 'static> fmt::Debug for Promise<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.repr {
      Repr::Ready(_) => f.debug_struct("Promise").field("ready", &true).finish(),
      Repr::Source { source, token } => f
        .debug_struct("Promise")
        .field("token", token)
        .field("status", &source.unchecked_status())
        .finish(),
    }
  }
}

impl<T: Send + 'static> IntoFuture for Promise<T> {
  type Output = Result<T, PromiseError>;
  type IntoFuture = PromiseAwaiter<T>;

  fn into_future(self) -> Self::IntoFuture {
    PromiseAwaiter {
      promise: Some(self),
      waker: None,
    }
  }
}

/// The `Future` form of a [`Promise`].
///
/// The first pending poll registers one continuation that wakes an
/// [`AtomicWaker`]; later polls only refresh the waker, so re-polling never
/// registers twice.
pub struct PromiseAwaiter<T: Send + 'static> {
  promise: Option<Promise<T>>,
  waker: Option<Arc<AtomicWaker>>,
}

// No pin projection into `T` ever happens.
impl<T: Send + 'static> Unpin for PromiseAwaiter<T> {}

impl<T: Send + 'static> Future for PromiseAwaiter<T> {
  type Output = Result<T, PromiseError>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = self.get_mut();
    let promise = match this.promise.take() {
      Some(promise) => promise,
      None => return Poll::Ready(Err(violation(Violation::AlreadyConsumed))),
    };
    if promise.is_completed() {
      return Poll::Ready(promise.get_result());
    }

    match &this.waker {
      Some(waker) => waker.register(cx.waker()),
      None => {
        let waker = Arc::new(AtomicWaker::new());
        waker.register(cx.waker());
        let wake = waker.clone();
        if let Err(err) = promise.on_completed(move || wake.wake()) {
          return Poll::Ready(Err(err));
        }
        trace!(token = ?promise.token(), "Awaiter registered its continuation.");
        this.waker = Some(waker);
      }
    }

    // Settlement may have raced the registration above.
    if promise.is_completed() {
      return Poll::Ready(promise.get_result());
    }
    this.promise = Some(promise);
    Poll::Pending
  }
}

impl<T: Send + 'static> fmt::Debug for PromiseAwaiter<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PromiseAwaiter")
      .field("promise", &self.promise)
      .field("registered", &self.waker.is_some())
      .finish()
  }
}
