//! Drives a future to completion without an executor.
//!
//! The future is polled inline by the caller of [`drive`] and afterwards by
//! whichever thread wakes it, typically the thread that settles a promise the
//! future is awaiting. Wakes that arrive mid-poll are coalesced into one more
//! poll. No thread or scheduler is involved.

use crate::completion::{CompletionCore, Continuation, Status};
use crate::error::PromiseError;
use crate::handle::Promise;
use crate::pool::{NextNode, Pool, PoolNode};
use crate::source::{consume_and_recycle, TaskSource};

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::task::{waker_ref, ArcWake};
use parking_lot::Mutex;
use tracing::{debug, error, trace};

const IDLE: u8 = 0;
const POLLING: u8 = 1;
const REPOLL: u8 = 2;

/// Drives `future` on an unpooled runner and returns its promise.
pub fn drive<T, F>(future: F) -> Promise<T>
where
  T: Send + 'static,
  F: Future<Output = Result<T, PromiseError>> + Send + 'static,
{
  RunnerNode::start(RunnerNode::new(Weak::new()), Box::pin(future))
}

/// Recycles runner nodes for futures producing `T`.
pub struct RunnerPool<T: Send + 'static> {
  pool: Arc<Pool<RunnerNode<T>>>,
}

impl<T: Send + 'static> RunnerPool<T> {
  pub fn new(pool_name: &str) -> Self {
    Self {
      pool: Arc::new(Pool::new(pool_name)),
    }
  }

  pub fn len(&self) -> usize {
    self.pool.len()
  }

  pub fn is_empty(&self) -> bool {
    self.pool.is_empty()
  }

  /// Like [`drive`], reusing a runner whose previous result has been consumed.
  pub fn drive<F>(&self, future: F) -> Promise<T>
  where
    F: Future<Output = Result<T, PromiseError>> + Send + 'static,
  {
    let node = match self.pool.pop() {
      Some(node) => node,
      None => {
        debug!(pool_name = %self.pool.name(), "Runner pool empty, allocating a new runner.");
        RunnerNode::new(Arc::downgrade(&self.pool))
      }
    };
    RunnerNode::start(node, Box::pin(future))
  }
}

impl<T: Send + 'static> fmt::Debug for RunnerPool<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RunnerPool").field("pool", &self.pool).finish()
  }
}

pub(crate) struct RunnerNode<T: Send + 'static> {
  core: CompletionCore<T>,
  future: Mutex<Option<BoxFuture<'static, Result<T, PromiseError>>>>,
  poll_state: AtomicU8,
  link: NextNode<RunnerNode<T>>,
  me: Weak<RunnerNode<T>>,
  pool: Weak<Pool<RunnerNode<T>>>,
}

impl<T: Send + 'static> RunnerNode<T> {
  fn new(pool: Weak<Pool<RunnerNode<T>>>) -> Arc<Self> {
    Arc::new_cyclic(|me| RunnerNode {
      core: CompletionCore::new(),
      future: Mutex::new(None),
      poll_state: AtomicU8::new(IDLE),
      link: NextNode::new(),
      me: me.clone(),
      pool,
    })
  }

  fn start(node: Arc<Self>, future: BoxFuture<'static, Result<T, PromiseError>>) -> Promise<T> {
    let token = node.core.version();
    *node.future.lock() = Some(future);
    node.run();
    let source: Arc<dyn TaskSource<T>> = node;
    Promise::from_source(source, token)
  }

  // Move forward one step, or several if wakes arrived while polling.
  fn run(self: &Arc<Self>) {
    let mut state = self.poll_state.load(Ordering::Acquire);
    loop {
      let (expected, next) = match state {
        IDLE => (IDLE, POLLING),
        POLLING => (POLLING, REPOLL),
        _ => return,
      };
      match self
        .poll_state
        .compare_exchange(expected, next, Ordering::AcqRel, Ordering::Acquire)
      {
        Ok(_) if next == POLLING => break,
        // The thread currently polling will go round once more.
        Ok(_) => return,
        Err(actual) => state = actual,
      }
    }

    loop {
      let waker = waker_ref(self);
      let mut cx = Context::from_waker(&waker);
      let mut slot = self.future.lock();
      let Some(future) = slot.as_mut() else {
        self.poll_state.store(IDLE, Ordering::Release);
        return;
      };

      match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
        Ok(Poll::Pending) => {
          drop(slot);
          if self
            .poll_state
            .compare_exchange(POLLING, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
          {
            return;
          }
          self.poll_state.store(POLLING, Ordering::Release);
        }
        Ok(Poll::Ready(output)) => {
          *slot = None;
          drop(slot);
          self.poll_state.store(IDLE, Ordering::Release);
          trace!(version = self.core.version(), ok = output.is_ok(), "Driven future finished.");
          match output {
            Ok(value) => self.core.try_set_result(value),
            Err(err) => self.core.try_set_error(err),
          };
          return;
        }
        Err(_) => {
          *slot = None;
          drop(slot);
          self.poll_state.store(IDLE, Ordering::Release);
          error!(version = self.core.version(), "Driven future panicked during poll.");
          self.core.try_set_error(PromiseError::Panicked);
          return;
        }
      }
    }
  }
}

impl<T: Send + 'static> ArcWake for RunnerNode<T> {
  fn wake_by_ref(arc_self: &Arc<Self>) {
    arc_self.run();
  }
}

impl<T: Send + 'static> PoolNode for RunnerNode<T> {
  fn next_node(&self) -> &NextNode<Self> {
    &self.link
  }
}

impl<T: Send + 'static> TaskSource<T> for RunnerNode<T> {
  fn status(&self, token: u16) -> Result<Status, PromiseError> {
    self.core.status(token)
  }

  fn unchecked_status(&self) -> Status {
    self.core.unchecked_status()
  }

  fn get_result(&self, token: u16) -> Result<T, PromiseError> {
    consume_and_recycle(&self.core, token, &self.me, &self.pool)
  }

  fn on_completed(&self, continuation: Continuation, token: u16) -> Result<(), PromiseError> {
    self.core.on_completed(continuation, token)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::source::PromiseSource;
  use std::thread;

  #[test]
  fn test_ready_future_resolves_synchronously() {
    let promise = drive(async { Ok::<_, PromiseError>(5) });
    assert!(promise.is_completed());
    assert_eq!(promise.get_result(), Ok(5));
  }

  #[test]
  fn test_resumes_on_the_settling_thread() {
    let input = PromiseSource::<u32>::new();
    let awaited = input.promise();
    let promise = drive(async move {
      let value = awaited.await?;
      Ok((value * 2, thread::current().id()))
    });
    assert!(!promise.is_completed());

    let settler = thread::spawn(move || {
      input.try_resolve(21);
      thread::current().id()
    });
    let settler_id = settler.join().unwrap();
    assert_eq!(promise.get_result(), Ok((42, settler_id)));
  }

  #[test]
  fn test_error_output_keeps_its_kind() {
    let promise = drive(async { Err::<u8, _>(PromiseError::Canceled("stop".into())) });
    assert_eq!(promise.get_result(), Err(PromiseError::Canceled("stop".into())));
  }

  #[test]
  fn test_panicking_future_faults_with_panicked() {
    let frames: Vec<u8> = Vec::new();
    let promise = drive(async move { Ok(frames[3]) });
    assert_eq!(promise.get_result(), Err(PromiseError::Panicked));
  }

  #[test]
  fn test_pooled_runner_is_recycled_after_consumption() {
    let runners = RunnerPool::<u16>::new("runners");
    let first = runners.drive(async { Ok(1) });
    assert_eq!(first.get_result(), Ok(1));
    assert_eq!(runners.len(), 1);

    let second = runners.drive(async { Ok(2) });
    assert!(runners.is_empty());
    assert_eq!(second.token(), Some(1));
    assert_eq!(second.get_result(), Ok(2));
  }
}
