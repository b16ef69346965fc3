use crate::completion::{CompletionCore, Continuation, Status};
use crate::error::PromiseError;
use crate::handle::Promise;
use crate::source::TaskSource;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

/// Waits for every promise and yields their results in input order.
///
/// Settles as soon as any input fails, with that input's error; the remaining
/// inputs are left to finish on their own and their results are dropped.
/// An empty input resolves immediately to an empty vector.
pub fn join_all<T, I>(promises: I) -> Promise<Vec<T>>
where
  T: Send + 'static,
  I: IntoIterator<Item = Promise<T>>,
{
  let join = JoinAll::start(promises.into_iter().collect());
  let source: Arc<dyn TaskSource<Vec<T>>> = join;
  Promise::from_source(source, 0)
}

/// [`join_all`] for promises without a payload.
pub fn join_all_unit<I>(promises: I) -> Promise<()>
where
  I: IntoIterator<Item = Promise<()>>,
{
  let join = JoinAll::start(promises.into_iter().collect());
  let source: Arc<dyn TaskSource<()>> = Arc::new(UnitJoin(join));
  Promise::from_source(source, 0)
}

struct JoinAll<T> {
  core: CompletionCore<Vec<T>>,
  results: Mutex<Vec<Option<T>>>,
  completed_count: AtomicUsize,
  tasks_len: usize,
}

impl<T: Send + 'static> JoinAll<T> {
  fn start(promises: Vec<Promise<T>>) -> Arc<Self> {
    let tasks_len = promises.len();
    let join = Arc::new(JoinAll {
      core: CompletionCore::new(),
      results: Mutex::new((0..tasks_len).map(|_| None).collect()),
      completed_count: AtomicUsize::new(0),
      tasks_len,
    });

    if tasks_len == 0 {
      join.core.try_set_result(Vec::new());
      return join;
    }

    for (index, promise) in promises.into_iter().enumerate() {
      if promise.is_completed() {
        join.on_input(index, promise.get_result());
        continue;
      }
      let target = join.clone();
      if let Err(err) = promise.subscribe(move |result| target.on_input(index, result)) {
        join.on_input(index, Err(err));
      }
    }
    join
  }

  fn on_input(&self, index: usize, result: Result<T, PromiseError>) {
    let value = match result {
      Ok(value) => value,
      Err(err) => {
        if self.core.try_set_error(err) {
          debug!(%index, tasks_len = self.tasks_len, "Join failed fast on input.");
        }
        return;
      }
    };

    self.results.lock()[index] = Some(value);
    let completed = self.completed_count.fetch_add(1, Ordering::AcqRel) + 1;
    trace!(%index, completed, tasks_len = self.tasks_len, "Join input completed.");
    if completed == self.tasks_len {
      let results: Vec<T> = std::mem::take(&mut *self.results.lock()).into_iter().flatten().collect();
      self.core.try_set_result(results);
    }
  }
}

// Join sources are not pooled: the aggregate result is taken once and the
// token stays fixed at the core's first generation.
impl<T: Send + 'static> TaskSource<Vec<T>> for JoinAll<T> {
  fn status(&self, token: u16) -> Result<Status, PromiseError> {
    self.core.status(token)
  }

  fn unchecked_status(&self) -> Status {
    self.core.unchecked_status()
  }

  fn get_result(&self, token: u16) -> Result<Vec<T>, PromiseError> {
    self.core.get_result(token)
  }

  fn on_completed(&self, continuation: Continuation, token: u16) -> Result<(), PromiseError> {
    self.core.on_completed(continuation, token)
  }
}

struct UnitJoin(Arc<JoinAll<()>>);

impl TaskSource<()> for UnitJoin {
  fn status(&self, token: u16) -> Result<Status, PromiseError> {
    self.0.status(token)
  }

  fn unchecked_status(&self) -> Status {
    self.0.unchecked_status()
  }

  fn get_result(&self, token: u16) -> Result<(), PromiseError> {
    self.0.get_result(token).map(|_| ())
  }

  fn on_completed(&self, continuation: Continuation, token: u16) -> Result<(), PromiseError> {
    self.0.on_completed(continuation, token)
  }
}
