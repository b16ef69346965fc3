use crate::cancellation::CancelToken;
use crate::completion::{CompletionCore, Continuation, Status};
use crate::error::{Fault, PromiseError};
use crate::handle::Promise;
use crate::pool::{NextNode, Pool, PoolNode};

use std::fmt;
use std::sync::{Arc, Weak};

use tracing::{debug, trace};

/// The capability every promise backend exposes to a [`Promise`].
///
/// Implemented by pooled sources, join sources and driven futures; custom
/// backends can implement it too and hand out handles via [`Promise::from_source`].
pub trait TaskSource<T>: Send + Sync {
  /// Status for the generation `token` refers to. Stale tokens are a protocol violation.
  fn status(&self, token: u16) -> Result<Status, PromiseError>;

  /// Status of whatever generation is current.
  fn unchecked_status(&self) -> Status;

  /// Consumes the result. After this returns, `token` is no longer valid.
  fn get_result(&self, token: u16) -> Result<T, PromiseError>;

  /// Registers the single continuation for this generation.
  fn on_completed(&self, continuation: Continuation, token: u16) -> Result<(), PromiseError>;
}

/// Resets the core and hands the node back to its pool when dropped.
///
/// Armed only by the read that actually took the outcome, so each generation
/// is recycled exactly once no matter how many copies of a handle race.
pub(crate) struct RecycleGuard<'a, T, N: PoolNode> {
  core: &'a CompletionCore<T>,
  me: &'a Weak<N>,
  pool: &'a Weak<Pool<N>>,
}

impl<T, N: PoolNode> Drop for RecycleGuard<'_, T, N> {
  fn drop(&mut self) {
    self.core.reset(true);
    // Unpooled nodes (no pool) are simply left for their last owner to drop.
    if let (Some(pool), Some(me)) = (self.pool.upgrade(), self.me.upgrade()) {
      trace!(pool_name = %pool.name(), version = self.core.version(), "Recycling source.");
      pool.push(me);
    }
  }
}

/// Reads the result of a pooled node and recycles it once the outcome is taken.
///
/// Premature reads, stale tokens and lost races against another reader leave
/// the node alone: the generation belongs to whoever took the outcome.
pub(crate) fn consume_and_recycle<T, N: PoolNode>(
  core: &CompletionCore<T>,
  token: u16,
  me: &Weak<N>,
  pool: &Weak<Pool<N>>,
) -> Result<T, PromiseError> {
  let result = core.get_result(token);
  let took_outcome = match &result {
    Ok(_) => true,
    Err(err) => err.is_outcome(),
  };
  let _recycle = took_outcome.then(|| RecycleGuard { core, me, pool });
  result
}

pub(crate) struct SourceNode<T: Send + 'static> {
  core: CompletionCore<T>,
  link: NextNode<SourceNode<T>>,
  me: Weak<SourceNode<T>>,
  pool: Weak<Pool<SourceNode<T>>>,
}

impl<T: Send + 'static> SourceNode<T> {
  fn new(pool: Weak<Pool<SourceNode<T>>>) -> Arc<Self> {
    Arc::new_cyclic(|me| SourceNode {
      core: CompletionCore::new(),
      link: NextNode::new(),
      me: me.clone(),
      pool,
    })
  }
}

impl<T: Send + 'static> PoolNode for SourceNode<T> {
  fn next_node(&self) -> &NextNode<Self> {
    &self.link
  }
}

impl<T: Send + 'static> TaskSource<T> for SourceNode<T> {
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

/// Producer side of a single-shot promise.
///
/// The version is captured when the source is created. Once the result has been
/// consumed the node moves on to a new generation and every `try_*` call made
/// through this value becomes a no-op returning `false`.
pub struct PromiseSource<T: Send + 'static> {
  node: Arc<SourceNode<T>>,
  version: u16,
}

impl<T: Send + 'static> PromiseSource<T> {
  /// Creates a source that is not backed by a pool.
  pub fn new() -> Self {
    let node = SourceNode::new(Weak::new());
    let version = node.core.version();
    Self { node, version }
  }

  pub fn version(&self) -> u16 {
    self.version
  }

  fn is_current(&self) -> bool {
    self.node.core.version() == self.version
  }

  pub fn try_resolve(&self, value: T) -> bool {
    self.is_current() && self.node.core.try_set_result(value)
  }

  pub fn try_reject(&self, fault: impl Into<Fault>) -> bool {
    self.is_current() && self.node.core.try_set_exception(fault.into())
  }

  pub fn try_cancel(&self, message: impl Into<String>) -> bool {
    self.is_current() && self.node.core.try_set_canceled(message)
  }

  /// Settles with an arbitrary error, keeping cancellations as cancellations.
  pub fn try_set_error(&self, err: PromiseError) -> bool {
    self.is_current() && self.node.core.try_set_error(err)
  }

  /// Status of this generation, or `None` once it has been consumed.
  pub fn status(&self) -> Option<Status> {
    self.node.core.status(self.version).ok()
  }

  /// A handle bound to this source's generation.
  pub fn promise(&self) -> Promise<T> {
    let source: Arc<dyn TaskSource<T>> = self.node.clone();
    Promise::from_source(source, self.version)
  }

  /// Cancels this generation of the source when `token` is cancelled.
  pub fn cancel_on(&self, token: &CancelToken, message: impl Into<String>) -> Result<(), PromiseError> {
    let source = self.clone();
    let message = message.into();
    token.register(move || {
      if source.try_cancel(message.clone()) {
        debug!(version = source.version, "Source cancelled through its cancellation token.");
      }
    })
  }
}

impl<T: Send + 'static> Default for PromiseSource<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Send + 'static> Clone for PromiseSource<T> {
  fn clone(&self) -> Self {
    Self {
      node: self.node.clone(),
      version: self.version,
    }
  }
}

impl<T: Send + 'static> fmt::Debug for PromiseSource<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PromiseSource")
      .field("version", &self.version)
      .field("core", &self.node.core)
      .finish()
  }
}

/// Recycles [`PromiseSource`] nodes of one result type.
pub struct SourcePool<T: Send + 'static> {
  pool: Arc<Pool<SourceNode<T>>>,
}

impl<T: Send + 'static> SourcePool<T> {
  pub fn new(pool_name: &str) -> Self {
    Self {
      pool: Arc::new(Pool::new(pool_name)),
    }
  }

  pub fn name(&self) -> &str {
    self.pool.name()
  }

  /// Idle sources waiting to be reused.
  pub fn len(&self) -> usize {
    self.pool.len()
  }

  pub fn is_empty(&self) -> bool {
    self.pool.is_empty()
  }

  /// Pops a recycled source, or builds a new one when the pool is empty.
  pub fn create(&self) -> PromiseSource<T> {
    let node = match self.pool.pop() {
      Some(node) => node,
      None => {
        debug!(pool_name = %self.pool.name(), "Pool empty, allocating a new source.");
        SourceNode::new(Arc::downgrade(&self.pool))
      }
    };
    let version = node.core.version();
    trace!(pool_name = %self.pool.name(), %version, "Source created.");
    PromiseSource { node, version }
  }

  /// A pooled source that is already resolved with `value`.
  pub fn create_resolved(&self, value: T) -> PromiseSource<T> {
    let source = self.create();
    source.try_resolve(value);
    source
  }
}

impl<T: Send + 'static> Clone for SourcePool<T> {
  fn clone(&self) -> Self {
    Self { pool: self.pool.clone() }
  }
}

impl<T: Send + 'static> fmt::Debug for SourcePool<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SourcePool").field("pool", &self.pool).finish()
  }
}
