//! Cooperative cancellation with pooled, versioned sources.
//!
//! A [`CancellationSource`] runs its registered callbacks once, in registration
//! order, when cancelled. Cancellation does not wait for work observing the
//! token; it only guarantees each callback is invoked once. Registrations are
//! kept until the source is disposed, which starts a new generation and makes
//! every previously issued [`CancelToken`] stale.

use crate::diagnostics::{report_callback_panic, violation};
use crate::error::{PromiseError, Violation};
use crate::pool::{NextNode, Pool, PoolNode};

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

type CancelCallback = Box<dyn Fn() + Send + Sync + 'static>;

const IDLE: u8 = 0;
const NOTIFYING: u8 = 1;
const NOTIFIED: u8 = 2;

lazy_static::lazy_static! {
  static ref CANCELLATION_POOL: Pool<CancelNode> = Pool::new("cancellation_sources");
}

pub(crate) struct CancelNode {
  state: AtomicU8,
  version: AtomicU16,
  registrations: Mutex<Vec<CancelCallback>>,
  link: NextNode<CancelNode>,
}

impl PoolNode for CancelNode {
  fn next_node(&self) -> &NextNode<Self> {
    &self.link
  }
}

impl CancelNode {
  fn new() -> Arc<Self> {
    Arc::new(CancelNode {
      state: AtomicU8::new(IDLE),
      version: AtomicU16::new(0),
      registrations: Mutex::new(Vec::new()),
      link: NextNode::new(),
    })
  }

  fn version(&self) -> u16 {
    self.version.load(Ordering::Acquire)
  }

  fn is_cancellation_requested(&self) -> bool {
    self.state.load(Ordering::Acquire) != IDLE
  }

  fn register(&self, callback: CancelCallback) -> Result<(), PromiseError> {
    let mut registrations = self.registrations.lock();
    if self.state.load(Ordering::Acquire) != IDLE {
      return Err(violation(Violation::AlreadyCancelled));
    }
    registrations.push(callback);
    Ok(())
  }

  fn cancel(&self) -> Result<(), PromiseError> {
    let callbacks = {
      let mut registrations = self.registrations.lock();
      if self
        .state
        .compare_exchange(IDLE, NOTIFYING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
      {
        return Err(violation(Violation::AlreadyCancelled));
      }
      std::mem::take(&mut *registrations)
    };

    let version = self.version();
    debug!(%version, callbacks = callbacks.len(), "Cancellation requested, notifying registrations.");
    for (index, callback) in callbacks.iter().enumerate() {
      if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback())) {
        report_callback_panic(index, version, &*payload);
      }
    }

    // Registrations are only released by dispose.
    *self.registrations.lock() = callbacks;
    self.state.store(NOTIFIED, Ordering::Release);
    trace!(%version, "Cancellation notification finished.");
    Ok(())
  }

  fn dispose(&self) -> Result<(), PromiseError> {
    let released = {
      let mut registrations = self.registrations.lock();
      if self.state.load(Ordering::Acquire) == NOTIFYING {
        return Err(violation(Violation::DisposeWhileNotifying));
      }
      self.version.fetch_add(1, Ordering::AcqRel);
      self.state.store(IDLE, Ordering::Release);
      std::mem::take(&mut *registrations)
    };
    trace!(version = self.version(), released = released.len(), "Cancellation source disposed.");
    Ok(())
  }
}

/// Owner of a cancellation generation.
pub struct CancellationSource {
  node: Arc<CancelNode>,
}

impl CancellationSource {
  /// Reuses a released source from the process-wide pool, or allocates one.
  pub fn create() -> Self {
    let node = CANCELLATION_POOL.pop().unwrap_or_else(CancelNode::new);
    Self { node }
  }

  pub fn token(&self) -> CancelToken {
    CancelToken {
      source: Some(Arc::downgrade(&self.node)),
      version: self.node.version(),
    }
  }

  pub fn version(&self) -> u16 {
    self.node.version()
  }

  /// True from the moment `cancel` starts notifying.
  pub fn is_cancellation_requested(&self) -> bool {
    self.node.is_cancellation_requested()
  }

  pub fn is_cancelling(&self) -> bool {
    self.node.state.load(Ordering::Acquire) == NOTIFYING
  }

  pub fn register(&self, callback: impl Fn() + Send + Sync + 'static) -> Result<(), PromiseError> {
    self.node.register(Box::new(callback))
  }

  /// Runs every registration once. A panicking callback is reported and skipped.
  pub fn cancel(&self) -> Result<(), PromiseError> {
    self.node.cancel()
  }

  /// Drops all registrations and starts a new generation.
  pub fn dispose(&self) -> Result<(), PromiseError> {
    self.node.dispose()
  }

  /// Disposes the source and returns it to the process-wide pool.
  pub fn release(self) -> Result<(), PromiseError> {
    self.node.dispose()?;
    CANCELLATION_POOL.push(self.node);
    Ok(())
  }

  /// A `tokio_util` token that is cancelled together with this source.
  pub fn link(&self) -> Result<CancellationToken, PromiseError> {
    let linked = CancellationToken::new();
    let trigger = linked.clone();
    self.register(move || trigger.cancel())?;
    Ok(linked)
  }
}

impl Default for CancellationSource {
  fn default() -> Self {
    Self::create()
  }
}

impl fmt::Debug for CancellationSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CancellationSource")
      .field("version", &self.version())
      .field("cancellation_requested", &self.is_cancellation_requested())
      .field("registrations", &self.node.registrations.try_lock().map_or(0, |r| r.len()))
      .finish()
  }
}

/// A versioned view of a [`CancellationSource`].
///
/// Using a token after its source was disposed is a protocol violation rather
/// than a silent `false`.
#[derive(Clone, Default)]
pub struct CancelToken {
  source: Option<Weak<CancelNode>>,
  version: u16,
}

impl CancelToken {
  /// A token that never cancels.
  pub fn none() -> Self {
    Self::default()
  }

  pub fn version(&self) -> u16 {
    self.version
  }

  /// Whether the source is alive and still on this token's generation.
  pub fn is_valid(&self) -> bool {
    self
      .source
      .as_ref()
      .and_then(Weak::upgrade)
      .is_some_and(|node| node.version() == self.version)
  }

  // `None` for the default token, or when the source was dropped: neither can ever cancel.
  fn live_source(&self) -> Result<Option<Arc<CancelNode>>, PromiseError> {
    let Some(node) = self.source.as_ref().and_then(Weak::upgrade) else {
      return Ok(None);
    };
    let version = node.version();
    if version != self.version {
      return Err(violation(Violation::StaleToken {
        token: self.version,
        version,
      }));
    }
    Ok(Some(node))
  }

  pub fn is_cancellation_requested(&self) -> Result<bool, PromiseError> {
    Ok(self.live_source()?.is_some_and(|node| node.is_cancellation_requested()))
  }

  pub fn register(&self, callback: impl Fn() + Send + Sync + 'static) -> Result<(), PromiseError> {
    if self.source.is_none() {
      return Err(violation(Violation::DefaultToken));
    }
    match self.live_source()? {
      Some(node) => node.register(Box::new(callback)),
      None => {
        trace!(version = self.version, "Source already dropped; registration discarded.");
        Ok(())
      }
    }
  }
}

impl fmt::Debug for CancelToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CancelToken")
      .field("version", &self.version)
      .field("is_default", &self.source.is_none())
      .finish()
  }
}
