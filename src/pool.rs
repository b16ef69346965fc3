//! Intrusive LIFO free list for recyclable nodes.
//!
//! Each node embeds a [`NextNode`] link; the pool threads its free list through
//! those links, so pushing and popping never allocates. The pool does not decide
//! whether a recycled node is still referenced elsewhere: generation stamps on the
//! nodes take care of that.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

/// A node that can be threaded through a [`Pool`].
pub trait PoolNode: Send + Sync + Sized + 'static {
  fn next_node(&self) -> &NextNode<Self>;
}

/// The link slot a [`PoolNode`] embeds.
pub struct NextNode<N> {
  next: Mutex<Option<Arc<N>>>,
  pooled: AtomicBool,
}

impl<N> NextNode<N> {
  pub fn new() -> Self {
    Self {
      next: Mutex::new(None),
      pooled: AtomicBool::new(false),
    }
  }

  /// Whether the owning node currently sits in a pool.
  pub fn is_pooled(&self) -> bool {
    self.pooled.load(Ordering::Acquire)
  }
}

impl<N> Default for NextNode<N> {
  fn default() -> Self {
    Self::new()
  }
}

impl<N> fmt::Debug for NextNode<N> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("NextNode").field("pooled", &self.is_pooled()).finish_non_exhaustive()
  }
}

pub struct Pool<N: PoolNode> {
  pool_name: Arc<str>,
  head: Mutex<Option<Arc<N>>>,
  size: AtomicUsize,
}

impl<N: PoolNode> Pool<N> {
  pub fn new(pool_name: &str) -> Self {
    Self {
      pool_name: Arc::from(pool_name),
      head: Mutex::new(None),
      size: AtomicUsize::new(0),
    }
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  /// Number of nodes currently waiting in the pool.
  pub fn len(&self) -> usize {
    self.size.load(Ordering::Acquire)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Returns `node` to the pool. Fails only if the node is already pooled.
  pub fn push(&self, node: Arc<N>) -> bool {
    let link = node.next_node();
    if link.pooled.swap(true, Ordering::AcqRel) {
      trace!(pool_name = %self.pool_name, "Push rejected: node is already pooled.");
      return false;
    }

    let mut head = self.head.lock();
    *link.next.lock() = head.take();
    *head = Some(node);
    self.size.fetch_add(1, Ordering::AcqRel);
    trace!(pool_name = %self.pool_name, size = self.len(), "Node pushed.");
    true
  }

  /// Takes the most recently pushed node, or `None` when the caller should build a fresh one.
  pub fn pop(&self) -> Option<Arc<N>> {
    let mut head = self.head.lock();
    let node = head.take()?;
    let link = node.next_node();
    *head = link.next.lock().take();
    link.pooled.store(false, Ordering::Release);
    drop(head);

    self.size.fetch_sub(1, Ordering::AcqRel);
    trace!(pool_name = %self.pool_name, size = self.len(), "Node popped.");
    Some(node)
  }
}

impl<N: PoolNode> fmt::Debug for Pool<N> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Pool")
      .field("pool_name", &self.pool_name)
      .field("len", &self.len())
      .finish_non_exhaustive()
  }
}

impl<N: PoolNode> Drop for Pool<N> {
  // Unlink iteratively; dropping a long chain recursively could overflow the stack.
  fn drop(&mut self) {
    let mut cursor = self.head.get_mut().take();
    while let Some(node) = cursor {
      cursor = node.next_node().next.lock().take();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;
  use std::sync::Mutex as StdMutex;
  use std::thread;

  #[derive(Debug)]
  struct TestNode {
    id: usize,
    link: NextNode<TestNode>,
  }

  impl TestNode {
    fn new(id: usize) -> Arc<Self> {
      Arc::new(TestNode { id, link: NextNode::new() })
    }
  }

  impl PoolNode for TestNode {
    fn next_node(&self) -> &NextNode<Self> {
      &self.link
    }
  }

  #[test]
  fn test_pop_on_empty_pool_yields_none() {
    let pool = Pool::<TestNode>::new("empty");
    assert!(pool.pop().is_none());
    assert!(pool.is_empty());
  }

  #[test]
  fn test_push_then_pop_round_trip() {
    let pool = Pool::new("round_trip");
    let node = TestNode::new(7);
    assert!(pool.push(node.clone()));
    assert_eq!(pool.len(), 1);

    let popped = pool.pop().expect("node should come back");
    assert!(Arc::ptr_eq(&node, &popped));
    assert!(!popped.link.is_pooled());
    assert!(pool.is_empty());
  }

  #[test]
  fn test_pop_is_lifo() {
    let pool = Pool::new("lifo");
    for id in 0..3 {
      pool.push(TestNode::new(id));
    }
    let order: Vec<usize> = std::iter::from_fn(|| pool.pop()).map(|n| n.id).collect();
    assert_eq!(order, vec![2, 1, 0]);
  }

  #[test]
  fn test_double_push_is_rejected() {
    let pool = Pool::new("double_push");
    let node = TestNode::new(1);
    assert!(pool.push(node.clone()));
    assert!(!pool.push(node.clone()));
    assert_eq!(pool.len(), 1);
    pool.pop();
    assert!(pool.pop().is_none());
  }

  #[test]
  fn test_long_chain_drops_without_recursion() {
    let pool = Pool::new("long_chain");
    for id in 0..200_000 {
      pool.push(TestNode::new(id));
    }
    drop(pool);
  }

  #[test]
  fn test_concurrent_push_pop_never_shares_a_node() {
    let pool = Arc::new(Pool::new("concurrent"));
    for id in 0..64 {
      pool.push(TestNode::new(id));
    }
    let held = Arc::new(StdMutex::new(HashSet::new()));

    let workers: Vec<_> = (0..8)
      .map(|_| {
        let pool = pool.clone();
        let held = held.clone();
        thread::spawn(move || {
          for _ in 0..2_000 {
            if let Some(node) = pool.pop() {
              assert!(held.lock().unwrap().insert(node.id), "node {} handed out twice", node.id);
              held.lock().unwrap().remove(&node.id);
              assert!(pool.push(node));
            }
          }
        })
      })
      .collect();
    for worker in workers {
      worker.join().expect("worker thread panicked");
    }
    assert_eq!(pool.len(), 64);
  }
}
