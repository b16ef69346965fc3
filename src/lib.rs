//! Pooled, versioned single-shot promises with cooperative cancellation
//! and a fail-fast join.

mod cancellation;
mod completion;
mod diagnostics;
mod error;
mod handle;
mod join;
mod pool;
mod runner;
mod source;

pub use cancellation::{CancelToken, CancellationSource};
pub use completion::{CompletionCore, Continuation, Status, UnitCompletionCore};
pub use diagnostics::{
  reset_hooks, set_fatal_error_reporter, set_unhandled_error_sink, FatalErrorReporter, UnhandledErrorSink,
};
pub use error::{Fault, PromiseError, Violation};
pub use handle::{Promise, PromiseAwaiter};
pub use join::{join_all, join_all_unit};
pub use pool::{NextNode, Pool, PoolNode};
pub use runner::{drive, RunnerPool};
pub use source::{PromiseSource, SourcePool, TaskSource};
