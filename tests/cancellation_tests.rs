use promise_pool::{CancelToken, CancellationSource, PromiseError, SourcePool, Violation};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,promise_pool=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

#[tokio::test]
async fn test_cancel_on_cancels_a_pending_promise() {
  setup_tracing_for_test();
  let pool_name = "test_cancel_on";
  tracing::info!("Starting test: {}", pool_name);
  let pool = SourcePool::<String>::new(pool_name);
  let cancellation = CancellationSource::create();

  let source = pool.create();
  let promise = source.promise();
  source.cancel_on(&cancellation.token(), "request aborted").unwrap();

  let canceller = tokio::spawn(async move {
    sleep(Duration::from_millis(20)).await;
    cancellation.cancel().unwrap();
    cancellation
  });

  assert_eq!(promise.await, Err(PromiseError::Canceled("request aborted".into())));
  let cancellation = canceller.await.unwrap();
  assert!(cancellation.is_cancellation_requested());
  cancellation.release().unwrap();
  tracing::info!("Finished test: {}", pool_name);
}

#[tokio::test]
async fn test_cancel_after_settlement_does_not_touch_the_result() {
  setup_tracing_for_test();
  let pool = SourcePool::<u32>::new("test_cancel_after_settle");
  let cancellation = CancellationSource::create();

  let source = pool.create();
  let promise = source.promise();
  source.cancel_on(&cancellation.token(), "too late").unwrap();
  source.try_resolve(12);
  cancellation.cancel().unwrap();

  assert_eq!(promise.await, Ok(12));
  cancellation.release().unwrap();
}

#[tokio::test]
async fn test_registration_order_and_panic_isolation() {
  setup_tracing_for_test();
  let cancellation = CancellationSource::create();
  let order = Arc::new(Mutex::new(Vec::new()));

  for id in 0..5usize {
    let order = order.clone();
    if id == 2 {
      cancellation
        .register(move || panic!("callback {} intentionally panicked", id))
        .unwrap();
      continue;
    }
    cancellation.register(move || order.lock().unwrap().push(id)).unwrap();
  }

  assert!(cancellation.cancel().is_ok());
  assert_eq!(*order.lock().unwrap(), vec![0, 1, 3, 4]);
  assert_eq!(
    cancellation.cancel(),
    Err(PromiseError::ProtocolViolation(Violation::AlreadyCancelled))
  );
  cancellation.release().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_linked_token_stops_a_tokio_task() {
  setup_tracing_for_test();
  let cancellation = CancellationSource::create();
  let linked = cancellation.link().unwrap();
  let ticks = Arc::new(AtomicUsize::new(0));

  let ticks_in_worker = ticks.clone();
  let worker = tokio::spawn(async move {
    loop {
      tokio::select! {
        _ = linked.cancelled() => break "stopped",
        _ = sleep(Duration::from_millis(5)) => {
          ticks_in_worker.fetch_add(1, Ordering::SeqCst);
        }
      }
    }
  });

  sleep(Duration::from_millis(30)).await;
  cancellation.cancel().unwrap();
  assert_eq!(worker.await.unwrap(), "stopped");
  assert!(ticks.load(Ordering::SeqCst) > 0);
  cancellation.release().unwrap();
}

#[tokio::test]
async fn test_released_source_invalidates_old_tokens() {
  setup_tracing_for_test();
  let cancellation = CancellationSource::create();
  let token = cancellation.token();
  assert!(token.is_valid());
  assert_eq!(token.is_cancellation_requested(), Ok(false));

  let released_version = cancellation.version();
  cancellation.release().unwrap();

  // The pool keeps the node alive, so the token sees a newer generation.
  assert!(!token.is_valid());
  match token.is_cancellation_requested() {
    Err(PromiseError::ProtocolViolation(Violation::StaleToken { token: stale, version })) => {
      assert_eq!(stale, released_version);
      assert_ne!(version, released_version);
    }
    other => panic!("Expected StaleToken violation, got {:?}", other),
  }
  assert!(matches!(
    token.register(|| {}),
    Err(PromiseError::ProtocolViolation(Violation::StaleToken { .. }))
  ));
}

#[tokio::test]
async fn test_none_token_never_cancels() {
  setup_tracing_for_test();
  let token = CancelToken::none();
  assert_eq!(token.is_cancellation_requested(), Ok(false));
  assert_eq!(
    token.register(|| {}),
    Err(PromiseError::ProtocolViolation(Violation::DefaultToken))
  );
}
