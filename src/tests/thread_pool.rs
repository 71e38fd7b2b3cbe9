use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};

use crate::failure::{Cause, FailureKind, PropagatedFailure};
use crate::observer::FailureObserver;
use crate::thread_pool::FailFastThreadPool;
use crate::{PoolConfig, PoolError};

const WAIT: Duration = Duration::from_secs(5);

fn observed_pool(threads: u32) -> (FailFastThreadPool, Receiver<PropagatedFailure>) {
    let (observer, observed) = FailureObserver::channel();
    let config = PoolConfig::builder()
        .threads(threads)
        .thread_name_prefix("test-worker")
        .observer(observer)
        .build()
        .unwrap();
    (FailFastThreadPool::with_config(config).unwrap(), observed)
}

// Occupies one worker until the returned sender is used.
fn block_worker(pool: &FailFastThreadPool) -> Sender<()> {
    let (started_tx, started_rx) = bounded(1);
    let (release_tx, release_rx) = bounded::<()>(1);
    let _ = pool.submit(move || {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        Ok(())
    });
    started_rx.recv_timeout(WAIT).unwrap();
    release_tx
}

fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

#[derive(Debug, PartialEq)]
struct ChecksumMismatch {
    block: u64,
}

impl fmt::Display for ChecksumMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "checksum mismatch in block {}", self.block)
    }
}

impl std::error::Error for ChecksumMismatch {}

#[test]
fn zero_threads_is_invalid_configuration() {
    match FailFastThreadPool::new(0) {
        Err(PoolError::InvalidConfiguration(_)) => {}
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("pool with zero threads was created"),
    }
}

#[test]
fn sleeping_items_resolve_with_their_values() {
    let (pool, observed) = observed_pool(2);

    let handles: Vec<_> = (0..3)
        .map(|i| {
            pool.submit(move || {
                thread::sleep(Duration::from_millis(10));
                Ok(i * 100)
            })
        })
        .collect();

    let values: Vec<i32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(values, vec![0, 100, 200]);

    assert_eq!(pool.shutdown(true), 0);
    assert!(observed.try_recv().is_err());
    assert_eq!(pool.failed_workers(), 0);
}

#[test]
fn task_error_reaches_handle_with_original_message() {
    let (pool, observed) = observed_pool(1);

    let handle = pool.submit::<(), _>(|| Err(anyhow!("boom")));
    let failure = handle.join().unwrap_err();

    assert_eq!(failure.kind(), FailureKind::TaskFailure);
    match failure.cause() {
        Cause::Error(e) => assert_eq!(e.to_string(), "boom"),
        other => panic!("unexpected cause {:?}", other),
    }
    assert_eq!(failure.thread(), Some("test-worker-0"));

    pool.shutdown(true);
    assert!(observed.try_recv().is_err());
}

#[test]
fn task_error_keeps_its_type() {
    let (pool, _observed) = observed_pool(1);

    let handle = pool.submit::<(), _>(|| Err(ChecksumMismatch { block: 9 }.into()));
    let failure = handle.join().unwrap_err();

    assert_eq!(
        failure.downcast_ref::<ChecksumMismatch>(),
        Some(&ChecksumMismatch { block: 9 })
    );
}

#[test]
fn panic_in_tracked_item_is_task_failure() {
    let (pool, observed) = observed_pool(1);

    let handle = pool.submit::<(), _>(|| {
        panic_control::disable_hook_in_current_thread();
        panic!("index out of range");
    });
    let failure = handle.join().unwrap_err();

    assert_eq!(failure.kind(), FailureKind::TaskFailure);
    match failure.cause() {
        Cause::Panic(p) => assert_eq!(p.message(), "index out of range"),
        other => panic!("unexpected cause {:?}", other),
    }

    pool.shutdown(true);
    assert!(observed.try_recv().is_err());
}

#[test]
fn cancel_before_start_raises_cancellation() {
    let (pool, observed) = observed_pool(1);
    let release = block_worker(&pool);

    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = ran.clone();
    let handle = pool.submit(move || {
        ran2.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    assert!(handle.cancel());
    release.send(()).unwrap();

    let failure = handle.join().unwrap_err();
    assert_eq!(failure.kind(), FailureKind::TaskCancelled);
    assert!(matches!(failure.cause(), Cause::Cancelled(_)));
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    pool.shutdown(true);
    assert!(observed.try_recv().is_err());
}

#[test]
fn cancel_in_flight_is_seen_by_cooperative_item() {
    let (pool, _observed) = observed_pool(1);
    let (started_tx, started_rx) = bounded(1);

    let handle = pool.submit_cancellable(move |token| {
        started_tx.send(()).unwrap();
        while !token.is_cancelled() {
            thread::sleep(Duration::from_millis(1));
        }
        Ok(5)
    });

    started_rx.recv_timeout(WAIT).unwrap();
    assert!(handle.cancel());

    let failure = handle.join().unwrap_err();
    assert!(failure.is_cancelled());
}

#[test]
fn untracked_panic_is_thread_fault_observed_once() {
    let (pool, observed) = observed_pool(1);

    pool.execute(|| {
        panic_control::disable_hook_in_current_thread();
        panic!("kaboom");
    });

    let failure = observed.recv_timeout(WAIT).unwrap();
    assert_eq!(failure.kind(), FailureKind::ThreadFault);
    assert_eq!(failure.thread(), Some("test-worker-0"));
    match failure.cause() {
        Cause::Panic(p) => assert_eq!(p.message(), "kaboom"),
        other => panic!("unexpected cause {:?}", other),
    }

    pool.shutdown(true);
    assert!(observed.try_recv().is_err());
    assert_eq!(pool.failed_workers(), 1);
}

#[test]
fn raised_failure_is_not_wrapped_again() {
    let (pool, observed) = observed_pool(1);

    pool.execute(|| PropagatedFailure::task_failed(anyhow!("escalated")).raise());

    let failure = observed.recv_timeout(WAIT).unwrap();
    assert_eq!(failure.kind(), FailureKind::TaskFailure);
    assert_eq!(failure.message(), "escalated");

    pool.shutdown(true);
    assert!(observed.try_recv().is_err());
}

#[test]
fn failure_of_dropped_handle_goes_to_observer() {
    let (pool, observed) = observed_pool(1);

    drop(pool.submit::<(), _>(|| Err(anyhow!("nobody is listening"))));

    let failure = observed.recv_timeout(WAIT).unwrap();
    assert_eq!(failure.message(), "nobody is listening");

    pool.shutdown(true);
    assert!(observed.try_recv().is_err());
}

#[test]
fn successful_items_raise_nothing() {
    let (pool, observed) = observed_pool(4);

    let handles: Vec<_> = (0..100u64).map(|i| pool.submit(move || Ok(i * i))).collect();
    let sum: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(sum, (0..100u64).map(|i| i * i).sum());

    // dropped handles of successful items stay silent as well
    for _ in 0..10 {
        drop(pool.submit(|| Ok(())));
    }

    pool.shutdown(true);
    assert!(observed.try_recv().is_err());
    assert_eq!(pool.failed_workers(), 0);
}

#[test]
fn single_worker_runs_items_in_submission_order() {
    let (pool, _observed) = observed_pool(1);
    let release = block_worker(&pool);
    let (order_tx, order_rx) = unbounded();

    let handles: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|name| {
            let order_tx = order_tx.clone();
            pool.submit(move || {
                order_tx.send(name).unwrap();
                Ok(())
            })
        })
        .collect();
    release.send(()).unwrap();

    for handle in handles {
        handle.join().unwrap();
    }
    let order: Vec<_> = order_rx.try_iter().collect();
    assert_eq!(order, vec!["a", "b", "c"]);
}

#[test]
fn failed_worker_is_replaced_under_the_same_name() {
    let (pool, observed) = observed_pool(2);

    pool.execute(|| {
        panic_control::disable_hook_in_current_thread();
        panic!("worker down");
    });
    let failure = observed.recv_timeout(WAIT).unwrap();
    let failed_name = failure.thread().unwrap().to_string();
    wait_until(|| pool.failed_workers() == 1);
    wait_until(|| pool.live_workers() == 2);

    // keep both workers busy so the replacement has to take an item
    let (names_tx, names_rx) = unbounded();
    let (release_tx, release_rx) = bounded::<()>(0);
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let names_tx = names_tx.clone();
            let release_rx = release_rx.clone();
            pool.submit(move || {
                names_tx.send(thread::current().name().unwrap().to_string()).unwrap();
                release_rx.recv().unwrap();
                Ok(())
            })
        })
        .collect();
    let mut names: Vec<String> = (0..2).map(|_| names_rx.recv_timeout(WAIT).unwrap()).collect();
    for _ in 0..2 {
        release_tx.send(()).unwrap();
    }
    for handle in handles {
        handle.join().unwrap();
    }

    names.sort();
    assert_eq!(names, vec!["test-worker-0", "test-worker-1"]);
    assert!(names.contains(&failed_name));

    pool.shutdown(true);
    assert_eq!(pool.live_workers(), 0);
    assert!(observed.try_recv().is_err());
}

#[test]
fn cancelled_item_does_not_cost_the_only_worker() {
    let (pool, observed) = observed_pool(1);
    let release = block_worker(&pool);

    let cancelled = pool.submit(|| Ok(1));
    assert!(cancelled.cancel());
    release.send(()).unwrap();
    assert!(cancelled.join().unwrap_err().is_cancelled());

    let next = pool.submit(|| Ok(2));
    match next.join_timeout(WAIT) {
        Ok(outcome) => assert_eq!(outcome.unwrap(), 2),
        Err(_) => panic!("item after a cancellation never ran"),
    }
    assert_eq!(pool.failed_workers(), 1);
    wait_until(|| pool.live_workers() == 1);

    pool.shutdown(true);
    assert!(observed.try_recv().is_err());
}

#[test]
fn pool_keeps_serving_after_every_worker_failed() {
    let (pool, observed) = observed_pool(2);

    let failing: Vec<_> = (0..2)
        .map(|i| pool.submit::<(), _>(move || Err(anyhow!("failure {}", i))))
        .collect();
    for handle in failing {
        assert_eq!(handle.join().unwrap_err().kind(), FailureKind::TaskFailure);
    }

    let next = pool.submit(|| Ok(3));
    match next.join_timeout(WAIT) {
        Ok(outcome) => assert_eq!(outcome.unwrap(), 3),
        Err(_) => panic!("item after worker failures never ran"),
    }
    wait_until(|| pool.failed_workers() == 2);
    wait_until(|| pool.live_workers() == pool.threads() as usize);

    assert_eq!(pool.shutdown(true), 0);
    assert!(observed.try_recv().is_err());
}

#[test]
fn each_failing_item_raises_exactly_once() {
    const ITEMS: usize = 8;
    let (pool, observed) = observed_pool(ITEMS as u32);

    for i in 0..ITEMS {
        drop(pool.submit::<(), _>(move || Err(anyhow!("failure {}", i))));
    }

    let mut messages: Vec<String> = (0..ITEMS)
        .map(|_| observed.recv_timeout(WAIT).unwrap().message().to_string())
        .collect();
    messages.sort();

    let mut expected: Vec<String> = (0..ITEMS).map(|i| format!("failure {}", i)).collect();
    expected.sort();
    assert_eq!(messages, expected);

    pool.shutdown(true);
    assert!(observed.try_recv().is_err());
}
