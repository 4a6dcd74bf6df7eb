//! Operation Scheduler
//!
//! Per-owner FIFO queue guaranteeing at-most-one in-flight operation. Every
//! public call on a `CacheStorage` or a `Cache` runs through its owner's
//! scheduler, so operations on one owner are totally ordered while distinct
//! owners stay concurrent.
//!
//! # Design
//!
//! A dedicated worker task drains an unbounded channel of boxed futures and
//! awaits each to completion before taking the next. Completion signaling is
//! structural: the worker advances when the operation future finishes on any
//! exit path, so an erroring operation can never stall the queue.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

/// FIFO single-flight operation queue for one owner
pub struct OperationScheduler {
    tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
    pending: Arc<AtomicUsize>,
}

impl OperationScheduler {
    /// Create a scheduler and spawn its worker task
    ///
    /// Must be called from within a Tokio runtime, since the worker is
    /// spawned immediately. The worker exits once the scheduler is dropped
    /// and the queue drains.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        let pending = Arc::new(AtomicUsize::new(0));

        let worker_pending = pending.clone();
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                op.await;
                worker_pending.fetch_sub(1, Ordering::Relaxed);
            }
        });

        Self { tx, pending }
    }

    /// Enqueue an operation without waiting for its result
    pub fn schedule<F>(&self, op: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::Relaxed);
        // Send only fails after the worker is gone, i.e. during teardown.
        let _ = self.tx.send(Box::pin(op));
    }

    /// Enqueue an operation and await its result
    ///
    /// The operation runs after every previously scheduled operation has
    /// completed. If the scheduler is torn down before the operation runs,
    /// the caller gets a storage error rather than hanging.
    pub async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        self.schedule(async move {
            let result = op.await;
            // The caller may have gone away; the operation still ran.
            let _ = result_tx.send(result);
        });

        match result_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::storage("operation scheduler shut down")),
        }
    }

    /// Number of operations queued or running
    pub fn pending_operations(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}

impl Default for OperationScheduler {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_outside_runtime_panics() {
        // Constructing a scheduler spawns its worker, which requires a
        // runtime; without one this must panic rather than hang later.
        let result = std::panic::catch_unwind(OperationScheduler::new);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_returns_result() {
        let scheduler = OperationScheduler::new();
        let value = scheduler.run(async { Ok(41 + 1) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_fifo_ordering() {
        let scheduler = Arc::new(OperationScheduler::new());
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        // The first operation sleeps; later operations must still run after it.
        let mut handles = Vec::new();
        for i in 0..5u32 {
            let scheduler = scheduler.clone();
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                scheduler
                    .run(async move {
                        if i == 0 {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                        }
                        log.lock().push(i);
                        Ok(())
                    })
                    .await
            }));
            // Yield so submission order is deterministic across spawned tasks.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let scheduler = Arc::new(OperationScheduler::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let scheduler = scheduler.clone();
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                scheduler
                    .run(async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_operation_does_not_stall_queue() {
        let scheduler = OperationScheduler::new();

        let err: Result<()> = scheduler
            .run(async { Err(Error::storage("boom")) })
            .await;
        assert!(err.is_err());

        // Queue must still advance.
        let value = scheduler.run(async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_pending_count_drains() {
        let scheduler = OperationScheduler::new();
        scheduler.run(async { Ok(()) }).await.unwrap();
        // The completed operation has been accounted for by the worker.
        tokio::task::yield_now().await;
        assert_eq!(scheduler.pending_operations(), 0);
    }
}
