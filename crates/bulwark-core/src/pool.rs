//! Bounded pool of reusable worker slots.
//!
//! - Slots are created lazily through a `SlotFactory`, never more than
//!   `max_size`.
//! - Waiters are served in arrival order (the semaphore is FIFO-fair).
//! - `PoolSlot` is a guard: dropping it releases the slot, and an explicit
//!   `release()` followed by the drop is a no-op, so the free count cannot
//!   drift.
//! - After `shutdown()`, pending and future acquires fail with `PoolClosed`,
//!   idle slots are destroyed at once and busy slots are destroyed when they
//!   come back.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};

/// Creates and destroys the workers behind pool slots.
#[async_trait]
pub trait SlotFactory<W>: Send + Sync {
    async fn create(&self, slot_id: u64) -> EngineResult<W>;

    /// Runs once per slot when the pool shuts down. Must not block.
    fn destroy(&self, _slot_id: u64, _worker: W) {}
}

/// Default worker handle: identity plus a served-call counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    pub id: u64,
    pub served: u64,
}

#[derive(Debug, Default)]
pub struct WorkerFactory;

#[async_trait]
impl SlotFactory<Worker> for WorkerFactory {
    async fn create(&self, slot_id: u64) -> EngineResult<Worker> {
        Ok(Worker {
            id: slot_id,
            served: 0,
        })
    }

    fn destroy(&self, slot_id: u64, worker: Worker) {
        debug!(slot_id, served = worker.served, "worker slot destroyed");
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_size: usize,
    pub created: usize,
    pub idle: usize,
    pub in_use: usize,
    pub waiting: usize,
    pub closed: bool,
}

impl PoolStats {
    /// Share of slots in use, 0.0..=1.0.
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            return 1.0;
        }
        self.in_use as f64 / self.max_size as f64
    }
}

struct PoolInner<W> {
    max_size: usize,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<(u64, W)>>,
    factory: Arc<dyn SlotFactory<W>>,
    next_id: AtomicU64,
    created: AtomicUsize,
    in_use: AtomicUsize,
    waiting: AtomicUsize,
    closed: AtomicBool,
    returned: Notify,
}

impl<W> PoolInner<W> {
    /// Worker goes back to idle (or is destroyed) *before* the permit is
    /// dropped, so idle + in_use never exceeds max_size.
    ///
    /// `closed` is read under the idle lock, the same lock `shutdown` holds
    /// while flipping it, so a worker can't land in idle after the sweep.
    fn put_back(&self, slot_id: u64, worker: W, permit: OwnedSemaphorePermit) {
        let mut idle = self.idle.lock();
        if self.closed.load(Ordering::Acquire) {
            drop(idle);
            self.factory.destroy(slot_id, worker);
        } else {
            idle.push((slot_id, worker));
            drop(idle);
        }
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        drop(permit);
        self.returned.notify_waiters();
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct ResourcePool<W: Send + 'static> {
    inner: Arc<PoolInner<W>>,
}

impl<W: Send + 'static> Clone for ResourcePool<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ResourcePool<Worker> {
    /// Pool of plain `Worker` handles.
    pub fn with_workers(max_size: usize) -> Self {
        Self::new(max_size, Arc::new(WorkerFactory))
    }
}

impl<W: Send + 'static> ResourcePool<W> {
    pub fn new(max_size: usize, factory: Arc<dyn SlotFactory<W>>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                max_size,
                semaphore: Arc::new(Semaphore::new(max_size)),
                idle: Mutex::new(Vec::with_capacity(max_size)),
                factory,
                next_id: AtomicU64::new(1),
                created: AtomicUsize::new(0),
                in_use: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                returned: Notify::new(),
            }),
        }
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Wait (in arrival order) for a free slot, up to `timeout`.
    pub async fn acquire(&self, timeout: Duration) -> EngineResult<PoolSlot<W>> {
        if self.is_closed() {
            return Err(EngineError::PoolClosed);
        }

        let permit = {
            let _waiting = WaitingGuard::enter(&self.inner.waiting);
            let acquire = Arc::clone(&self.inner.semaphore).acquire_owned();
            match tokio::time::timeout(timeout, acquire).await {
                Err(_elapsed) => return Err(EngineError::PoolTimeout { waited: timeout }),
                Ok(Err(_closed)) => return Err(EngineError::PoolClosed),
                Ok(Ok(permit)) => permit,
            }
        };

        let reused = self.inner.idle.lock().pop();
        let (slot_id, worker) = match reused {
            Some(entry) => entry,
            None => {
                let slot_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                // a failed create drops the permit, so the slot stays free
                let worker = self.inner.factory.create(slot_id).await?;
                self.inner.created.fetch_add(1, Ordering::AcqRel);
                debug!(slot_id, "worker slot created");
                (slot_id, worker)
            }
        };
        self.inner.in_use.fetch_add(1, Ordering::AcqRel);

        Ok(PoolSlot {
            slot_id,
            worker: Some(worker),
            permit: Some(permit),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Return a slot. Always succeeds; releasing twice is a no-op.
    pub fn release(&self, slot: &mut PoolSlot<W>) {
        slot.release();
    }

    /// Reject pending and future acquires, destroy idle slots.
    pub fn shutdown(&self) {
        let idle: Vec<(u64, W)> = {
            let mut idle = self.inner.idle.lock();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *idle)
        };
        self.inner.semaphore.close();

        let destroyed = idle.len();
        for (slot_id, worker) in idle {
            self.inner.factory.destroy(slot_id, worker);
        }
        info!(
            destroyed,
            in_use = self.inner.in_use.load(Ordering::Acquire),
            "resource pool shut down"
        );
    }

    /// Wait until every busy slot has come back. Returns `false` if `timeout`
    /// elapsed first (some call is still holding a slot).
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let returned = self.inner.returned.notified();
            if self.inner.in_use.load(Ordering::Acquire) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, returned).await.is_err() {
                return self.inner.in_use.load(Ordering::Acquire) == 0;
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_size: self.inner.max_size,
            created: self.inner.created.load(Ordering::Acquire),
            idle: self.inner.idle.lock().len(),
            in_use: self.inner.in_use.load(Ordering::Acquire),
            waiting: self.inner.waiting.load(Ordering::Acquire),
            closed: self.is_closed(),
        }
    }
}

/// A held slot. Released on drop if not released explicitly.
pub struct PoolSlot<W> {
    slot_id: u64,
    worker: Option<W>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner<W>>,
}

impl<W> PoolSlot<W> {
    pub fn id(&self) -> u64 {
        self.slot_id
    }

    /// `None` once the slot has been released.
    pub fn worker(&self) -> Option<&W> {
        self.worker.as_ref()
    }

    pub fn worker_mut(&mut self) -> Option<&mut W> {
        self.worker.as_mut()
    }

    pub fn is_released(&self) -> bool {
        self.worker.is_none()
    }

    pub fn release(&mut self) {
        if let (Some(worker), Some(permit)) = (self.worker.take(), self.permit.take()) {
            self.pool.put_back(self.slot_id, worker, permit);
        }
    }
}

impl<W> Drop for PoolSlot<W> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<W> std::fmt::Debug for PoolSlot<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSlot")
            .field("slot_id", &self.slot_id)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
        destroyed: AtomicUsize,
    }

    #[async_trait]
    impl SlotFactory<u64> for CountingFactory {
        async fn create(&self, slot_id: u64) -> EngineResult<u64> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(slot_id)
        }

        fn destroy(&self, _slot_id: u64, _worker: u64) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn only_max_size_acquires_succeed_without_release() {
        let pool = ResourcePool::with_workers(2);

        let a = pool.acquire(Duration::ZERO).await.unwrap();
        let b = pool.acquire(Duration::ZERO).await.unwrap();
        assert_ne!(a.id(), b.id());

        let err = pool.acquire(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, EngineError::PoolTimeout { .. }));

        let stats = pool.stats();
        assert_eq!(stats.in_use, 2);
        assert_eq!(stats.created, 2);
        assert_eq!(stats.waiting, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_acquire_proceeds_after_release() {
        let pool = ResourcePool::with_workers(1);
        let mut held = pool.acquire(Duration::ZERO).await.unwrap();
        let held_id = held.id();

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire(Duration::from_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.stats().waiting, 1);

        pool.release(&mut held);
        let slot = waiter.await.unwrap().unwrap();
        // the same worker is reused, not a new one
        assert_eq!(slot.id(), held_id);
        assert_eq!(pool.stats().created, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_served_in_arrival_order() {
        let pool = ResourcePool::with_workers(1);
        let mut held = pool.acquire(Duration::ZERO).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for name in ["first", "second"] {
            let pool = pool.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let slot = pool.acquire(Duration::from_secs(5)).await.unwrap();
                tx.send(name).unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(slot);
            });
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        held.release();
        assert_eq!(rx.recv().await, Some("first"));
        assert_eq!(rx.recv().await, Some("second"));
    }

    #[tokio::test]
    async fn double_release_keeps_counts_consistent() {
        let pool = ResourcePool::with_workers(1);
        let mut slot = pool.acquire(Duration::ZERO).await.unwrap();

        slot.release();
        slot.release();
        pool.release(&mut slot);
        assert!(slot.is_released());
        assert!(slot.worker().is_none());
        drop(slot);

        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 1);

        // exactly one permit is available again
        let _a = pool.acquire(Duration::ZERO).await.unwrap();
        assert!(pool.acquire(Duration::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn slots_are_created_lazily() {
        let factory = Arc::new(CountingFactory::default());
        let pool = ResourcePool::<u64>::new(4, factory.clone());
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);

        for _ in 0..3 {
            let slot = pool.acquire(Duration::ZERO).await.unwrap();
            drop(slot);
        }
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_rejects_pending_and_destroys_busy_slots_on_return() {
        let factory = Arc::new(CountingFactory::default());
        let pool = ResourcePool::<u64>::new(1, factory.clone());
        let busy = pool.acquire(Duration::ZERO).await.unwrap();

        let pending = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire(Duration::from_secs(60)).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.stats().waiting, 1);

        pool.shutdown();
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::PoolClosed));
        assert!(matches!(
            pool.acquire(Duration::ZERO).await.unwrap_err(),
            EngineError::PoolClosed
        ));
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 0);

        drop(busy);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert!(pool.drain(Duration::from_millis(1)).await);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn shutdown_destroys_idle_slots_at_once() {
        let factory = Arc::new(CountingFactory::default());
        let pool = ResourcePool::<u64>::new(2, factory.clone());
        drop(pool.acquire(Duration::ZERO).await.unwrap());
        assert_eq!(pool.stats().idle, 1);

        pool.shutdown();
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert!(stats.closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn release_racing_shutdown_still_destroys_every_slot() {
        for _ in 0..200 {
            let factory = Arc::new(CountingFactory::default());
            let pool = ResourcePool::<u64>::new(4, factory.clone());
            let mut slots = Vec::new();
            for _ in 0..4 {
                slots.push(pool.acquire(Duration::ZERO).await.unwrap());
            }

            let barrier = Arc::new(std::sync::Barrier::new(2));
            let releaser = std::thread::spawn({
                let barrier = barrier.clone();
                move || {
                    barrier.wait();
                    drop(slots);
                }
            });
            barrier.wait();
            pool.shutdown();
            releaser.join().unwrap();

            assert_eq!(pool.stats().idle, 0);
            assert_eq!(factory.destroyed.load(Ordering::SeqCst), 4);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out_while_a_slot_is_held() {
        let pool = ResourcePool::with_workers(1);
        let slot = pool.acquire(Duration::ZERO).await.unwrap();

        assert!(!pool.drain(Duration::from_millis(50)).await);

        let release_later = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(slot);
        });
        assert!(pool.drain(Duration::from_secs(1)).await);
        release_later.await.unwrap();
    }
}
