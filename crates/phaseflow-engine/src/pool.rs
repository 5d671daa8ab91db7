use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use phaseflow_core::error::{PhaseflowError, Result};

/// Bounded-concurrency admission shared by every in-flight tool task.
///
/// Cloning is cheap; clones share the same permits. Waiters are admitted in
/// the order they started waiting.
#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Held while a tool task runs; dropping it frees the slot.
pub struct PoolPermit {
    _permit: OwnedSemaphorePermit,
}

impl WorkerPool {
    /// A pool of at least one slot.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.available()
    }

    /// Wait for a free slot, or give up once `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<PoolPermit> {
        tokio::select! {
            _ = cancel.cancelled() => Err(PhaseflowError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => permit
                .map(|p| PoolPermit { _permit: p })
                .map_err(|_| PhaseflowError::Cancelled),
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_zero_capacity_clamped() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.capacity(), 1);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_bounds_concurrency() {
        let pool = WorkerPool::new(3);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let tasks = (0..10).map(|_| {
            let pool = pool.clone();
            let current = current.clone();
            let peak = peak.clone();
            let cancel = cancel.clone();
            async move {
                let _permit = pool.acquire(&cancel).await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }
        });
        futures::future::join_all(tasks).await;

        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(pool.available(), 3);
    }

    #[tokio::test]
    async fn test_acquire_honors_cancellation() {
        let pool = WorkerPool::new(1);
        let cancel = CancellationToken::new();
        let _held = pool.acquire(&cancel).await.unwrap();
        assert_eq!(pool.in_flight(), 1);

        cancel.cancel();
        let err = pool.acquire(&cancel).await.err().unwrap();
        assert!(matches!(err, PhaseflowError::Cancelled));
    }
}
