use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded counting gate for concurrent units of work. Acquisition waits
/// when the pool is exhausted, so the caller's accept loop exerts
/// backpressure instead of spawning without limit.
#[derive(Clone)]
pub struct AdmissionLimiter {
    sem: Arc<Semaphore>,
}

/// Held for the lifetime of one unit of work. Dropping it returns the
/// token, including on failure or early return.
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            sem: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub async fn acquire(&self) -> AdmissionPermit {
        // The semaphore is never closed, so acquisition cannot fail.
        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .expect("admission semaphore closed");
        AdmissionPermit { _permit: permit }
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn test_scoped_release() {
        let limiter = AdmissionLimiter::new(2);
        {
            let _permit = limiter.acquire().await;
            assert_eq!(limiter.available(), 1);
        }
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test]
    async fn test_bounded_concurrency() {
        let limiter = AdmissionLimiter::new(2);
        let outstanding = Arc::new(AtomicUsize::new(0));
        let max_outstanding = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = limiter.clone();
            let outstanding = outstanding.clone();
            let max_outstanding = max_outstanding.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await;
                let current = outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                max_outstanding.fetch_max(current, Ordering::SeqCst);
                sleep(Duration::from_millis(20)).await;
                outstanding.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_outstanding.load(Ordering::SeqCst), 2);
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test]
    async fn test_zero_capacity_clamped() {
        let limiter = AdmissionLimiter::new(0);
        let _permit = limiter.acquire().await;
    }
}
