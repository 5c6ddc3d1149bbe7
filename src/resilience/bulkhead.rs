use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use crate::errors::ApiError;

#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    /// Concurrent in-flight callers per resource.
    pub max_concurrent: usize,
    /// Callers allowed to wait for a slot; beyond this the call is shed.
    pub max_waiting: usize,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_waiting: 100,
        }
    }
}

/// Bounded concurrency pool isolating one resource from starving others.
/// Waiting for a slot is cancellable: dropping the acquire future releases
/// the caller's place in line.
pub struct Bulkhead {
    name: String,
    semaphore: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    max_waiting: usize,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Self {
        Self {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            waiting: Arc::new(AtomicUsize::new(0)),
            max_waiting: config.max_waiting,
        }
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, ApiError> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(permit);
        }

        if self.waiting.load(Ordering::Acquire) >= self.max_waiting {
            warn!(bulkhead = %self.name, "bulkhead waiting queue full, shedding call");
            return Err(ApiError::ServiceUnavailable {
                resource: self.name.clone(),
            });
        }

        let _waiter = WaiterGuard::register(self.waiting.clone());
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ApiError::ServiceUnavailable {
                resource: self.name.clone(),
            })
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Keeps the waiter count honest even when an acquire future is dropped.
struct WaiterGuard {
    waiting: Arc<AtomicUsize>,
}

impl WaiterGuard {
    fn register(waiting: Arc<AtomicUsize>) -> Self {
        waiting.fetch_add(1, Ordering::AcqRel);
        Self { waiting }
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Named bulkheads, created lazily with the shared configuration.
pub struct BulkheadRegistry {
    bulkheads: RwLock<HashMap<String, Arc<Bulkhead>>>,
    config: BulkheadConfig,
}

impl BulkheadRegistry {
    pub fn new(config: BulkheadConfig) -> Self {
        Self {
            bulkheads: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn get(&self, name: &str) -> Arc<Bulkhead> {
        {
            let bulkheads = self.bulkheads.read().unwrap_or_else(|p| p.into_inner());
            if let Some(bulkhead) = bulkheads.get(name) {
                return bulkhead.clone();
            }
        }
        let mut bulkheads = self.bulkheads.write().unwrap_or_else(|p| p.into_inner());
        bulkheads
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Bulkhead::new(name, self.config.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn permits_are_released_on_drop() {
        let bulkhead = Bulkhead::new(
            "store",
            BulkheadConfig {
                max_concurrent: 2,
                max_waiting: 10,
            },
        );

        let first = bulkhead.acquire().await.expect("permit 1");
        let _second = bulkhead.acquire().await.expect("permit 2");
        assert_eq!(bulkhead.available(), 0);

        drop(first);
        assert_eq!(bulkhead.available(), 1);
        bulkhead.acquire().await.expect("slot freed");
    }

    #[tokio::test]
    async fn full_waiting_queue_sheds_callers() {
        let bulkhead = Arc::new(Bulkhead::new(
            "store",
            BulkheadConfig {
                max_concurrent: 1,
                max_waiting: 1,
            },
        ));

        let _held = bulkhead.acquire().await.expect("occupy the only slot");

        // One caller may wait in line.
        let queued = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move { bulkhead.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The next caller finds the queue full.
        let err = bulkhead.acquire().await.unwrap_err();
        assert!(matches!(err, ApiError::ServiceUnavailable { .. }));

        queued.abort();
    }

    #[tokio::test]
    async fn cancelled_waiters_free_their_place_in_line() {
        let bulkhead = Arc::new(Bulkhead::new(
            "store",
            BulkheadConfig {
                max_concurrent: 1,
                max_waiting: 1,
            },
        ));

        let _held = bulkhead.acquire().await.expect("occupy");

        let queued = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move { bulkhead.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queued.abort();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The abandoned waiter no longer occupies the queue.
        let queued_again = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move { bulkhead.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!queued_again.is_finished(), "waiter admitted to the queue");
        queued_again.abort();
    }
}
