//! Connection Pool (§4.2): bounds the number of `StoreClient` handles in
//! flight, reusing them across concurrent flushes.
//!
//! Generalizes the donor's `Arc<Mutex<Connection>>` single-handle idiom
//! (`signals::db_storage::DbSignalStorage`) to a pool of N handles gated by
//! a semaphore, matching the pool's documented acquire/release contract.

use crate::config::PoolConfig;
use crate::error::StorageError;
use crate::metrics;
use crate::store::client::StoreClient;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, SemaphorePermit};

struct Inner {
    idle: Mutex<VecDeque<StoreClient>>,
    semaphore: Semaphore,
    max_size: usize,
    checked_out: AtomicUsize,
    factory: StoreClient,
    label: &'static str,
}

/// A checked-out handle. Returned to the pool on drop if the pool is not
/// already at `max_size`; otherwise the handle is simply closed (dropped).
pub struct PooledClient<'a> {
    client: Option<StoreClient>,
    inner: Arc<Inner>,
    _permit: SemaphorePermit<'a>,
}

impl<'a> std::ops::Deref for PooledClient<'a> {
    type Target = StoreClient;
    fn deref(&self) -> &StoreClient {
        self.client.as_ref().expect("client taken before drop")
    }
}

impl<'a> Drop for PooledClient<'a> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            let mut idle = self.inner.idle.lock();
            if idle.len() < self.inner.max_size {
                idle.push_back(client);
            }
            let in_use = self.inner.checked_out.fetch_sub(1, Ordering::Relaxed) - 1;
            metrics::set_pool_in_use(self.inner.label, in_use as f64);
        }
    }
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Inner>,
    wait_budget: Duration,
}

impl ConnectionPool {
    pub fn new(factory: StoreClient, config: &PoolConfig) -> Self {
        Self::with_label(factory, config, "hot")
    }

    /// Builds a pool tagged with `label` (e.g. `"hot"`/`"cold"`) for the
    /// `pool_in_use` gauge, so multiple pools in one process don't clobber
    /// each other's reading.
    pub fn with_label(factory: StoreClient, config: &PoolConfig, label: &'static str) -> Self {
        let mut idle = VecDeque::with_capacity(config.max_size);
        for _ in 0..config.pre_warm.min(config.max_size) {
            idle.push_back(factory.clone());
        }

        Self {
            inner: Arc::new(Inner {
                idle: Mutex::new(idle),
                semaphore: Semaphore::new(config.max_size),
                max_size: config.max_size,
                checked_out: AtomicUsize::new(0),
                factory,
                label,
            }),
            wait_budget: Duration::from_millis(config.wait_budget_ms),
        }
    }

    /// Blocks up to the configured wait budget; returns a fresh handle if
    /// under capacity, else waits for a handle to be released.
    pub async fn acquire(&self) -> Result<PooledClient<'_>, StorageError> {
        let start = Instant::now();
        let permit = tokio::time::timeout(self.wait_budget, self.inner.semaphore.acquire())
            .await
            .map_err(|_| StorageError::PoolExhausted {
                waited_ms: start.elapsed().as_millis() as u64,
            })?
            .expect("semaphore never closed");

        let client = {
            let mut idle = self.inner.idle.lock();
            idle.pop_front().unwrap_or_else(|| self.inner.factory.clone())
        };
        let in_use = self.inner.checked_out.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_pool_in_use(self.inner.label, in_use as f64);

        Ok(PooledClient {
            client: Some(client),
            inner: self.inner.clone(),
            _permit: permit,
        })
    }

    pub fn checked_out(&self) -> usize {
        self.inner.checked_out.load(Ordering::Relaxed)
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    /// Degraded when at least 90% of handles have been checked out; the
    /// caller is responsible for requiring this to hold for a full
    /// monitoring interval before reporting degraded status.
    pub fn is_saturated(&self) -> bool {
        self.checked_out() as f64 >= 0.9 * self.max_size() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreEndpoint;

    fn test_endpoint() -> StoreEndpoint {
        StoreEndpoint {
            host: "localhost".into(),
            port: 8123,
            user: "default".into(),
            password: String::new(),
            database: "marketprism_hot".into(),
            use_https: false,
        }
    }

    #[tokio::test]
    async fn acquire_respects_max_size() {
        let client = StoreClient::new(&test_endpoint()).unwrap();
        let pool = ConnectionPool::new(
            client,
            &PoolConfig {
                max_size: 2,
                pre_warm: 1,
                wait_budget_ms: 50,
            },
        );

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.checked_out(), 2);

        let timed_out = pool.acquire().await;
        assert!(matches!(timed_out, Err(StorageError::PoolExhausted { .. })));

        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn release_returns_handle_for_reuse() {
        let client = StoreClient::new(&test_endpoint()).unwrap();
        let pool = ConnectionPool::new(
            client,
            &PoolConfig {
                max_size: 1,
                pre_warm: 1,
                wait_budget_ms: 50,
            },
        );

        {
            let _a = pool.acquire().await.unwrap();
        }
        let _b = pool.acquire().await.unwrap();
        assert_eq!(pool.checked_out(), 1);
    }
}
