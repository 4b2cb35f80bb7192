use super::{CasOutcome, CoordinationStore, Versioned};
use crate::{Error, Result, SystemClock, TimeSource};
use core::{future::Future, time::Duration};
use portable_atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Instance health as observed through store round-trips.
///
/// Any failed or timed-out store call marks the instance unhealthy; the next
/// successful call marks it healthy again.
#[derive(Debug)]
pub struct HealthState {
    healthy: AtomicBool,
    last_success_millis: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            last_success_millis: AtomicU64::new(0),
        }
    }
}

impl HealthState {
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Millis since the epoch of the last successful store call, `0` if none.
    pub fn last_success_millis(&self) -> u64 {
        self.last_success_millis.load(Ordering::Acquire)
    }

    fn mark_success(&self) {
        self.last_success_millis
            .fetch_max(SystemClock.current_millis(), Ordering::AcqRel);
        self.healthy.store(true, Ordering::Release);
    }

    fn mark_failure(&self) {
        self.healthy.store(false, Ordering::Release);
    }
}

/// Bounded-latency access to a [`CoordinationStore`].
///
/// Every call is wrapped in the configured timeout. Store failures and
/// timeouts are surfaced as [`Error::StoreUnavailable`] and never retried
/// here; retrying is the caller's decision.
pub struct StoreClient<S> {
    store: Arc<S>,
    timeout: Duration,
    health: Arc<HealthState>,
}

impl<S> Clone for StoreClient<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            timeout: self.timeout,
            health: Arc::clone(&self.health),
        }
    }
}

impl<S: CoordinationStore> StoreClient<S> {
    pub fn new(store: Arc<S>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            health: Arc::new(HealthState::default()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn health(&self) -> &HealthState {
        &self.health
    }

    pub async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        self.call("get", key, self.store.get(key)).await
    }

    pub async fn put(&self, key: &str, value: String) -> Result<u64> {
        self.call("put", key, self.store.put(key, value)).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.call("delete", key, self.store.delete(key)).await
    }

    pub async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: String,
    ) -> Result<CasOutcome> {
        self.call("compare-and-swap", key, self.store.compare_and_swap(key, expected, value))
            .await
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.call("list", prefix, self.store.list(prefix)).await
    }

    async fn call<T, F>(&self, op: &str, key: &str, fut: F) -> Result<T>
    where
        F: Future<Output = core::result::Result<T, super::StoreError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => {
                self.health.mark_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.health.mark_failure();
                #[cfg(feature = "tracing")]
                tracing::warn!(op, key, error = %e, "store call failed");
                Err(Error::StoreUnavailable {
                    context: format!("{op} `{key}` {e}"),
                })
            }
            Err(_) => {
                self.health.mark_failure();
                #[cfg(feature = "tracing")]
                tracing::warn!(op, key, timeout_ms = self.timeout.as_millis() as u64, "store call timed out");
                Err(Error::StoreUnavailable {
                    context: format!("{op} `{key}` timed out after {}ms", self.timeout.as_millis()),
                })
            }
        }
    }
}
