//! The cluster-wide high-water mark.
//!
//! The counter lives under a single store key holding the highest number ever
//! allocated. [`GlobalCounter::advance`] claims a contiguous range with a
//! compare-and-swap on that key's version, so two instances that read the
//! same value can never both commit a range starting after it.

use crate::{
    Error, Result,
    store::{CasOutcome, CoordinationStore, StoreClient, Versioned, keys::COUNTER_KEY},
};
use core::{ops::RangeInclusive, time::Duration};
use portable_atomic::{AtomicU64, Ordering};

/// CAS retry policy for [`GlobalCounter::advance`].
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Retries allowed after the first conflicting attempt.
    pub retry_limit: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

pub struct GlobalCounter<S> {
    client: StoreClient<S>,
    start: u64,
    retry: RetryPolicy,
    cached: AtomicU64,
}

impl<S: CoordinationStore> GlobalCounter<S> {
    pub fn new(client: StoreClient<S>, start: u64, retry: RetryPolicy) -> Self {
        Self {
            client,
            start,
            retry,
            cached: AtomicU64::new(start),
        }
    }

    /// Seeds the counter with the start value if no instance has done so,
    /// and returns the stored value.
    pub async fn initialize(&self) -> Result<u64> {
        loop {
            if let Some(current) = self.read().await? {
                let value = self.parse(&current)?;
                self.observe(value);
                #[cfg(feature = "tracing")]
                tracing::info!(value, "loaded global counter");
                return Ok(value);
            }
            match self
                .client
                .compare_and_swap(COUNTER_KEY, None, self.start.to_string())
                .await?
            {
                CasOutcome::Swapped { .. } => {
                    self.cached.store(self.start, Ordering::Release);
                    #[cfg(feature = "tracing")]
                    tracing::info!(value = self.start, "seeded global counter");
                    return Ok(self.start);
                }
                // Another instance seeded it first; read theirs.
                CasOutcome::Conflict { .. } => {}
            }
        }
    }

    /// Reads the authoritative value from the store.
    pub async fn current(&self) -> Result<u64> {
        let value = match self.read().await? {
            Some(current) => self.parse(&current)?,
            None => self.start,
        };
        self.observe(value);
        Ok(value)
    }

    /// Last value this instance saw, without a store round-trip.
    pub fn cached(&self) -> u64 {
        self.cached.load(Ordering::Acquire)
    }

    /// Atomically claims the next `n` numbers.
    ///
    /// Returns `low..=low + n - 1` where `low` is one past the value the
    /// winning compare-and-swap replaced.
    ///
    /// # Errors
    ///
    /// - [`Error::StoreUnavailable`] if any round-trip fails. No number is
    ///   claimed in that case.
    /// - [`Error::ConflictRetryExhausted`] if every attempt lost a race.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self)))]
    pub async fn advance(&self, n: u64) -> Result<RangeInclusive<u64>> {
        if n == 0 {
            return Err(Error::invalid_request("advance count must be positive"));
        }

        let mut attempt = 0_u32;
        let mut backoff = self.retry.backoff_initial;
        let mut snapshot = self.read().await?;

        loop {
            let (current, expected) = match &snapshot {
                Some(v) => (self.parse(v)?, Some(v.version)),
                None => (self.start, None),
            };
            let next = current
                .checked_add(n)
                .ok_or_else(|| Error::invalid_state(format!("counter would overflow past {current}")))?;

            match self
                .client
                .compare_and_swap(COUNTER_KEY, expected, next.to_string())
                .await?
            {
                CasOutcome::Swapped { .. } => {
                    self.observe(next);
                    #[cfg(feature = "tracing")]
                    tracing::debug!(low = current + 1, high = next, attempt, "advanced global counter");
                    return Ok(current + 1..=next);
                }
                CasOutcome::Conflict { current: winner } => {
                    attempt += 1;
                    if attempt > self.retry.retry_limit {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(attempts = attempt, "counter CAS retries exhausted");
                        return Err(Error::ConflictRetryExhausted {
                            key: COUNTER_KEY.to_string(),
                            attempts: attempt,
                        });
                    }
                    // Jitter keeps instances that collided from colliding again.
                    let jitter = rand::random::<u64>() % (backoff.as_micros() as u64 + 1);
                    tokio::time::sleep(backoff + Duration::from_micros(jitter)).await;
                    backoff = (backoff * 2).min(self.retry.backoff_max);
                    // The conflict carries the winning write; no extra read.
                    snapshot = winner;
                }
            }
        }
    }

    /// Unconditionally rewrites the counter to its start value.
    ///
    /// Only the administrative reset path calls this.
    pub(crate) async fn reseed(&self) -> Result<u64> {
        self.client
            .put(COUNTER_KEY, self.start.to_string())
            .await?;
        self.cached.store(self.start, Ordering::Release);
        Ok(self.start)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    async fn read(&self) -> Result<Option<Versioned>> {
        self.client.get(COUNTER_KEY).await
    }

    fn parse(&self, v: &Versioned) -> Result<u64> {
        v.value
            .trim()
            .parse()
            .map_err(|e| Error::corrupted(COUNTER_KEY, e))
    }

    fn observe(&self, value: u64) {
        self.cached.store(value, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorKind, InMemoryStore};
    use std::{collections::HashSet, sync::Arc};

    fn policy(retry_limit: u32) -> RetryPolicy {
        RetryPolicy {
            retry_limit,
            backoff_initial: Duration::from_micros(100),
            backoff_max: Duration::from_millis(2),
        }
    }

    fn counter(store: &Arc<InMemoryStore>, start: u64, retry_limit: u32) -> GlobalCounter<InMemoryStore> {
        let client = StoreClient::new(Arc::clone(store), Duration::from_secs(1));
        GlobalCounter::new(client, start, policy(retry_limit))
    }

    #[tokio::test]
    async fn advance_returns_contiguous_ranges() {
        let store = Arc::new(InMemoryStore::new());
        let counter = counter(&store, 0, 3);
        assert_eq!(counter.initialize().await.unwrap(), 0);

        assert_eq!(counter.advance(3).await.unwrap(), 1..=3);
        assert_eq!(counter.advance(1).await.unwrap(), 4..=4);
        assert_eq!(counter.current().await.unwrap(), 4);
        assert_eq!(counter.cached(), 4);
    }

    #[tokio::test]
    async fn initialize_keeps_existing_value() {
        let store = Arc::new(InMemoryStore::new());
        let first = counter(&store, 100, 3);
        first.initialize().await.unwrap();
        first.advance(5).await.unwrap();

        let second = counter(&store, 100, 3);
        assert_eq!(second.initialize().await.unwrap(), 105);
        assert_eq!(second.advance(1).await.unwrap(), 106..=106);
    }

    #[tokio::test]
    async fn advance_on_missing_key_starts_from_seed() {
        let store = Arc::new(InMemoryStore::new());
        let counter = counter(&store, 10, 3);
        assert_eq!(counter.advance(2).await.unwrap(), 11..=12);
    }

    #[tokio::test]
    async fn corrupted_counter_is_reported() {
        let store = Arc::new(InMemoryStore::new());
        store.put(COUNTER_KEY, "twelve".to_string()).await.unwrap();
        let counter = counter(&store, 0, 3);
        let err = counter.advance(1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptedData);
    }

    #[tokio::test]
    async fn unavailable_store_never_falls_back_locally() {
        let store = Arc::new(InMemoryStore::new());
        let counter = counter(&store, 0, 3);
        counter.initialize().await.unwrap();
        store.set_available(false);

        let err = counter.advance(1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
        assert_eq!(counter.cached(), 0);

        store.set_available(true);
        assert_eq!(counter.advance(1).await.unwrap(), 1..=1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_instances_never_overlap() {
        const INSTANCES: usize = 8;
        const ADVANCES: usize = 50;

        let store = Arc::new(InMemoryStore::new());
        let handles: Vec<_> = (0..INSTANCES)
            .map(|_| {
                // Unbounded retries: this test is about overlap, not budgets.
                let counter = counter(&store, 0, u32::MAX);
                tokio::spawn(async move {
                    let mut claimed = Vec::new();
                    for _ in 0..ADVANCES {
                        claimed.extend(counter.advance(2).await.unwrap());
                    }
                    claimed
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for n in handle.await.unwrap() {
                assert!(seen.insert(n), "number {n} claimed twice");
            }
        }

        let total = (INSTANCES * ADVANCES * 2) as u64;
        assert_eq!(seen.len() as u64, total);
        assert_eq!(counter(&store, 0, 0).current().await.unwrap(), total);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn contention_exhausts_a_zero_retry_budget() {
        let store = Arc::new(InMemoryStore::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let counter = counter(&store, 0, 0);
                tokio::spawn(async move {
                    let mut outcomes = Vec::new();
                    for _ in 0..20 {
                        outcomes.push(counter.advance(1).await.map_err(|e| e.kind()));
                    }
                    outcomes
                })
            })
            .collect();

        let mut granted = HashSet::new();
        for handle in handles {
            for outcome in handle.await.unwrap() {
                match outcome {
                    Ok(range) => {
                        for n in range {
                            assert!(granted.insert(n));
                        }
                    }
                    Err(kind) => assert_eq!(kind, ErrorKind::ConflictRetryExhausted),
                }
            }
        }

        // Whatever was granted is exactly the stored prefix.
        let stored = counter(&store, 0, 0).current().await.unwrap();
        assert_eq!(granted.len() as u64, stored);
    }
}
