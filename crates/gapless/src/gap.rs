//! The pool of released, reusable numbers.
//!
//! Each gap is one store entry keyed by its number (see
//! [`keys::gap_key`]). The in-process [`BTreeMap`] is a cache of that key
//! range: it decides which number to try next, while the store decides
//! whether the claim succeeds.
//!
//! - A release creates the entry with compare-and-swap-on-absent, so a number
//!   can sit in the pool at most once cluster-wide.
//! - A take deletes the entry and only counts the gap when the delete saw the
//!   key, so two instances that cached the same gap cannot both reuse it.

use crate::{
    Error, Result,
    store::{
        CasOutcome, CoordinationStore, StoreClient,
        keys::{self, GAPS_PREFIX},
    },
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A released number waiting to be reused.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gap {
    pub number: u64,
    pub site_id: String,
    pub partition_id: String,
    pub reason: String,
    pub released_at: u64,
    pub released_by: String,
}

impl Gap {
    /// A gap known only by its number.
    fn bare(number: u64) -> Self {
        Self {
            number,
            site_id: String::new(),
            partition_id: String::new(),
            reason: String::new(),
            released_at: 0,
            released_by: String::new(),
        }
    }
}

/// Gaps taken by [`GapPool::take`], plus the failure that stopped it early.
#[derive(Debug, Default)]
pub struct Drain {
    pub taken: Vec<Gap>,
    pub error: Option<Error>,
}

pub struct GapPool<S> {
    client: StoreClient<S>,
    cache: Mutex<BTreeMap<u64, Gap>>,
}

impl<S: CoordinationStore> GapPool<S> {
    pub fn new(client: StoreClient<S>) -> Self {
        Self {
            client,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// Rebuilds the cache from the store's gap range.
    ///
    /// Entries whose value cannot be decoded are still served; only their
    /// number matters for reuse.
    pub async fn load(&self) -> Result<usize> {
        let entries = self.client.list(GAPS_PREFIX).await?;
        let mut rebuilt = BTreeMap::new();
        for (key, value) in entries {
            let Some(number) = keys::parse_gap_key(&key) else {
                #[cfg(feature = "tracing")]
                tracing::warn!(key = %key, "skipping malformed gap key");
                continue;
            };
            let gap = serde_json::from_str::<Gap>(&value).unwrap_or_else(|_e| {
                #[cfg(feature = "tracing")]
                tracing::warn!(key = %key, error = %_e, "gap metadata unreadable");
                Gap::bare(number)
            });
            rebuilt.insert(number, gap);
        }
        let len = rebuilt.len();
        *self.cache.lock() = rebuilt;
        Ok(len)
    }

    /// Adds `gap` to the pool.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if the number is already in the pool on any
    ///   instance.
    /// - [`Error::StoreUnavailable`] if the entry could not be written.
    pub async fn release(&self, gap: Gap) -> Result<()> {
        let key = keys::gap_key(gap.number);
        let value = serde_json::to_string(&gap).map_err(|e| Error::corrupted(&key, e))?;
        match self.client.compare_and_swap(&key, None, value).await? {
            CasOutcome::Swapped { .. } => {
                self.cache.lock().insert(gap.number, gap);
                Ok(())
            }
            CasOutcome::Conflict { .. } => Err(Error::invalid_state(format!(
                "sequence number {} is already released",
                gap.number
            ))),
        }
    }

    /// Claims the smallest cached gap that is still present in the store.
    ///
    /// Cached gaps that another instance already took are dropped on the way.
    /// Returns `None` once the cache is exhausted.
    pub async fn take_one(&self) -> Result<Option<Gap>> {
        loop {
            let Some((number, gap)) = self.cache.lock().pop_first() else {
                return Ok(None);
            };
            match self.client.delete(&keys::gap_key(number)).await {
                Ok(true) => return Ok(Some(gap)),
                Ok(false) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(number, "gap already taken elsewhere");
                }
                Err(e) => {
                    self.cache.lock().insert(number, gap);
                    return Err(e);
                }
            }
        }
    }

    /// Claims up to `n` of the smallest gaps.
    pub async fn take(&self, n: usize) -> Drain {
        let mut drain = Drain::default();
        while drain.taken.len() < n {
            match self.take_one().await {
                Ok(Some(gap)) => drain.taken.push(gap),
                Ok(None) => break,
                Err(e) => {
                    drain.error = Some(e);
                    break;
                }
            }
        }
        drain
    }

    /// Removes one specific gap.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the number is not in the pool.
    pub async fn remove(&self, number: u64) -> Result<Gap> {
        let cached = self.cache.lock().remove(&number);
        match self.client.delete(&keys::gap_key(number)).await {
            Ok(true) => Ok(cached.unwrap_or_else(|| Gap::bare(number))),
            Ok(false) => Err(Error::NotFound {
                what: format!("gap {number}"),
            }),
            Err(e) => {
                if let Some(gap) = cached {
                    self.cache.lock().insert(number, gap);
                }
                Err(e)
            }
        }
    }

    /// Puts a taken gap back after its reuse could not be recorded.
    pub(crate) async fn restore(&self, gap: Gap) -> Result<()> {
        let key = keys::gap_key(gap.number);
        let value = serde_json::to_string(&gap).map_err(|e| Error::corrupted(&key, e))?;
        self.client.put(&key, value).await?;
        self.cache.lock().insert(gap.number, gap);
        Ok(())
    }

    /// Deletes every gap, in the store and in the cache.
    pub(crate) async fn clear(&self) -> Result<usize> {
        let entries = self.client.list(GAPS_PREFIX).await?;
        let mut removed = 0;
        for (key, _) in entries {
            if self.client.delete(&key).await? {
                removed += 1;
            }
        }
        self.cache.lock().clear();
        Ok(removed)
    }

    /// Sorted numbers currently cached.
    pub fn peek_all(&self) -> Vec<u64> {
        self.cache.lock().keys().copied().collect()
    }

    /// Sorted copy of the cached gaps with their metadata.
    pub fn snapshot(&self) -> Vec<Gap> {
        self.cache.lock().values().cloned().collect()
    }

    pub fn first(&self) -> Option<u64> {
        self.cache.lock().first_key_value().map(|(n, _)| *n)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    pub fn contains(&self, number: u64) -> bool {
        self.cache.lock().contains_key(&number)
    }
}
