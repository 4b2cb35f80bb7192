use super::{CasOutcome, CoordinationStore, StoreError, Versioned};
use core::time::Duration;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// In-memory, linearizable implementation of [`CoordinationStore`].
///
/// All operations run under a single lock, which makes every operation atomic
/// with respect to every other. Sharing one `Arc<InMemoryStore>` between
/// several coordinators simulates independent instances against one cluster.
///
/// Every operation yields to the scheduler before it touches the map, so
/// concurrent callers genuinely interleave their read-modify-write cycles.
///
/// ## Fault injection
///
/// - [`set_available`](Self::set_available) makes every call fail.
/// - [`set_latency`](Self::set_latency) delays every call.
/// - [`fail_writes_after`](Self::fail_writes_after) lets `n` more writes under
///   a key prefix succeed and fails the rest.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    faults: Mutex<Faults>,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, Versioned>,
    revision: u64,
}

impl State {
    fn write(&mut self, key: &str, value: String) -> u64 {
        self.revision += 1;
        let version = self.revision;
        self.entries
            .insert(key.to_string(), Versioned { value, version });
        version
    }
}

struct Faults {
    available: bool,
    latency: Option<Duration>,
    write_fault: Option<WriteFault>,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            available: true,
            latency: None,
            write_fault: None,
        }
    }
}

struct WriteFault {
    prefix: String,
    remaining: usize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the store reachable (`true`) or unreachable (`false`).
    pub fn set_available(&self, available: bool) {
        self.faults.lock().available = available;
    }

    /// Delays every subsequent operation by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.lock().latency = latency;
    }

    /// Allows `successes` more writes to keys under `prefix`, then fails every
    /// further write there until [`clear_faults`](Self::clear_faults).
    pub fn fail_writes_after(&self, prefix: impl Into<String>, successes: usize) {
        self.faults.lock().write_fault = Some(WriteFault {
            prefix: prefix.into(),
            remaining: successes,
        });
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Synchronous read used by tests to inspect raw state.
    pub fn peek(&self, key: &str) -> Option<Versioned> {
        self.state.lock().entries.get(key).cloned()
    }

    /// Number of keys under `prefix`.
    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .count()
    }

    async fn enter(&self) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        let latency = self.faults.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.faults.lock().available {
            Ok(())
        } else {
            Err(StoreError::Unreachable("store is partitioned".to_string()))
        }
    }

    fn admit_write(&self, key: &str) -> Result<(), StoreError> {
        let mut faults = self.faults.lock();
        if let Some(fault) = faults.write_fault.as_mut() {
            if key.starts_with(&fault.prefix) {
                if fault.remaining == 0 {
                    return Err(StoreError::Unreachable(format!(
                        "write to `{key}` dropped"
                    )));
                }
                fault.remaining -= 1;
            }
        }
        Ok(())
    }
}

impl CoordinationStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        self.enter().await?;
        Ok(self.state.lock().entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<u64, StoreError> {
        self.enter().await?;
        self.admit_write(key)?;
        Ok(self.state.lock().write(key, value))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.enter().await?;
        self.admit_write(key)?;
        let mut state = self.state.lock();
        let existed = state.entries.remove(key).is_some();
        if existed {
            state.revision += 1;
        }
        Ok(existed)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: String,
    ) -> Result<CasOutcome, StoreError> {
        self.enter().await?;
        let mut state = self.state.lock();
        let current = state.entries.get(key).cloned();
        if current.as_ref().map(|v| v.version) != expected {
            return Ok(CasOutcome::Conflict { current });
        }
        // Lock order is always state -> faults.
        self.admit_write(key)?;
        let version = state.write(key, value);
        Ok(CasOutcome::Swapped { version })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        self.enter().await?;
        Ok(self
            .state
            .lock()
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cas_requires_matching_version() {
        let store = InMemoryStore::new();

        let created = store
            .compare_and_swap("k", None, "1".to_string())
            .await
            .unwrap();
        let CasOutcome::Swapped { version } = created else {
            panic!("expected swap, got {created:?}");
        };

        let stale = store
            .compare_and_swap("k", None, "2".to_string())
            .await
            .unwrap();
        assert!(matches!(stale, CasOutcome::Conflict { current: Some(_) }));

        let swapped = store
            .compare_and_swap("k", Some(version), "2".to_string())
            .await
            .unwrap();
        assert!(matches!(swapped, CasOutcome::Swapped { .. }));
        assert_eq!(store.peek("k").unwrap().value, "2");
    }

    #[tokio::test]
    async fn only_one_delete_observes_the_key() {
        let store = InMemoryStore::new();
        store.put("gap", "x".to_string()).await.unwrap();
        assert!(store.delete("gap").await.unwrap());
        assert!(!store.delete("gap").await.unwrap());
    }

    #[tokio::test]
    async fn list_is_prefix_bounded_and_ordered() {
        let store = InMemoryStore::new();
        for key in ["/a/2", "/a/1", "/b/1", "/a0"] {
            store.put(key, key.to_string()).await.unwrap();
        }
        let keys: Vec<_> = store
            .list("/a/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["/a/1", "/a/2"]);
        assert_eq!(store.count_prefix("/a"), 3);
    }

    #[tokio::test]
    async fn write_fault_trips_after_budget() {
        let store = InMemoryStore::new();
        store.fail_writes_after("/audit/", 1);

        store.put("/audit/1", String::new()).await.unwrap();
        assert!(store.put("/audit/2", String::new()).await.is_err());
        store.put("/other", String::new()).await.unwrap();

        store.clear_faults();
        store.put("/audit/2", String::new()).await.unwrap();
    }

    #[tokio::test]
    async fn unavailable_store_rejects_reads() {
        let store = InMemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Unreachable(_))
        ));
    }
}
