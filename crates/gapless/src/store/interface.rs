use core::future::Future;

/// A value read from the store together with its modification version.
///
/// Versions are per-key and strictly increase on every write to that key, so
/// a compare-and-swap against a version detects any intervening write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned {
    pub value: String,
    pub version: u64,
}

/// Result of a conditional write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write was applied; carries the new version.
    Swapped { version: u64 },
    /// The key changed since it was read; carries what is there now.
    Conflict { current: Option<Versioned> },
}

/// Transport-level failure reported by a store implementation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// The store refused the operation.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// A linearizable key-value store shared by every coordinator instance.
///
/// Implementations must make each operation atomic with respect to all other
/// operations from every client. Correctness of the global counter rests on
/// [`compare_and_swap`](Self::compare_and_swap); a store that cannot provide
/// it cannot back a coordinator.
pub trait CoordinationStore: Send + Sync + 'static {
    /// Reads `key`, returning `None` when it is absent.
    fn get(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<Versioned>, StoreError>> + Send;

    /// Unconditionally writes `value` under `key`, returning the new version.
    fn put(&self, key: &str, value: String)
    -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Removes `key`. Returns whether the key existed; exactly one of several
    /// concurrent deletes of the same key observes `true`.
    fn delete(&self, key: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Writes `value` only if the current version of `key` equals `expected`
    /// (`None` requires the key to be absent).
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: String,
    ) -> impl Future<Output = Result<CasOutcome, StoreError>> + Send;

    /// Lists every entry whose key starts with `prefix`, ordered by key.
    fn list(
        &self,
        prefix: &str,
    ) -> impl Future<Output = Result<Vec<(String, String)>, StoreError>> + Send;
}
