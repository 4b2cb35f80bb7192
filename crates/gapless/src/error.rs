//! Error types for the sequence coordination engine.
//!
//! Every failure surfaced by the engine is an [`Error`]. Each variant maps to a
//! stable, machine-readable [`ErrorKind`] so that collaborators (API layers,
//! admin tooling) can branch on the kind without parsing messages.
//!
//! ## Error Cases
//! - `InvalidRequest`: malformed input, rejected before touching the store.
//! - `StoreUnavailable`: the coordination store failed or timed out.
//! - `ConflictRetryExhausted`: the counter CAS loop ran out of retries, or
//!   no free audit id was found.
//! - `InvalidState`: release of an inactive number, double release.
//! - `NotFound`: forced recovery of a gap that is not in the pool.
//! - `CorruptedData`: a store value could not be decoded.
//! - `PartialAllocation`: some numbers were allocated before a hard failure.

use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the coordination engine.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The request was malformed or exceeded configured limits.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The coordination store was unreachable or did not answer in time.
    #[error("Coordination store unavailable: {context}")]
    StoreUnavailable { context: String },

    /// The compare-and-swap loop on `key` lost every race it entered.
    #[error("Compare-and-swap on `{key}` conflicted {attempts} times")]
    ConflictRetryExhausted { key: String, attempts: u32 },

    /// The operation is not valid for the current state of the number.
    #[error("Invalid state: {reason}")]
    InvalidState { reason: String },

    /// The referenced entity does not exist.
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// A value read from the store could not be decoded.
    #[error("Corrupted value at `{key}`: {reason}")]
    CorruptedData { key: String, reason: String },

    /// An allocation handed out `allocated` before failing with `source`.
    ///
    /// The allocated numbers are recorded in the audit log and remain active;
    /// only `shortfall` units were not produced.
    #[error("Allocated {} of {} numbers: {source}", allocated.len(), allocated.len() as u64 + u64::from(*shortfall))]
    PartialAllocation {
        allocated: Vec<u64>,
        shortfall: u32,
        source: Box<Error>,
    },
}

/// Stable classification of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidRequest,
    StoreUnavailable,
    ConflictRetryExhausted,
    InvalidState,
    NotFound,
    CorruptedData,
}

impl ErrorKind {
    /// Machine-readable code for this kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
            Self::ConflictRetryExhausted => "CONFLICT_RETRY_EXHAUSTED",
            Self::InvalidState => "INVALID_STATE",
            Self::NotFound => "NOT_FOUND",
            Self::CorruptedData => "CORRUPTED_DATA",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// The stable kind of this error. A partial allocation reports the kind
    /// of the failure that interrupted it.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::StoreUnavailable { .. } => ErrorKind::StoreUnavailable,
            Self::ConflictRetryExhausted { .. } => ErrorKind::ConflictRetryExhausted,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::CorruptedData { .. } => ErrorKind::CorruptedData,
            Self::PartialAllocation { source, .. } => source.kind(),
        }
    }

    /// Whether the caller may safely retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StoreUnavailable | ErrorKind::ConflictRetryExhausted
        )
    }

    /// Numbers that were handed out despite the failure.
    pub fn allocated(&self) -> &[u64] {
        match self {
            Self::PartialAllocation { allocated, .. } => allocated,
            _ => &[],
        }
    }

    pub(crate) fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupted(key: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::CorruptedData {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}
