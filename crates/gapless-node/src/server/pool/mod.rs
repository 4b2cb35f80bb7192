//! Worker pool executing coordinator requests.
//!
//! - [`manager`] - round-robin dispatch, in-flight accounting and shutdown.
//! - [`worker`] - the per-worker receive loop.

pub mod manager;
pub mod worker;
