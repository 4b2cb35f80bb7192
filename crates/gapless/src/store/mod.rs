//! Coordination store access.
//!
//! - [`CoordinationStore`] is the contract a linearizable backend fulfils.
//! - [`InMemoryStore`] is the embedded backend, also used to simulate many
//!   instances in tests.
//! - [`StoreClient`] bounds every call with a timeout and tracks health.
//! - [`keys`] fixes the logical key layout.

mod client;
mod interface;
pub mod keys;
mod memory;

pub use client::*;
pub use interface::*;
pub use memory::*;
