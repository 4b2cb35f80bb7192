//! Request entry point for one coordinator instance.
//!
//! ## Structure
//!
//! - [`handler`] - [`NodeService`](handler::NodeService), which owns the
//!   worker pool and routes allocations and releases through it.

pub mod handler;
