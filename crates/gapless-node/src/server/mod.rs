//! Runtime pieces of a gapless node.
//!
//! - [`config`] - CLI/env configuration.
//! - [`error`] - runtime errors and their gRPC status mapping.
//! - [`heartbeat`] - liveness, gap-pool resync and health publishing.
//! - [`pool`] - worker tasks and round-robin dispatch.
//! - [`request`] - messages sent to workers.
//! - [`service`] - [`NodeService`](service::handler::NodeService).
//! - [`telemetry`] - logging, tracing and metrics setup.

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod pool;
pub mod request;
pub mod service;
pub mod telemetry;
