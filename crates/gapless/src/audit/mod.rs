//! The audit trail of every number transition.
//!
//! [`AuditEvent`] constructors describe the transition; [`AuditLog`] stamps
//! it with an id, a timestamp and the instance identity, persists it and
//! indexes it by number and by recency.

mod log;
mod record;

pub use log::*;
pub use record::*;
