//! Logical key layout inside the coordination store.
//!
//! ```text
//! /sequence/global/counter            -> decimal high-water mark
//! /sequence/gaps/<number:020>         -> JSON gap metadata
//! /sequence/audit/<audit id>          -> JSON audit record
//! /sequence/health/<node id>          -> heartbeat millis
//! ```
//!
//! Gap numbers are zero-padded so a prefix listing returns them in numeric
//! order.

pub const COUNTER_KEY: &str = "/sequence/global/counter";
pub const GAPS_PREFIX: &str = "/sequence/gaps/";
pub const AUDIT_PREFIX: &str = "/sequence/audit/";
pub const HEALTH_PREFIX: &str = "/sequence/health/";

pub fn gap_key(number: u64) -> String {
    format!("{GAPS_PREFIX}{number:020}")
}

pub fn parse_gap_key(key: &str) -> Option<u64> {
    key.strip_prefix(GAPS_PREFIX)?.parse().ok()
}

pub fn audit_key(audit_id: &str) -> String {
    format!("{AUDIT_PREFIX}{audit_id}")
}

pub fn health_key(node_id: &str) -> String {
    format!("{HEALTH_PREFIX}{node_id}")
}

pub fn parse_health_key(key: &str) -> Option<&str> {
    key.strip_prefix(HEALTH_PREFIX)
}
