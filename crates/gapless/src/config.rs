use core::time::Duration;

/// Runtime configuration for a [`Coordinator`](crate::Coordinator) instance.
///
/// Every instance sharing a store must agree on `counter_start`; the other
/// fields are instance-local.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Unique identifier of this instance. Used in audit ids and heartbeats.
    pub node_id: String,
    /// Human-readable instance name recorded on audit records.
    pub instance_name: String,
    /// Value the global counter is seeded with. The first number handed out
    /// is `counter_start + 1`.
    pub counter_start: u64,
    /// Largest `count` a single allocation may request.
    pub max_batch: u32,
    /// Upper bound on every store round-trip.
    pub store_timeout: Duration,
    /// Retries allowed after a conflicting counter compare-and-swap.
    pub cas_retry_limit: u32,
    /// First backoff between counter CAS retries.
    pub cas_backoff_initial: Duration,
    /// Largest backoff between counter CAS retries.
    pub cas_backoff_max: Duration,
    /// A heartbeat older than this marks its node as not live.
    pub heartbeat_ttl: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            instance_name: "Default Instance".to_string(),
            counter_start: 0,
            max_batch: 1000,
            store_timeout: Duration::from_secs(2),
            cas_retry_limit: 3,
            cas_backoff_initial: Duration::from_millis(1),
            cas_backoff_max: Duration::from_millis(16),
            heartbeat_ttl: Duration::from_secs(30),
        }
    }
}

impl CoordinatorConfig {
    /// Default configuration for the given node.
    pub fn for_node(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            instance_name: format!("Instance {node_id}"),
            node_id,
            ..Self::default()
        }
    }
}
