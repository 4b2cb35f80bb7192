//! Command-line and environment configuration.
//!
//! Every flag can also be set through the environment variable named next to
//! it (a `.env` file is loaded first). [`CliArgs`] is validated into a
//! [`ServerConfig`] before anything starts.

use anyhow::{Context, ensure};
use clap::Parser;
use core::time::Duration;
use gapless::CoordinatorConfig;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Hosts one gapless sequence coordinator instance")]
pub struct CliArgs {
    /// Address the gRPC health endpoint binds to.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:50051")]
    pub server_addr: String,

    /// Unique identifier of this instance.
    #[arg(long, env = "NODE_ID", default_value = "node-1")]
    pub node_id: String,

    /// Human-readable instance name recorded on audit records. Defaults to
    /// `Instance <node id>`.
    #[arg(long, env = "INSTANCE_NAME")]
    pub instance_name: Option<String>,

    /// Value the global counter is seeded with; the first number is one more.
    #[arg(long, env = "COUNTER_START", default_value_t = 0)]
    pub counter_start: u64,

    /// Largest count a single allocation may request.
    #[arg(long, env = "MAX_BATCH", default_value_t = 1000)]
    pub max_batch: u32,

    /// Timeout for every coordination store call, in milliseconds.
    #[arg(long, env = "STORE_TIMEOUT_MS", default_value_t = 2000)]
    pub store_timeout_ms: u64,

    /// Retries after a conflicting counter compare-and-swap.
    #[arg(long, env = "CAS_RETRY_LIMIT", default_value_t = 3)]
    pub cas_retry_limit: u32,

    /// How often the heartbeat is refreshed and the gap pool resynced, in
    /// milliseconds.
    #[arg(long, env = "HEARTBEAT_INTERVAL_MS", default_value_t = 5000)]
    pub heartbeat_interval_ms: u64,

    /// Age after which a heartbeat no longer counts as live, in milliseconds.
    #[arg(long, env = "HEARTBEAT_TTL_MS", default_value_t = 30000)]
    pub heartbeat_ttl_ms: u64,

    /// Worker tasks executing requests. Defaults to the available parallelism.
    #[arg(long, env = "NUM_WORKERS")]
    pub num_workers: Option<usize>,

    /// Requests queued per worker before callers wait.
    #[arg(long, env = "WORK_QUEUE_DEPTH", default_value_t = 64)]
    pub work_queue_depth: usize,

    /// Seconds to wait for in-flight requests during shutdown.
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 3)]
    pub shutdown_timeout_secs: u64,
}

/// Validated runtime configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub server_addr: String,
    pub node_id: String,
    pub instance_name: String,
    pub counter_start: u64,
    pub max_batch: u32,
    pub store_timeout: Duration,
    pub cas_retry_limit: u32,
    pub heartbeat_interval: Duration,
    pub heartbeat_ttl: Duration,
    pub num_workers: usize,
    pub work_queue_depth: usize,
    pub shutdown_timeout: Duration,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> anyhow::Result<Self> {
        ensure!(!args.node_id.trim().is_empty(), "node id must not be empty");
        ensure!(args.max_batch > 0, "max batch must be greater than 0");
        ensure!(args.store_timeout_ms > 0, "store timeout must be greater than 0");
        ensure!(args.work_queue_depth > 0, "work queue depth must be greater than 0");
        ensure!(
            args.heartbeat_interval_ms > 0 && args.heartbeat_interval_ms < args.heartbeat_ttl_ms,
            "heartbeat interval ({}ms) must be positive and shorter than the TTL ({}ms)",
            args.heartbeat_interval_ms,
            args.heartbeat_ttl_ms
        );

        let num_workers = match args.num_workers {
            Some(n) => n,
            None => std::thread::available_parallelism()
                .context("cannot determine available parallelism; set NUM_WORKERS")?
                .get(),
        };
        ensure!(num_workers > 0, "number of workers must be greater than 0");

        Ok(Self {
            instance_name: args
                .instance_name
                .unwrap_or_else(|| format!("Instance {}", args.node_id)),
            server_addr: args.server_addr,
            node_id: args.node_id,
            counter_start: args.counter_start,
            max_batch: args.max_batch,
            store_timeout: Duration::from_millis(args.store_timeout_ms),
            cas_retry_limit: args.cas_retry_limit,
            heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
            heartbeat_ttl: Duration::from_millis(args.heartbeat_ttl_ms),
            num_workers,
            work_queue_depth: args.work_queue_depth,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
        })
    }
}

impl ServerConfig {
    /// The engine configuration for this instance.
    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            node_id: self.node_id.clone(),
            instance_name: self.instance_name.clone(),
            counter_start: self.counter_start,
            max_batch: self.max_batch,
            store_timeout: self.store_timeout,
            cas_retry_limit: self.cas_retry_limit,
            heartbeat_ttl: self.heartbeat_ttl,
            ..CoordinatorConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let args = CliArgs::try_parse_from(core::iter::once("gapless-node").chain(args.iter().copied()))?;
        ServerConfig::try_from(args)
    }

    #[test]
    fn flags_map_onto_the_coordinator() {
        let config = parse(&[
            "--node-id",
            "eu-2",
            "--counter-start",
            "5000",
            "--store-timeout-ms",
            "250",
            "--num-workers",
            "2",
        ])
        .unwrap();

        assert_eq!(config.instance_name, "Instance eu-2");
        assert_eq!(config.num_workers, 2);

        let coordinator = config.coordinator();
        assert_eq!(coordinator.node_id, "eu-2");
        assert_eq!(coordinator.counter_start, 5000);
        assert_eq!(coordinator.store_timeout, Duration::from_millis(250));
        assert_eq!(coordinator.cas_retry_limit, 3);
    }

    #[test]
    fn heartbeat_must_beat_faster_than_it_expires() {
        let err = parse(&[
            "--num-workers",
            "1",
            "--heartbeat-interval-ms",
            "30000",
            "--heartbeat-ttl-ms",
            "30000",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("shorter than the TTL"));
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(parse(&["--num-workers", "0"]).is_err());
        assert!(parse(&["--max-batch", "0", "--num-workers", "1"]).is_err());
    }
}
