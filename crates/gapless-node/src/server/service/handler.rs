//! [`NodeService`]: the instance-facing API of a running node.
//!
//! ## Responsibilities
//!
//! - Spawn one worker task per configured worker, all sharing a single
//!   [`Coordinator`].
//! - Dispatch allocations and releases round-robin and wait for the reply.
//! - Record request metrics.
//! - Refuse new work and drain in-flight work on shutdown.

use crate::server::{
    config::ServerConfig,
    error::{Error, Result},
    pool::{manager::WorkerPool, worker::worker_loop},
    request::WorkRequest,
    telemetry::{increment_errors, increment_releases, record_allocation},
};
use gapless::{CoordinationStore, Coordinator, SequenceRequest, SequenceResponse};
use std::{sync::Arc, time::Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Serves allocation and release requests for one coordinator instance.
pub struct NodeService<S: CoordinationStore> {
    config: ServerConfig,
    coordinator: Arc<Coordinator<S>>,
    worker_pool: Arc<WorkerPool>,
}

// Derived `Clone` would require `S: Clone`.
impl<S: CoordinationStore> Clone for NodeService<S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            coordinator: Arc::clone(&self.coordinator),
            worker_pool: Arc::clone(&self.worker_pool),
        }
    }
}

impl<S: CoordinationStore> NodeService<S> {
    /// Spawns `config.num_workers` workers around `coordinator`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ServerConfig, coordinator: Arc<Coordinator<S>>) -> Self {
        let mut workers = Vec::with_capacity(config.num_workers);
        let shutdown_token = CancellationToken::new();

        for worker_id in 0..config.num_workers {
            let (tx, rx) = mpsc::channel(config.work_queue_depth);
            workers.push(tx);
            tokio::spawn(worker_loop(worker_id, rx, Arc::clone(&coordinator)));
        }

        let worker_pool = WorkerPool::new(workers, shutdown_token, config.shutdown_timeout);

        Self {
            config,
            coordinator,
            worker_pool: Arc::new(worker_pool),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<Coordinator<S>> {
        &self.coordinator
    }

    /// Allocates `request.count` numbers.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] once shutdown has begun.
    /// - [`Error::Sequence`] with the coordinator's error otherwise.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(site_id = %request.site_id, count = request.count)))]
    pub async fn allocate(&self, request: SequenceRequest) -> Result<SequenceResponse> {
        let start = Instant::now();
        let _inflight = self.worker_pool.enter()?;

        let (tx, rx) = oneshot::channel();
        let outcome = self
            .dispatch(WorkRequest::Allocate { request, response: tx }, rx)
            .await
            .and_then(|reply| reply.map_err(Error::from));

        match &outcome {
            Ok(response) => record_allocation(
                response.numbers.len() as u64,
                response.gap_filled,
                start.elapsed().as_secs_f64() * 1000.0,
            ),
            Err(e) => increment_errors(error_label(e)),
        }
        outcome
    }

    /// Returns `number` to the gap pool.
    ///
    /// # Errors
    ///
    /// Same as [`NodeService::allocate`].
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, site_id, partition_id, reason)))]
    pub async fn release(
        &self,
        number: u64,
        site_id: &str,
        partition_id: &str,
        reason: &str,
    ) -> Result<()> {
        let _inflight = self.worker_pool.enter()?;

        let (tx, rx) = oneshot::channel();
        let work = WorkRequest::Release {
            number,
            site_id: site_id.to_string(),
            partition_id: partition_id.to_string(),
            reason: reason.to_string(),
            response: tx,
        };
        let outcome = self
            .dispatch(work, rx)
            .await
            .and_then(|reply| reply.map_err(Error::from));

        match &outcome {
            Ok(()) => increment_releases(),
            Err(e) => increment_errors(error_label(e)),
        }
        outcome
    }

    /// Stops accepting requests, drains in-flight ones and stops the workers.
    pub async fn shutdown(&self) -> Result<()> {
        self.worker_pool.shutdown().await
    }

    async fn dispatch<R>(&self, work: WorkRequest, rx: oneshot::Receiver<R>) -> Result<R> {
        self.worker_pool.send_to_next_worker(work).await?;
        rx.await.map_err(|_| Error::ChannelError {
            context: "Worker dropped the reply channel".to_string(),
        })
    }
}

fn error_label(err: &Error) -> &'static str {
    match err {
        Error::ChannelError { .. } => "CHANNEL",
        Error::ServiceShutdown => "SHUTDOWN",
        Error::Sequence(e) => e.kind().as_str(),
    }
}
