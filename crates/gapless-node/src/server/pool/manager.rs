//! Round-robin worker pool for coordinator requests.
//!
//! [`WorkerPool`] owns one bounded [`mpsc::Sender`] per worker, hands requests
//! out in round-robin order and tracks how many requests are in flight so that
//! shutdown can let them finish before stopping the workers.

use crate::server::{
    error::{Error, Result},
    request::WorkRequest,
    telemetry::{decrement_requests_inflight, increment_requests_inflight},
};
use core::time::Duration;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

pub struct WorkerPool {
    workers: Vec<mpsc::Sender<WorkRequest>>,
    next_worker: AtomicUsize,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
    draining: AtomicBool,
    inflight: AtomicUsize,
}

/// Marks one request as in flight until dropped.
pub struct InflightGuard<'a> {
    pool: &'a WorkerPool,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.pool.inflight.fetch_sub(1, Ordering::AcqRel);
        decrement_requests_inflight();
    }
}

impl WorkerPool {
    pub fn new(
        workers: Vec<mpsc::Sender<WorkRequest>>,
        shutdown_token: CancellationToken,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            workers,
            next_worker: AtomicUsize::new(0),
            shutdown_token,
            shutdown_timeout,
            draining: AtomicBool::new(false),
            inflight: AtomicUsize::new(0),
        }
    }

    /// Registers a new request.
    ///
    /// # Errors
    ///
    /// [`Error::ServiceShutdown`] once shutdown has begun.
    pub fn enter(&self) -> Result<InflightGuard<'_>> {
        if self.draining.load(Ordering::Acquire) || self.shutdown_token.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }
        self.inflight.fetch_add(1, Ordering::AcqRel);
        increment_requests_inflight();
        Ok(InflightGuard { pool: self })
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Returns the index of the next worker to receive work (round-robin).
    pub fn next_worker_index(&self) -> usize {
        self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len()
    }

    /// Sends a [`WorkRequest`] to the next worker in the pool.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] if the workers were told to stop.
    /// - [`Error::ChannelError`] if the worker's channel is closed.
    pub async fn send_to_next_worker(&self, request: WorkRequest) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }

        let worker_idx = self.next_worker_index();
        let worker = &self.workers[worker_idx];

        tokio::select! {
            sent = worker.send(request) => sent.map_err(|_| Error::ChannelError {
                context: format!("Worker {worker_idx} channel closed"),
            }),
            () = self.shutdown_token.cancelled() => Err(Error::ServiceShutdown),
        }
    }

    /// Gracefully shuts down all workers in the pool.
    ///
    /// - Refuses new requests.
    /// - Waits up to the shutdown timeout for in-flight requests to finish.
    /// - Cancels the shared [`CancellationToken`].
    /// - Sends a [`WorkRequest::Shutdown`] to each worker and waits (up to 3
    ///   seconds per worker) for the acknowledgement.
    pub async fn shutdown(&self) -> Result<()> {
        // === Phase 0: Stop accepting new requests ===
        #[cfg(feature = "tracing")]
        tracing::info!("Refusing new requests");
        self.draining.store(true, Ordering::Release);

        // === Phase 1: Wait for in-flight requests to drain ===
        #[cfg(feature = "tracing")]
        tracing::info!("Draining in-flight requests ({} active)", self.inflight());
        let drain_result = timeout(self.shutdown_timeout, async {
            while self.inflight() > 0 {
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        match drain_result {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("All in-flight requests drained successfully");
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Graceful drain timed out ({} requests still active)",
                    self.inflight()
                );
            }
        }

        // === Phase 2: Cancel any remaining work ===
        #[cfg(feature = "tracing")]
        tracing::debug!("Cancelling remaining work via shutdown token");
        self.shutdown_token.cancel();

        // === Phase 3: Notify workers to shut down ===
        let mut shutdown_handles = Vec::with_capacity(self.workers.len());
        for (i, worker) in self.workers.iter().enumerate() {
            let (tx, rx) = oneshot::channel();
            if let Err(_e) = worker.send(WorkRequest::Shutdown { response: tx }).await {
                #[cfg(feature = "tracing")]
                tracing::error!("Failed to send shutdown to worker {i}: {_e}");
            } else {
                shutdown_handles.push((i, rx));
            }
        }

        let acknowledgements = shutdown_handles.into_iter().map(|(_i, rx)| async move {
            match timeout(Duration::from_secs(3), rx).await {
                Ok(Ok(())) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("Worker {_i} shutdown acknowledged");
                }
                Ok(Err(_e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Worker {_i} returned error: {_e}");
                }
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Worker {_i} shutdown timed out");
                }
            }
        });

        futures::future::join_all(acknowledgements).await;

        #[cfg(feature = "tracing")]
        tracing::info!("Worker pool shutdown complete");

        Ok(())
    }
}
