use crate::server::request::WorkRequest;
use gapless::{Coordinator, CoordinationStore, TimeSource};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Worker task processing [`WorkRequest`]s until told to shut down.
///
/// Workers share one [`Coordinator`]; the coordinator serializes its own
/// critical sections, so several workers only overlap in validation, audit
/// bookkeeping and reply delivery.
///
/// A caller that gave up on its reply is not an error: the operation has
/// already taken effect and is in the audit trail.
pub async fn worker_loop<S, T>(
    _worker_id: usize,
    mut rx: mpsc::Receiver<WorkRequest>,
    coordinator: Arc<Coordinator<S, T>>,
) where
    S: CoordinationStore,
    T: TimeSource,
{
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {_worker_id} started");

    while let Some(work) = rx.recv().await {
        match work {
            WorkRequest::Allocate { request, response } => {
                let outcome = coordinator.allocate(request).await;
                if response.send(outcome).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Worker {_worker_id}: allocation caller went away");
                }
            }
            WorkRequest::Release {
                number,
                site_id,
                partition_id,
                reason,
                response,
            } => {
                let outcome = coordinator
                    .release(number, &site_id, &partition_id, &reason)
                    .await;
                if response.send(outcome).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Worker {_worker_id}: release caller went away");
                }
            }
            WorkRequest::Shutdown { response } => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {_worker_id} received shutdown signal");

                if response.send(()).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Worker {_worker_id} failed to acknowledge shutdown");
                }
                break;
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {_worker_id} stopped");
}
