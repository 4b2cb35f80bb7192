//! Periodic liveness and gap-pool refresh.
//!
//! Every tick writes this instance's heartbeat, reloads the gap pool so
//! releases made elsewhere become reusable here, reloads the audit index so
//! trails include other instances' records, and publishes the result on the
//! gRPC health endpoint under [`SERVICE_NAME`].

use core::time::Duration;
use gapless::{CoordinationStore, Coordinator, TimeSource};
use std::sync::Arc;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tonic_health::{ServingStatus, server::HealthReporter};

/// Name the coordinator is published under on the health endpoint.
pub const SERVICE_NAME: &str = "gapless.SequenceCoordinator";

/// Runs one heartbeat round and reports whether this instance can serve.
///
/// Failures are logged, not returned: a store outage shows up as
/// [`ServingStatus::NotServing`] until a later round succeeds.
pub async fn beat<S, T>(coordinator: &Coordinator<S, T>) -> ServingStatus
where
    S: CoordinationStore,
    T: TimeSource,
{
    if let Err(_e) = coordinator.heartbeat().await {
        #[cfg(feature = "tracing")]
        tracing::warn!("Heartbeat write failed: {_e}");
    }
    match coordinator.sync_gaps().await {
        Ok(_gaps) => {
            #[cfg(feature = "tracing")]
            tracing::trace!("Gap pool synced ({_gaps} available)");
        }
        Err(_e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!("Gap pool sync failed: {_e}");
        }
    }

    if let Err(_e) = coordinator.sync_audit().await {
        #[cfg(feature = "tracing")]
        tracing::warn!("Audit index sync failed: {_e}");
    }

    let health = coordinator.health().await;
    if health.healthy && health.cluster_healthy {
        ServingStatus::Serving
    } else {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            healthy = health.healthy,
            cluster_healthy = health.cluster_healthy,
            "Instance not serving"
        );
        ServingStatus::NotServing
    }
}

/// Beats every `period` until `shutdown` is cancelled.
pub async fn heartbeat_loop<S, T>(
    coordinator: Arc<Coordinator<S, T>>,
    reporter: HealthReporter,
    period: Duration,
    shutdown: CancellationToken,
) where
    S: CoordinationStore,
    T: TimeSource,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = None;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let status = beat(&coordinator).await;
        if last != Some(status) {
            #[cfg(feature = "tracing")]
            tracing::info!("Health status changed to {status:?}");
            reporter.set_service_status(SERVICE_NAME, status).await;
            last = Some(status);
        }
    }

    #[cfg(feature = "tracing")]
    tracing::debug!("Heartbeat loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use gapless::{CoordinatorConfig, InMemoryStore, SequenceRequest};

    #[tokio::test]
    async fn serving_while_the_store_answers() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = Coordinator::start(Arc::clone(&store), CoordinatorConfig::for_node("hb-1"))
            .await
            .unwrap();

        assert_eq!(beat(&coordinator).await, ServingStatus::Serving);

        store.set_available(false);
        assert_eq!(beat(&coordinator).await, ServingStatus::NotServing);

        store.set_available(true);
        assert_eq!(beat(&coordinator).await, ServingStatus::Serving);
    }

    #[tokio::test]
    async fn beat_picks_up_gaps_and_records_from_elsewhere() {
        let store = Arc::new(InMemoryStore::new());
        let a = Coordinator::start(Arc::clone(&store), CoordinatorConfig::for_node("a"))
            .await
            .unwrap();
        let b = Coordinator::start(Arc::clone(&store), CoordinatorConfig::for_node("b"))
            .await
            .unwrap();

        a.allocate(SequenceRequest::new("s1", "p1", "standard", 3))
            .await
            .unwrap();
        a.release(2, "s1", "p1", "voided").await.unwrap();
        assert!(b.available_gaps().is_empty());
        assert!(b.audit_trail_for(2).is_empty());

        beat(&b).await;
        assert_eq!(b.available_gaps(), vec![2]);
        assert_eq!(b.audit_trail_for(2).len(), 2);
    }

    #[tokio::test]
    async fn loop_stops_on_cancellation() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = Arc::new(
            Coordinator::start(store, CoordinatorConfig::for_node("hb-2"))
                .await
                .unwrap(),
        );
        let (reporter, _service) = tonic_health::server::health_reporter();
        let token = CancellationToken::new();

        let handle = tokio::spawn(heartbeat_loop(
            coordinator,
            reporter,
            Duration::from_millis(10),
            token.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
