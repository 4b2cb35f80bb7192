use super::Coordinator;
use crate::{AuditEvent, AuditRecord, Gap, Result, TimeSource, store::CoordinationStore};

/// Administrative capability over a [`Coordinator`].
///
/// Obtained through [`Coordinator::admin`]. The engine does not authorize
/// anything itself; the hosting layer decides who gets an `Admin`.
pub struct Admin<'a, S, T> {
    coordinator: &'a Coordinator<S, T>,
}

impl<'a, S: CoordinationStore, T: TimeSource> Admin<'a, S, T> {
    pub(super) fn new(coordinator: &'a Coordinator<S, T>) -> Self {
        Self { coordinator }
    }

    /// Withdraws one gap from the pool without handing it out.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`](crate::Error::NotFound) if `number` is not in the
    ///   pool.
    /// - [`Error::StoreUnavailable`](crate::Error::StoreUnavailable) if the
    ///   removal or its audit record failed. The gap stays in the pool.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "info", skip(self)))]
    pub async fn recover_gap(&self, number: u64) -> Result<Gap> {
        let c = self.coordinator;
        let _section = c.section.lock().await;
        let gap = c.gaps.remove(number).await?;

        let event = AuditEvent::withdraw(number, &gap.site_id, &gap.partition_id, c.counter.cached());
        if let Err(e) = c.audit.record(event).await {
            c.restore_gaps(core::iter::once(gap)).await;
            return Err(e);
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(number, "gap withdrawn by administrator");
        Ok(gap)
    }

    /// Invalidates every number handed out so far and starts over.
    ///
    /// The boundary record is written first; the gap pool is then emptied,
    /// the counter reseeded and local caches and statistics cleared. Returns
    /// the boundary record.
    ///
    /// Other instances keep their caches until their next gap sync, but can
    /// neither reuse a deleted gap nor advance past the reseeded counter
    /// without observing it.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "info", skip(self)))]
    pub async fn reset_system(&self) -> Result<AuditRecord> {
        let c = self.coordinator;
        let _section = c.section.lock().await;

        let previous = c.counter.current().await?;
        let boundary = c.audit.record(AuditEvent::reset(previous)).await?;
        let _cleared = c.gaps.clear().await?;
        let _start = c.counter.reseed().await?;
        c.audit.restart_at(boundary.clone());
        c.stats.reset();

        #[cfg(feature = "tracing")]
        tracing::warn!(
            invalidated_through = previous,
            gaps_cleared = _cleared,
            counter = _start,
            "sequence system reset"
        );
        Ok(boundary)
    }
}
