use super::{AuditEvent, AuditRecord, OperationKind};
use crate::{
    Error, Result, TimeSource,
    store::{
        CasOutcome, CoordinationStore, StoreClient,
        keys::{self, AUDIT_PREFIX},
    },
};
use parking_lot::RwLock;
use portable_atomic::{AtomicU64, Ordering};
use std::collections::HashMap;

/// Append-only audit trail.
///
/// Each record is written to the store under its own key before it is
/// indexed locally, so a record visible through [`query`](Self::query) is
/// always durable. The local index covers what this instance wrote since its
/// last [`load`](Self::load).
pub struct AuditLog<S, T> {
    client: StoreClient<S>,
    clock: T,
    node_id: String,
    instance_name: String,
    last_millis: AtomicU64,
    seq: AtomicU64,
    index: RwLock<Index>,
}

#[derive(Default)]
struct Index {
    records: Vec<AuditRecord>,
    by_number: HashMap<u64, Vec<usize>>,
}

impl Index {
    fn push(&mut self, record: AuditRecord) {
        let at = self.records.len();
        self.by_number
            .entry(record.sequence_number)
            .or_default()
            .push(at);
        self.records.push(record);
    }
}

impl<S: CoordinationStore, T: TimeSource> AuditLog<S, T> {
    pub fn new(
        client: StoreClient<S>,
        clock: T,
        node_id: impl Into<String>,
        instance_name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            clock,
            node_id: node_id.into(),
            instance_name: instance_name.into(),
            last_millis: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            index: RwLock::new(Index::default()),
        }
    }

    /// Persists `event` and returns the stored record.
    ///
    /// Entries are created only if their key is absent. An id already taken
    /// (another process with the same node id, or a restart within the same
    /// millisecond) is skipped and the next one tried, so stored records are
    /// never overwritten.
    ///
    /// # Errors
    ///
    /// - [`Error::StoreUnavailable`] if the write failed. Nothing is indexed
    ///   in that case.
    /// - [`Error::ConflictRetryExhausted`] if no free id was found.
    pub async fn record(&self, event: AuditEvent) -> Result<AuditRecord> {
        let mut record = AuditRecord {
            audit_id: String::new(),
            sequence_number: event.sequence_number,
            site_id: event.site_id,
            partition_id: event.partition_id,
            invoice_type: event.invoice_type,
            operation: event.operation,
            status: event.status,
            reason: event.reason,
            description: event.description,
            timestamp_millis: 0,
            request_id: event.request_id,
            node_id: self.node_id.clone(),
            instance_name: self.instance_name.clone(),
            gap_filled: event.gap_filled,
            global_counter: event.global_counter,
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            let (timestamp_millis, audit_id) = self.next_id();
            record.timestamp_millis = timestamp_millis;
            record.audit_id = audit_id;

            let key = keys::audit_key(&record.audit_id);
            let value = serde_json::to_string(&record).map_err(|e| Error::corrupted(&key, e))?;
            match self.client.compare_and_swap(&key, None, value).await? {
                CasOutcome::Swapped { .. } => break,
                CasOutcome::Conflict { .. } if attempts < MAX_ID_ATTEMPTS => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(key = %key, "audit id taken, trying the next one");
                }
                CasOutcome::Conflict { .. } => {
                    return Err(Error::ConflictRetryExhausted { key, attempts });
                }
            }
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(
            audit_id = %record.audit_id,
            number = record.sequence_number,
            operation = %record.operation,
            "audit recorded"
        );

        self.index.write().push(record.clone());
        Ok(record)
    }

    /// Most recent `limit` records, newest first.
    pub fn query(&self, limit: usize) -> Vec<AuditRecord> {
        self.index
            .read()
            .records
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Every record for `number`, oldest first.
    pub fn query_for(&self, number: u64) -> Vec<AuditRecord> {
        let index = self.index.read();
        index
            .by_number
            .get(&number)
            .map(|at| at.iter().map(|&i| index.records[i].clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.index.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().records.is_empty()
    }

    /// Reads the cluster-wide trail from the store, oldest first, starting
    /// at the latest reset boundary.
    pub async fn fetch(&self) -> Result<Vec<AuditRecord>> {
        let entries = self.client.list(AUDIT_PREFIX).await?;
        let mut records = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match serde_json::from_str::<AuditRecord>(&value) {
                Ok(record) => records.push(record),
                Err(e) => return Err(Error::corrupted(key, e)),
            }
        }
        records.sort_by(|a, b| {
            a.timestamp_millis
                .cmp(&b.timestamp_millis)
                .then_with(|| a.audit_id.cmp(&b.audit_id))
        });
        if let Some(boundary) = records
            .iter()
            .rposition(|r| r.operation == OperationKind::Reset)
        {
            records.drain(..boundary);
        }
        Ok(records)
    }

    /// Every stored record for `number` since the latest reset, across all
    /// instances, oldest first.
    pub async fn fetch_for(&self, number: u64) -> Result<Vec<AuditRecord>> {
        let mut records = self.fetch().await?;
        records.retain(|r| r.sequence_number == number && r.operation != OperationKind::Reset);
        Ok(records)
    }

    /// Rebuilds the local index from [`fetch`](Self::fetch).
    ///
    /// Also moves the id generator past every id this node already stored,
    /// so a restarted instance does not reuse them.
    pub async fn load(&self) -> Result<usize> {
        let records = self.fetch().await?;
        if let Some(last) = records.last() {
            self.last_millis
                .fetch_max(last.timestamp_millis, Ordering::AcqRel);
        }
        let last_millis = self.last_millis.load(Ordering::Acquire);
        let own_seq = records
            .iter()
            .filter(|r| r.node_id == self.node_id && r.timestamp_millis == last_millis)
            .filter_map(|r| id_seq(&r.audit_id))
            .max();
        if let Some(seq) = own_seq {
            self.seq.fetch_max(seq, Ordering::AcqRel);
        }
        let mut index = Index::default();
        for record in records {
            index.push(record);
        }
        let len = index.records.len();
        *self.index.write() = index;
        Ok(len)
    }

    /// Replaces the local index with a single reset boundary. Stored
    /// records are never deleted.
    pub(crate) fn restart_at(&self, boundary: AuditRecord) {
        let mut index = Index::default();
        index.push(boundary);
        *self.index.write() = index;
    }

    /// Timestamps never go backwards on one instance, so ids sort in the
    /// order this instance wrote them.
    fn next_id(&self) -> (u64, String) {
        let now = self.clock.current_millis();
        let millis = self.last_millis.fetch_max(now, Ordering::AcqRel).max(now);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        (millis, format!("{millis:013}-{seq:08}-{}", self.node_id))
    }
}

/// Gives up finding a free id after this many taken ones.
const MAX_ID_ATTEMPTS: u32 = 64;

/// The sequence part of an id built by [`AuditLog::next_id`].
fn id_seq(audit_id: &str) -> Option<u64> {
    audit_id.split('-').nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AuditStatus, ErrorKind, InMemoryStore, SequenceRequest};
    use core::time::Duration;
    use std::sync::Arc;

    /// A clock pinned to a settable instant.
    #[derive(Default)]
    struct FixedClock(AtomicU64);

    impl FixedClock {
        fn set(&self, millis: u64) {
            self.0.store(millis, Ordering::Relaxed);
        }
    }

    impl TimeSource for FixedClock {
        fn current_millis(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    fn log(store: &Arc<InMemoryStore>, clock: &Arc<FixedClock>) -> AuditLog<InMemoryStore, Arc<FixedClock>> {
        let client = StoreClient::new(Arc::clone(store), Duration::from_secs(1));
        AuditLog::new(client, Arc::clone(clock), "node-1", "Instance node-1")
    }

    fn request() -> SequenceRequest {
        SequenceRequest::new("site-1", "a", "standard", 1)
    }

    #[tokio::test]
    async fn query_is_newest_first_and_query_for_oldest_first() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::default());
        let log = log(&store, &clock);

        clock.set(1_000);
        log.record(AuditEvent::generate(1, &request(), 1)).await.unwrap();
        clock.set(2_000);
        log.record(AuditEvent::release(1, "site-1", "a", "void", 1))
            .await
            .unwrap();
        clock.set(3_000);
        log.record(AuditEvent::recover(1, &request(), 1)).await.unwrap();

        let recent: Vec<_> = log.query(2).into_iter().map(|r| r.operation).collect();
        assert_eq!(recent, vec![OperationKind::Recover, OperationKind::Release]);

        let trail: Vec<_> = log.query_for(1).into_iter().map(|r| r.status).collect();
        assert_eq!(
            trail,
            vec![AuditStatus::Active, AuditStatus::Released, AuditStatus::Recovered]
        );
        assert!(log.query_for(2).is_empty());
        assert_eq!(store.count_prefix(AUDIT_PREFIX), 3);
    }

    #[tokio::test]
    async fn ids_stay_ordered_when_the_clock_steps_back() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::default());
        let log = log(&store, &clock);

        clock.set(5_000);
        let first = log.record(AuditEvent::generate(1, &request(), 1)).await.unwrap();
        clock.set(4_000);
        let second = log.record(AuditEvent::generate(2, &request(), 2)).await.unwrap();

        assert_eq!(second.timestamp_millis, 5_000);
        assert!(first.audit_id < second.audit_id);
        assert!(second.audit_id.ends_with("-node-1"));
    }

    #[tokio::test]
    async fn failed_write_is_not_indexed() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::default());
        let log = log(&store, &clock);

        store.fail_writes_after(AUDIT_PREFIX, 0);
        let err = log
            .record(AuditEvent::generate(1, &request(), 1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn load_starts_at_the_latest_reset() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::default());
        let writer = log(&store, &clock);

        clock.set(1_000);
        writer.record(AuditEvent::generate(1, &request(), 1)).await.unwrap();
        clock.set(2_000);
        writer.record(AuditEvent::reset(1)).await.unwrap();
        clock.set(3_000);
        writer.record(AuditEvent::generate(1, &request(), 1)).await.unwrap();

        let restarted = log(&store, &clock);
        assert_eq!(restarted.load().await.unwrap(), 2);
        let operations: Vec<_> = restarted
            .query_for(1)
            .into_iter()
            .map(|r| r.operation)
            .collect();
        assert_eq!(operations, vec![OperationKind::Reset, OperationKind::Generate]);
    }

    async fn stored_numbers(store: &InMemoryStore) -> Vec<u64> {
        let mut numbers: Vec<_> = store
            .list(AUDIT_PREFIX)
            .await
            .unwrap()
            .into_iter()
            .map(|(_, value)| {
                serde_json::from_str::<AuditRecord>(&value)
                    .unwrap()
                    .sequence_number
            })
            .collect();
        numbers.sort_unstable();
        numbers
    }

    #[tokio::test]
    async fn restart_within_the_same_millisecond_keeps_earlier_records() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::default());
        clock.set(1_000);

        let first = log(&store, &clock);
        first.record(AuditEvent::generate(1, &request(), 1)).await.unwrap();
        first.record(AuditEvent::generate(2, &request(), 2)).await.unwrap();

        let restarted = log(&store, &clock);
        assert_eq!(restarted.load().await.unwrap(), 2);
        let third = restarted
            .record(AuditEvent::generate(3, &request(), 3))
            .await
            .unwrap();

        assert_eq!(third.audit_id, "0000000001000-00000003-node-1");
        assert_eq!(stored_numbers(&store).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn taken_ids_are_skipped_not_overwritten() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::default());
        clock.set(1_000);

        // Two processes running under the same node id, neither reloaded.
        let a = log(&store, &clock);
        let b = log(&store, &clock);
        a.record(AuditEvent::generate(1, &request(), 1)).await.unwrap();
        let from_b = b.record(AuditEvent::generate(2, &request(), 2)).await.unwrap();

        assert_eq!(from_b.audit_id, "0000000001000-00000002-node-1");
        assert_eq!(stored_numbers(&store).await, vec![1, 2]);
        assert_eq!(b.query_for(2), vec![from_b]);
    }

    #[tokio::test]
    async fn fetch_for_sees_other_instances_and_skips_resets() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::default());
        let client = StoreClient::new(Arc::clone(&store), Duration::from_secs(1));
        let other = AuditLog::new(client, Arc::clone(&clock), "node-2", "Instance node-2");
        let local = log(&store, &clock);

        clock.set(1_000);
        other.record(AuditEvent::reset(4)).await.unwrap();
        clock.set(2_000);
        other.record(AuditEvent::generate(4, &request(), 4)).await.unwrap();

        assert!(local.query_for(4).is_empty());
        let trail = local.fetch_for(4).await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].operation, OperationKind::Generate);
        assert_eq!(trail[0].node_id, "node-2");
    }

    #[tokio::test]
    async fn undecodable_record_is_corrupted_data() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::default());
        store
            .put(&keys::audit_key("bogus"), "{".to_string())
            .await
            .unwrap();

        let err = log(&store, &clock).load().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptedData);
    }
}
