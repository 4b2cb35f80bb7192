//! The sequence coordinator: one instance of the allocation engine.
//!
//! Several coordinators, in one process or many, may share a store. Within
//! an instance, allocations, releases and administrative operations run one
//! at a time under a single serialization section. Across instances, only
//! the store's compare-and-swap and delete semantics keep them apart.

mod admin;

pub use admin::*;

use crate::{
    AuditEvent, AuditLog, AuditRecord, AuditStatus, CoordinatorConfig, Error, Gap, GapPool,
    GlobalCounter, HealthReport, OperationKind, Result, RetryPolicy, STRATEGY, SequenceRequest,
    SequenceResponse, SequenceStats, StatsRecorder, StoreClient, SystemClock, TimeSource,
    ValidationReport,
    store::{
        CoordinationStore,
        keys::{self, GAPS_PREFIX, HEALTH_PREFIX},
    },
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    ops::RangeInclusive,
    sync::Arc,
    time::Instant,
};
use tokio::sync::Mutex;

pub struct Coordinator<S, T = SystemClock> {
    config: CoordinatorConfig,
    client: StoreClient<S>,
    clock: Arc<T>,
    counter: GlobalCounter<S>,
    gaps: GapPool<S>,
    audit: AuditLog<S, Arc<T>>,
    stats: StatsRecorder,
    section: Mutex<()>,
    started_at_millis: u64,
}

/// What an allocation produced before it finished or failed.
struct Outcome {
    numbers: Vec<u64>,
    recovered: u64,
    counter_value: u64,
    error: Option<Error>,
}

/// Where one number stands according to its audit trail.
#[derive(Debug, PartialEq, Eq)]
enum Holding {
    Active,
    Released,
    Withdrawn,
    NeverIssued,
}

impl Holding {
    /// Counts hand-outs against returns instead of trusting record order:
    /// records from different instances may share a millisecond.
    fn of(trail: &[AuditRecord]) -> Self {
        let withdrawn = trail
            .iter()
            .any(|r| r.operation == OperationKind::Recover && r.status == AuditStatus::Invalid);
        if withdrawn {
            return Self::Withdrawn;
        }
        let issued = trail.iter().filter(|r| r.status.is_active()).count();
        let returned = trail
            .iter()
            .filter(|r| matches!(r.status, AuditStatus::Released | AuditStatus::Expired))
            .count();
        match (issued, returned) {
            (0, _) => Self::NeverIssued,
            (issued, returned) if issued > returned => Self::Active,
            _ => Self::Released,
        }
    }
}

impl<S: CoordinationStore> Coordinator<S> {
    /// Starts an instance on the system clock. See [`Self::with_clock`].
    pub async fn start(store: Arc<S>, config: CoordinatorConfig) -> Result<Self> {
        Self::with_clock(store, config, SystemClock).await
    }
}

impl<S: CoordinationStore, T: TimeSource> Coordinator<S, T> {
    /// Connects an instance to `store`.
    ///
    /// Seeds the global counter if no instance has, rebuilds the gap pool and
    /// the audit index from the store, and writes a first heartbeat.
    ///
    /// # Errors
    ///
    /// Fails if the store is unreachable or holds undecodable state.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "info", skip_all, fields(node_id = %config.node_id)))]
    pub async fn with_clock(store: Arc<S>, config: CoordinatorConfig, clock: T) -> Result<Self> {
        let client = StoreClient::new(store, config.store_timeout);
        let clock = Arc::new(clock);
        let retry = RetryPolicy {
            retry_limit: config.cas_retry_limit,
            backoff_initial: config.cas_backoff_initial,
            backoff_max: config.cas_backoff_max,
        };
        let coordinator = Self {
            counter: GlobalCounter::new(client.clone(), config.counter_start, retry),
            gaps: GapPool::new(client.clone()),
            audit: AuditLog::new(
                client.clone(),
                Arc::clone(&clock),
                config.node_id.clone(),
                config.instance_name.clone(),
            ),
            stats: StatsRecorder::new(),
            section: Mutex::new(()),
            started_at_millis: clock.current_millis(),
            client,
            clock,
            config,
        };

        let _counter = coordinator.counter.initialize().await?;
        let _gaps = coordinator.gaps.load().await?;
        let _records = coordinator.audit.load().await?;
        coordinator.heartbeat().await?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            counter = _counter,
            gaps = _gaps,
            audit_records = _records,
            "coordinator started"
        );
        Ok(coordinator)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Allocates `request.count` numbers, reusing gaps smallest-first before
    /// advancing the global counter.
    ///
    /// Every number handed out has a durable audit record before this
    /// returns. The numbers in the response are strictly increasing.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] for a malformed request. Nothing is
    ///   touched.
    /// - [`Error::PartialAllocation`] if some numbers were handed out before a
    ///   hard failure. They stay allocated.
    /// - Otherwise the store or conflict error that prevented any allocation.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(count = request.count)))]
    pub async fn allocate(&self, mut request: SequenceRequest) -> Result<SequenceResponse> {
        let started = Instant::now();
        if let Err(e) = request.validate(self.config.max_batch) {
            self.stats.record_failure(&request, 0, 0);
            return Err(e);
        }
        let request_id = request
            .ensure_request_id(self.clock.current_millis())
            .to_string();

        let outcome = {
            let _section = self.section.lock().await;
            self.allocate_locked(&request).await
        };

        let Outcome {
            mut numbers,
            recovered,
            counter_value,
            error,
        } = outcome;
        numbers.sort_unstable();
        let generated = numbers.len() as u64 - recovered;

        if let Some(error) = error {
            self.stats.record_failure(&request, generated, recovered);
            #[cfg(feature = "tracing")]
            tracing::warn!(request_id = %request_id, allocated = numbers.len(), error = %error, "allocation failed");
            if numbers.is_empty() {
                return Err(error);
            }
            let shortfall = request.count - numbers.len() as u32;
            return Err(Error::PartialAllocation {
                allocated: numbers,
                shortfall,
                source: Box::new(error),
            });
        }

        let elapsed = started.elapsed();
        self.stats.record_allocation(
            &request,
            generated,
            recovered,
            elapsed,
            self.clock.current_millis(),
        );
        #[cfg(feature = "tracing")]
        tracing::debug!(request_id = %request_id, ?numbers, recovered, "allocated");

        Ok(SequenceResponse {
            gap_filled: recovered > 0,
            numbers,
            counter_value,
            request_id,
            node_id: self.config.node_id.clone(),
            processing_time_ms: elapsed.as_millis() as u64,
        })
    }

    async fn allocate_locked(&self, request: &SequenceRequest) -> Outcome {
        let want = request.count as usize;
        let mut outcome = Outcome {
            numbers: Vec::with_capacity(want),
            recovered: 0,
            counter_value: self.counter.cached(),
            error: None,
        };

        let drain = self.gaps.take(want).await;
        let mut taken = drain.taken.into_iter();
        while let Some(gap) = taken.next() {
            let event = AuditEvent::recover(gap.number, request, outcome.counter_value);
            if let Err(e) = self.audit.record(event).await {
                self.restore_gaps(core::iter::once(gap).chain(taken)).await;
                outcome.error = Some(e);
                return outcome;
            }
            outcome.numbers.push(gap.number);
            outcome.recovered += 1;
        }
        if let Some(e) = drain.error {
            outcome.error = Some(e);
            return outcome;
        }

        let shortfall = want - outcome.numbers.len();
        if shortfall == 0 {
            return outcome;
        }
        let range = match self.counter.advance(shortfall as u64).await {
            Ok(range) => range,
            Err(e) => {
                outcome.error = Some(e);
                return outcome;
            }
        };
        let high = *range.end();
        outcome.counter_value = high;
        for number in range {
            if let Err(e) = self
                .audit
                .record(AuditEvent::generate(number, request, high))
                .await
            {
                self.return_unaudited(number..=high, request).await;
                outcome.error = Some(e);
                return outcome;
            }
            outcome.numbers.push(number);
        }
        outcome
    }

    /// Puts back gaps that were taken but never handed out.
    async fn restore_gaps(&self, gaps: impl Iterator<Item = Gap>) {
        for gap in gaps {
            if let Err(_e) = self.gaps.restore(gap).await {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %_e, "could not restore a taken gap");
            }
        }
    }

    /// Sends counter numbers that were claimed but never audited to the gap
    /// pool so they are not lost. Each gets a best-effort record saying it
    /// was never issued, so a later reuse does not start its trail cold.
    async fn return_unaudited(&self, range: RangeInclusive<u64>, request: &SequenceRequest) {
        let counter = *range.end();
        for number in range {
            let gap = Gap {
                number,
                site_id: request.site_id.clone(),
                partition_id: request.partition_id.clone(),
                reason: "allocation could not be audited".to_string(),
                released_at: self.clock.current_millis(),
                released_by: self.config.node_id.clone(),
            };
            if let Err(_e) = self.gaps.release(gap).await {
                #[cfg(feature = "tracing")]
                tracing::error!(number, error = %_e, "unaudited number left outside the pool");
                continue;
            }
            let event = AuditEvent::unissued(number, &request.site_id, &request.partition_id, counter);
            if let Err(_e) = self.audit.record(event).await {
                #[cfg(feature = "tracing")]
                tracing::warn!(number, error = %_e, "unissued number pooled without a record");
            }
        }
    }

    /// Returns `number` to the gap pool.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] for a zero number or blank identifiers.
    /// - [`Error::InvalidState`] if the number is not currently handed out:
    ///   never allocated, already in the pool, or withdrawn. The check reads
    ///   the cluster-wide audit trail from the store.
    /// - [`Error::StoreUnavailable`] if the gap or its audit record could not
    ///   be written. The release does not take effect.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self, site_id, partition_id, reason)))]
    pub async fn release(
        &self,
        number: u64,
        site_id: &str,
        partition_id: &str,
        reason: &str,
    ) -> Result<()> {
        if number == 0 {
            return Err(Error::invalid_request("sequence number must be positive"));
        }
        if site_id.trim().is_empty() || partition_id.trim().is_empty() {
            return Err(Error::invalid_request("siteId and partitionId are required"));
        }

        let _section = self.section.lock().await;
        let counter = self.counter.current().await?;
        if number <= self.counter.start() || number > counter {
            return Err(Error::invalid_state(format!(
                "sequence number {number} was never allocated"
            )));
        }
        let trail = self.audit.fetch_for(number).await?;
        match Holding::of(&trail) {
            Holding::Active => {}
            Holding::Released => {
                return Err(Error::invalid_state(format!(
                    "sequence number {number} is already released"
                )));
            }
            Holding::Withdrawn => {
                return Err(Error::invalid_state(format!(
                    "sequence number {number} was withdrawn"
                )));
            }
            Holding::NeverIssued => {
                return Err(Error::invalid_state(format!(
                    "sequence number {number} was never allocated"
                )));
            }
        }

        self.gaps
            .release(Gap {
                number,
                site_id: site_id.to_string(),
                partition_id: partition_id.to_string(),
                reason: reason.to_string(),
                released_at: self.clock.current_millis(),
                released_by: self.config.node_id.clone(),
            })
            .await?;

        let event = AuditEvent::release(number, site_id, partition_id, reason, counter);
        if let Err(e) = self.audit.record(event).await {
            // Undo so the number stays active.
            if let Err(_undo) = self.gaps.remove(number).await {
                #[cfg(feature = "tracing")]
                tracing::error!(number, error = %_undo, "unaudited gap left in the pool");
            }
            return Err(e);
        }

        self.stats.record_release();
        #[cfg(feature = "tracing")]
        tracing::info!(number, "released");
        Ok(())
    }

    /// Current statistics.
    ///
    /// The counter is read from the store. If that fails the last value this
    /// instance saw is reported and `healthy` is `false`.
    pub async fn stats(&self) -> SequenceStats {
        let (current_counter, healthy) = match self.counter.current().await {
            Ok(value) => (value, true),
            Err(_) => (self.counter.cached(), false),
        };
        let mut stats = SequenceStats {
            current_counter,
            total_requests: 0,
            failed_requests: 0,
            total_generated: 0,
            total_recovered: 0,
            total_released: 0,
            available_gaps: self.gaps.len(),
            next_available_gap: self.gaps.first(),
            average_latency_ms: 0.0,
            peak_latency_ms: 0.0,
            site_distribution: BTreeMap::new(),
            partition_distribution: BTreeMap::new(),
            invoice_type_distribution: BTreeMap::new(),
            site_partition_distribution: BTreeMap::new(),
            gap_recovery_rate: 0.0,
            healthy,
            strategy: STRATEGY.to_string(),
            node_id: self.config.node_id.clone(),
            instance_name: self.config.instance_name.clone(),
            last_allocation_millis: None,
            started_at_millis: self.started_at_millis,
        };
        self.stats.fill(&mut stats);
        stats
    }

    /// The `limit` most recent audit records in this instance's index, newest
    /// first.
    ///
    /// The index holds what this instance wrote plus everything stored as of
    /// startup or the last [`sync_audit`](Self::sync_audit). Records other
    /// instances wrote since then appear after the next sync.
    pub fn audit_trail(&self, limit: usize) -> Vec<AuditRecord> {
        self.audit.query(limit)
    }

    /// Every audit record for `number` in this instance's index, oldest
    /// first. Same scope as [`audit_trail`](Self::audit_trail).
    pub fn audit_trail_for(&self, number: u64) -> Vec<AuditRecord> {
        self.audit.query_for(number)
    }

    /// Gap numbers cached by this instance, ascending.
    pub fn available_gaps(&self) -> Vec<u64> {
        self.gaps.peek_all()
    }

    /// Full gap metadata cached by this instance, ascending.
    pub fn gap_details(&self) -> Vec<Gap> {
        self.gaps.snapshot()
    }

    /// Reloads the gap pool from the store, picking up releases made by
    /// other instances.
    pub async fn sync_gaps(&self) -> Result<usize> {
        let _section = self.section.lock().await;
        self.gaps.load().await
    }

    /// Rebuilds the local audit index from the store, picking up records
    /// written by other instances. Returns the number of indexed records.
    pub async fn sync_audit(&self) -> Result<usize> {
        let _section = self.section.lock().await;
        self.audit.load().await
    }

    /// Refreshes this instance's heartbeat key.
    pub async fn heartbeat(&self) -> Result<()> {
        let now = self.clock.current_millis();
        self.client
            .put(&keys::health_key(&self.config.node_id), now.to_string())
            .await?;
        Ok(())
    }

    /// Instance and cluster health.
    ///
    /// Never fails: an unreachable store is reported as unhealthy.
    pub async fn health(&self) -> HealthReport {
        let now = self.clock.current_millis();
        let ttl = self.config.heartbeat_ttl.as_millis() as u64;
        let (live_nodes, listed) = match self.client.list(HEALTH_PREFIX).await {
            Ok(entries) => {
                let live = entries
                    .into_iter()
                    .filter_map(|(key, value)| {
                        let node = keys::parse_health_key(&key)?;
                        let beat: u64 = value.trim().parse().ok()?;
                        (now.saturating_sub(beat) <= ttl).then(|| node.to_string())
                    })
                    .collect::<Vec<_>>();
                (live, true)
            }
            Err(_) => (Vec::new(), false),
        };
        HealthReport {
            node_id: self.config.node_id.clone(),
            healthy: self.client.health().is_healthy(),
            cluster_healthy: listed && !live_nodes.is_empty(),
            live_nodes,
            last_success_millis: self.client.health().last_success_millis(),
        }
    }

    /// Cross-checks the counter, the store's gap range and the store's audit
    /// trail since the latest reset.
    ///
    /// The three are read one after another, so allocations running on other
    /// instances meanwhile can show up as transient findings.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be read or holds undecodable records.
    pub async fn validate_integrity(&self) -> Result<ValidationReport> {
        let _section = self.section.lock().await;
        let counter = self.counter.current().await?;
        let gaps: BTreeSet<u64> = self
            .client
            .list(GAPS_PREFIX)
            .await?
            .iter()
            .filter_map(|(key, _)| keys::parse_gap_key(key))
            .collect();
        let records = self.audit.fetch().await?;
        Ok(self.inspect(counter, gaps, &records))
    }

    fn inspect(
        &self,
        counter: u64,
        gaps: BTreeSet<u64>,
        records: &[AuditRecord],
    ) -> ValidationReport {
        let invalidated_through = records
            .first()
            .filter(|r| r.operation == OperationKind::Reset)
            .map(|r| r.sequence_number);

        let mut active: HashMap<u64, bool> = HashMap::new();
        let mut duplicates = BTreeSet::new();
        for record in records {
            if record.operation == OperationKind::Reset {
                continue;
            }
            let is_active = active.entry(record.sequence_number).or_default();
            match (record.operation, record.status) {
                (OperationKind::Generate | OperationKind::Recover, status) if status.is_active() => {
                    if *is_active {
                        duplicates.insert(record.sequence_number);
                    }
                    *is_active = true;
                }
                (_, AuditStatus::Released | AuditStatus::Expired | AuditStatus::Invalid) => {
                    *is_active = false;
                }
                _ => {}
            }
        }

        let overlapping: Vec<u64> = gaps
            .iter()
            .copied()
            .filter(|n| active.get(n).copied().unwrap_or(false))
            .collect();
        let unaccounted: Vec<u64> = (self.counter.start() + 1..=counter)
            .filter(|n| !active.contains_key(n) && !gaps.contains(n))
            .collect();
        let beyond_counter = gaps.range(counter.saturating_add(1)..).count();

        let valid = duplicates.is_empty()
            && overlapping.is_empty()
            && unaccounted.is_empty()
            && beyond_counter == 0;

        let mut summary = format!("Current counter: {counter}, Available gaps: {}", gaps.len());
        if !valid {
            summary.push_str(&format!(
                ", duplicates: {}, overlapping: {}, unaccounted: {}, gaps beyond counter: {beyond_counter}",
                duplicates.len(),
                overlapping.len(),
                unaccounted.len(),
            ));
        }

        ValidationReport {
            valid,
            counter,
            gaps: gaps.into_iter().collect(),
            duplicates: duplicates.into_iter().collect(),
            overlapping,
            unaccounted,
            invalidated_through,
            summary,
        }
    }

    /// Administrative operations. Callers decide who may reach this.
    pub fn admin(&self) -> Admin<'_, S, T> {
        Admin::new(self)
    }
}
