//! The dispatcher: submit path, worker pool, lifecycle, and orchestration
//! of every other subsystem.
//!
//! Construction wires the leaves (position store, DLQ, disk buffer,
//! deduplicator, sinks) into the dispatcher; none of them hold a handle
//! back. `submit` is non-blocking; workers drain shard queues into
//! batches and drive them to a terminal destination.

mod worker;

use std::{
    collections::BTreeMap,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    breaker::BreakerState,
    config::{Config, DispatcherConfig, OverflowPolicy, SinkConfig},
    dedup::{DedupOutcome, Deduplicator},
    disk_buffer::DiskBuffer,
    dlq::DeadLetterQueue,
    error::{Error, Result},
    event::{DeliveryStatus, Record},
    internal_events::RecordsDropped,
    pipeline::{Disposition, Pipeline},
    positions::{PositionStore, PositionsView},
    queue::{limited, LimitedReceiver, LimitedSender, TrySendError},
    sinks::{self, Sink},
};

use self::worker::{SinkRuntime, Worker};

/// Label that marks a record sheddable under hard backpressure.
const PRIORITY_LABEL: &str = "priority";
const PRIORITY_LOW: &str = "low";

/// Pacing of the disk-buffer recovery loop.
const RECOVERY_POLL: Duration = Duration::from_millis(200);
/// Wait between enqueue retries when shards are momentarily full.
const ENQUEUE_RETRY: Duration = Duration::from_millis(10);
/// Per-component deadline during shutdown teardown.
const COMPONENT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubmitOutcome {
    /// Queued in memory or spilled to the disk buffer.
    Accepted,
    /// Refused under the configured overflow policy.
    RejectedBackpressure,
    /// The dispatcher is not accepting records.
    RejectedShutdown,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Lifecycle {
    Created,
    Starting,
    Running,
    Draining,
    Stopped,
    Failed,
}

impl Lifecycle {
    fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Created => "created",
            Lifecycle::Starting => "starting",
            Lifecycle::Running => "running",
            Lifecycle::Draining => "draining",
            Lifecycle::Stopped => "stopped",
            Lifecycle::Failed => "failed",
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) submitted: AtomicU64,
    pub(crate) delivered: AtomicU64,
    pub(crate) deduplicated: AtomicU64,
    pub(crate) filtered: AtomicU64,
    pub(crate) dropped_backpressure: AtomicU64,
    pub(crate) unrouted: AtomicU64,
    pub(crate) dead_lettered: AtomicU64,
    pub(crate) abandoned: AtomicU64,
}

/// Counts returned by [`Dispatcher::stop`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DrainReport {
    /// Records delivered between the stop call and completion.
    pub delivered: u64,
    /// Residual queue contents written to the disk buffer at the deadline.
    pub buffered_to_disk: u64,
    /// Records that could not reach any durable destination.
    pub abandoned: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct SinkStats {
    pub sent: u64,
    pub failed: u64,
    pub circuit_state: BreakerState,
    pub rate_limit_current: f64,
    pub last_errors: Vec<String>,
}

/// Snapshot served to the admin surface.
#[derive(Clone, Debug, Serialize)]
pub struct PipelineStats {
    pub state: &'static str,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub disk_buffer_depth: u64,
    pub dlq_depth: u64,
    pub dedup_hit_ratio: f64,
    pub dedup_duplicates: u64,
    pub dedup_evictions: u64,
    pub submitted: u64,
    pub delivered: u64,
    pub deduplicated: u64,
    pub filtered: u64,
    pub dropped_backpressure: u64,
    pub unrouted: u64,
    pub dead_lettered: u64,
    pub sinks: BTreeMap<String, SinkStats>,
}

pub struct Dispatcher {
    config: Arc<DispatcherConfig>,
    lifecycle: Mutex<Lifecycle>,
    shard_senders: Vec<LimitedSender<Record>>,
    shard_receivers: Mutex<Vec<LimitedReceiver<Record>>>,
    sinks: RwLock<Vec<Arc<SinkRuntime>>>,
    dedup: RwLock<Arc<Deduplicator>>,
    pipeline: RwLock<Pipeline>,
    filters: RwLock<Vec<(String, Regex)>>,
    position_store: Arc<PositionStore>,
    positions: Arc<PositionsView>,
    dlq: Arc<DeadLetterQueue>,
    disk_buffer: Arc<DiskBuffer>,
    counters: Arc<Counters>,
    record_ids: AtomicU64,
    batch_ids: Arc<AtomicU64>,
    worker_token: CancellationToken,
    background_token: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    background_tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    /// Workers hand their shard receivers back through this channel when
    /// they exit, so `stop` can spill whatever is left unprocessed.
    residual_tx: tokio::sync::mpsc::UnboundedSender<LimitedReceiver<Record>>,
    residual_rx: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<LimitedReceiver<Record>>>>,
}

impl Dispatcher {
    /// Builds the dispatcher and every leaf subsystem from the validated
    /// configuration. Sinks declared in the config are registered here;
    /// more can be added with [`Dispatcher::add_sink`] before `start`.
    pub fn new(config: &Config) -> Result<Dispatcher> {
        config.validate()?;

        let position_store = Arc::new(PositionStore::new(&config.positions)?);
        let positions = position_store.view();
        let dlq = Arc::new(DeadLetterQueue::new(&config.dlq)?);
        let disk_buffer = Arc::new(DiskBuffer::new(&config.disk_buffer)?);
        let dedup = Arc::new(Deduplicator::new(&config.deduplication));
        let pipeline = Pipeline::new(&config.pipelines)?;
        let filters = compile_filters(&config.submit_filters)?;

        let dispatcher_config = Arc::new(config.dispatcher.clone());
        let shard_count = dispatcher_config.worker_count;
        let shard_capacity = (dispatcher_config.queue_size / shard_count).max(1);
        let mut shard_senders = Vec::with_capacity(shard_count);
        let mut shard_receivers = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            let (sender, receiver) = limited(shard_capacity);
            shard_senders.push(sender);
            shard_receivers.push(receiver);
        }

        let (residual_tx, residual_rx) = tokio::sync::mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            config: dispatcher_config,
            lifecycle: Mutex::new(Lifecycle::Created),
            shard_senders,
            shard_receivers: Mutex::new(shard_receivers),
            sinks: RwLock::new(Vec::new()),
            dedup: RwLock::new(dedup),
            pipeline: RwLock::new(pipeline),
            filters: RwLock::new(filters),
            position_store,
            positions,
            dlq,
            disk_buffer,
            counters: Arc::new(Counters::default()),
            record_ids: AtomicU64::new(1),
            batch_ids: Arc::new(AtomicU64::new(1)),
            worker_token: CancellationToken::new(),
            background_token: CancellationToken::new(),
            worker_handles: Mutex::new(Vec::new()),
            background_tasks: Mutex::new(Vec::new()),
            residual_tx,
            residual_rx: Mutex::new(Some(residual_rx)),
        };

        for (name, sink_config) in &config.sinks {
            let sink = sinks::build(name, sink_config)?;
            dispatcher.add_sink(sink, sink_config)?;
        }
        Ok(dispatcher)
    }

    /// Registers a destination. Legal only before `start`.
    pub fn add_sink(&self, sink: Arc<dyn Sink>, config: &SinkConfig) -> Result<()> {
        let lifecycle = self.lifecycle.lock();
        if *lifecycle != Lifecycle::Created {
            return Err(Error::InvalidConfig {
                reason: format!("add_sink is not legal in state '{}'", lifecycle.as_str()),
            });
        }
        self.sinks
            .write()
            .push(Arc::new(SinkRuntime::new(sink, config, &self.config)));
        Ok(())
    }

    /// Shared view of the position staging area, for source monitors that
    /// need to resume after the persisted cursor.
    pub fn positions(&self) -> Arc<PositionsView> {
        Arc::clone(&self.positions)
    }

    /// Launches workers and background tasks, recovers persisted
    /// positions, and drains the disk buffer left by a previous run.
    /// Returns once the dispatcher is accepting records, so the embedder
    /// can start source monitors strictly afterwards. Calling it twice is
    /// an error.
    pub async fn start(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != Lifecycle::Created {
                return Err(Error::InvalidConfig {
                    reason: format!("start is not legal in state '{}'", lifecycle.as_str()),
                });
            }
            *lifecycle = Lifecycle::Starting;
        }

        let loaded_from = self.position_store.load();
        info!(
            message = "Position state recovered.",
            source = ?loaded_from,
            positions = self.positions.len(),
        );

        let running: Arc<Vec<Arc<SinkRuntime>>> = Arc::new(self.sinks.read().clone());
        for runtime in running.iter() {
            if let Err(error) = runtime.sink.start().await {
                *self.lifecycle.lock() = Lifecycle::Failed;
                return Err(error);
            }
        }

        {
            let mut tasks = self.background_tasks.lock();
            tasks.push((
                "position_flush",
                tokio::spawn(
                    Arc::clone(&self.position_store).run(self.background_token.child_token()),
                ),
            ));
            tasks.push((
                "disk_buffer",
                tokio::spawn(
                    Arc::clone(&self.disk_buffer).run(self.background_token.child_token()),
                ),
            ));
            tasks.push((
                "buffer_recovery",
                tokio::spawn(recovery_loop(
                    Arc::clone(&self.disk_buffer),
                    self.shard_senders.clone(),
                    Arc::clone(&self.config),
                    self.background_token.child_token(),
                )),
            ));
        }

        let receivers: Vec<LimitedReceiver<Record>> =
            std::mem::take(&mut *self.shard_receivers.lock());
        let mut handles = self.worker_handles.lock();
        for (index, receiver) in receivers.into_iter().enumerate() {
            let worker = Worker {
                index,
                receiver,
                carry: None,
                sinks: Arc::clone(&running),
                config: Arc::clone(&self.config),
                positions: Arc::clone(&self.positions),
                dlq: Arc::clone(&self.dlq),
                disk_buffer: Arc::clone(&self.disk_buffer),
                counters: Arc::clone(&self.counters),
                shutdown: self.worker_token.child_token(),
                batch_ids: Arc::clone(&self.batch_ids),
                residual_tx: self.residual_tx.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        drop(handles);

        // Everything buffered by the previous run goes first, before any
        // source monitor can submit fresh records.
        self.disk_buffer
            .drain(|record| enqueue_wait(&self.shard_senders, &self.disk_buffer, record))
            .await?;

        *self.lifecycle.lock() = Lifecycle::Running;
        Ok(())
    }

    /// Non-blocking ingestion. Filters, pipeline transforms, and dedup run
    /// here so a record entering the queue is in its final shape.
    pub fn submit(&self, record: Record) -> SubmitOutcome {
        self.submit_inner(record, false)
    }

    /// Submit path for DLQ replay: identical to [`Dispatcher::submit`]
    /// except that deduplication is skipped — the record has been observed
    /// once already. Filters and transform chains still apply, so a
    /// reloaded configuration governs replayed records too.
    fn submit_without_dedup(&self, record: Record) -> SubmitOutcome {
        self.submit_inner(record, true)
    }

    fn submit_inner(&self, mut record: Record, skip_dedup: bool) -> SubmitOutcome {
        {
            let lifecycle = self.lifecycle.lock();
            let accepting = matches!(*lifecycle, Lifecycle::Running)
                || (matches!(*lifecycle, Lifecycle::Draining) && self.config.accept_during_drain);
            if !accepting {
                return SubmitOutcome::RejectedShutdown;
            }
        }

        record.id = self.record_ids.fetch_add(1, Ordering::Relaxed);
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        {
            let filters = self.filters.read();
            for (label, regex) in filters.iter() {
                if let Some(value) = record.labels().get(label) {
                    if regex.is_match(value) {
                        self.counters.filtered.fetch_add(1, Ordering::Relaxed);
                        RecordsDropped {
                            reason: "submit_filter",
                            count: 1,
                        }
                        .emit();
                        record.acknowledge(DeliveryStatus::Dropped);
                        return SubmitOutcome::Accepted;
                    }
                }
            }
        }

        if self.pipeline.read().process(&mut record) == Disposition::Drop {
            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
            RecordsDropped {
                reason: "pipeline_drop",
                count: 1,
            }
            .emit();
            record.acknowledge(DeliveryStatus::Dropped);
            return SubmitOutcome::Accepted;
        }

        if !skip_dedup {
            let dedup = Arc::clone(&self.dedup.read());
            if dedup.check_and_insert(&record) == DedupOutcome::Duplicate {
                self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
                RecordsDropped {
                    reason: "duplicate",
                    count: 1,
                }
                .emit();
                record.acknowledge(DeliveryStatus::Dropped);
                return SubmitOutcome::Accepted;
            }
        }

        self.enqueue(record)
    }

    /// Queue admission under the backpressure thresholds and overflow
    /// policy.
    fn enqueue(&self, record: Record) -> SubmitOutcome {
        let depth = self.queue_depth();
        let capacity = self.queue_capacity();
        let utilisation = depth as f64 / capacity as f64;

        if utilisation >= self.config.hard_threshold
            && record.labels().get(PRIORITY_LABEL).map(String::as_str) == Some(PRIORITY_LOW)
        {
            self.counters
                .dropped_backpressure
                .fetch_add(1, Ordering::Relaxed);
            RecordsDropped {
                reason: "degraded_low_priority",
                count: 1,
            }
            .emit();
            return SubmitOutcome::RejectedBackpressure;
        }

        // Write-through: once pressure crosses the soft threshold (or the
        // buffer already holds records, which would otherwise reorder an
        // origin's stream), new submissions go to disk.
        if self.config.overflow_policy == OverflowPolicy::DiskBuffer
            && (utilisation >= self.config.soft_threshold || self.disk_buffer.depth() > 0)
        {
            return self.spill(record);
        }

        let shard = &self.shard_senders[shard_for(record.origin.id(), self.shard_senders.len())];
        match shard.try_send(record) {
            Ok(()) => SubmitOutcome::Accepted,
            Err(TrySendError::Closed(_)) => SubmitOutcome::RejectedShutdown,
            Err(TrySendError::Full(record)) => match self.config.overflow_policy {
                OverflowPolicy::DiskBuffer => self.spill(record),
                OverflowPolicy::DropNew => {
                    self.counters
                        .dropped_backpressure
                        .fetch_add(1, Ordering::Relaxed);
                    RecordsDropped {
                        reason: "queue_full",
                        count: 1,
                    }
                    .emit();
                    SubmitOutcome::RejectedBackpressure
                }
                OverflowPolicy::DropOldest => {
                    match shard.force_send(record) {
                        Ok(Some(displaced)) => {
                            self.counters
                                .dropped_backpressure
                                .fetch_add(1, Ordering::Relaxed);
                            RecordsDropped {
                                reason: "queue_full_drop_oldest",
                                count: 1,
                            }
                            .emit();
                            displaced.acknowledge(DeliveryStatus::Dropped);
                            SubmitOutcome::Accepted
                        }
                        Ok(None) => SubmitOutcome::Accepted,
                        Err(_) => SubmitOutcome::RejectedShutdown,
                    }
                }
            },
        }
    }

    fn spill(&self, record: Record) -> SubmitOutcome {
        match self.disk_buffer.append(&record) {
            Ok(()) => SubmitOutcome::Accepted,
            Err(Error::QueueFull) => {
                // Queue and disk buffer are both at capacity; beyond
                // `max_total_pending` the policy is an explicit drop.
                self.counters
                    .dropped_backpressure
                    .fetch_add(1, Ordering::Relaxed);
                RecordsDropped {
                    reason: "pending_cap",
                    count: 1,
                }
                .emit();
                SubmitOutcome::RejectedBackpressure
            }
            Err(error) => {
                warn!(message = "Disk buffer append failed.", %error);
                self.counters
                    .dropped_backpressure
                    .fetch_add(1, Ordering::Relaxed);
                SubmitOutcome::RejectedBackpressure
            }
        }
    }

    /// Stops accepting records, drains up to `deadline`, spills the
    /// residue to the disk buffer, and tears down background tasks and
    /// sinks in order.
    pub async fn stop(&self, deadline: Duration) -> DrainReport {
        {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Running => *lifecycle = Lifecycle::Draining,
                _ => return DrainReport::default(),
            }
        }
        let delivered_before = self.counters.delivered.load(Ordering::Relaxed);
        info!(message = "Dispatcher draining.", deadline_secs = deadline.as_secs());

        if !self.config.accept_during_drain {
            for sender in &self.shard_senders {
                sender.close();
            }
        }

        let expected = {
            let handles = self.worker_handles.lock();
            handles.len()
        };
        let mut residual_receivers = Vec::with_capacity(expected);
        let mut abandoned = 0u64;

        let taken_rx = self.residual_rx.lock().take();
        if let Some(mut residual_rx) = taken_rx {
            // Phase one: wait out the drain deadline for a clean finish.
            let drain_deadline = tokio::time::Instant::now() + deadline;
            while residual_receivers.len() < expected {
                match tokio::time::timeout_at(drain_deadline, residual_rx.recv()).await {
                    Ok(Some(receiver)) => residual_receivers.push(receiver),
                    Ok(None) => break,
                    Err(_elapsed) => break,
                }
            }

            // Phase two: force the stragglers and give them a short grace
            // to hand their shards back.
            if residual_receivers.len() < expected {
                warn!(message = "Drain deadline exceeded; cancelling workers.");
                self.worker_token.cancel();
                for sender in &self.shard_senders {
                    sender.close();
                }
                let grace = tokio::time::Instant::now() + COMPONENT_STOP_TIMEOUT;
                while residual_receivers.len() < expected {
                    match tokio::time::timeout_at(grace, residual_rx.recv()).await {
                        Ok(Some(receiver)) => residual_receivers.push(receiver),
                        Ok(None) => break,
                        Err(_elapsed) => {
                            warn!(message = "Workers did not stop in time; abandoning them.");
                            break;
                        }
                    }
                }
            }
        }
        for handle in std::mem::take(&mut *self.worker_handles.lock()) {
            handle.abort();
        }

        // Residual queue contents become disk buffer entries.
        let mut buffered_to_disk = 0u64;
        for receiver in residual_receivers {
            while let Some(record) = receiver.try_recv() {
                match self.disk_buffer.append(&record) {
                    Ok(()) => buffered_to_disk += 1,
                    Err(error) => {
                        warn!(message = "Failed to spill residual record.", %error);
                        abandoned += 1;
                    }
                }
            }
        }

        // Background tasks: the position store flushes on cancel, the disk
        // buffer loop closes its open segment (including the spills above).
        self.background_token.cancel();
        let tasks: Vec<(&'static str, JoinHandle<()>)> =
            std::mem::take(&mut *self.background_tasks.lock());
        for (name, handle) in tasks {
            if tokio::time::timeout(COMPONENT_STOP_TIMEOUT, handle)
                .await
                .is_err()
            {
                warn!(message = "Background task did not stop in time.", task = %name);
            }
        }

        let sinks: Vec<Arc<SinkRuntime>> = self.sinks.read().clone();
        for runtime in sinks {
            if tokio::time::timeout(COMPONENT_STOP_TIMEOUT, runtime.sink.stop())
                .await
                .is_err()
            {
                warn!(
                    message = "Sink did not stop in time.",
                    sink = %runtime.sink.name(),
                );
            }
        }
        if let Err(error) = self.dlq.close() {
            warn!(message = "Failed to close dead letter queue.", %error);
        }

        *self.lifecycle.lock() = Lifecycle::Stopped;
        let delivered = self
            .counters
            .delivered
            .load(Ordering::Relaxed)
            .saturating_sub(delivered_before);
        info!(
            message = "Dispatcher stopped.",
            delivered = delivered,
            buffered_to_disk = buffered_to_disk,
            abandoned = abandoned,
        );
        DrainReport {
            delivered,
            buffered_to_disk,
            abandoned,
        }
    }

    /// Requeues up to `limit` dead-lettered records through the normal
    /// submit path, with only deduplication bypassed: they have been seen
    /// once already, but the current filters and transform chains still
    /// apply.
    pub async fn reprocess_dlq(&self, limit: usize) -> Result<usize> {
        self.dlq
            .reprocess(limit, |entry| {
                let accepted =
                    self.submit_without_dedup(entry.record) == SubmitOutcome::Accepted;
                async move { accepted }
            })
            .await
    }

    /// Applies the dynamically reloadable subset of a new configuration:
    /// submit filters, transform chains, and deduplication (with a fresh
    /// cache). Worker, sink, and persistence settings are fixed for the
    /// life of the process; differences there are logged and ignored.
    /// Nothing is applied if the new document fails validation.
    pub fn reload(&self, config: &Config) -> Result<()> {
        config.validate()?;
        let pipeline = Pipeline::new(&config.pipelines)?;
        let filters = compile_filters(&config.submit_filters)?;
        let dedup = Arc::new(Deduplicator::new(&config.deduplication));

        if config.dispatcher != *self.config {
            warn!(
                message = "Reload changes dispatcher settings; those take effect on restart only.",
            );
        }

        *self.pipeline.write() = pipeline;
        *self.filters.write() = filters;
        *self.dedup.write() = dedup;
        info!(
            message = "Configuration reloaded.",
            filters = config.submit_filters.len(),
            pipelines = config.pipelines.len(),
            dedup_enabled = config.deduplication.enabled,
        );
        Ok(())
    }

    pub fn stats(&self) -> PipelineStats {
        let sinks = self
            .sinks
            .read()
            .iter()
            .map(|runtime| {
                let snapshot = runtime.breaker.snapshot();
                (
                    runtime.sink.name().to_string(),
                    SinkStats {
                        sent: runtime.sent.load(Ordering::Relaxed),
                        failed: runtime.failed.load(Ordering::Relaxed),
                        circuit_state: snapshot.state,
                        rate_limit_current: runtime.limiter.current_rate(),
                        last_errors: runtime.recent_errors.lock().iter().cloned().collect(),
                    },
                )
            })
            .collect();

        let dedup = Arc::clone(&self.dedup.read());
        PipelineStats {
            state: self.lifecycle.lock().as_str(),
            queue_depth: self.queue_depth(),
            queue_capacity: self.queue_capacity(),
            disk_buffer_depth: self.disk_buffer.depth(),
            dlq_depth: self.dlq.depth(),
            dedup_hit_ratio: dedup.hit_ratio(),
            dedup_duplicates: dedup.duplicate_count(),
            dedup_evictions: dedup.eviction_count(),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            deduplicated: self.counters.deduplicated.load(Ordering::Relaxed),
            filtered: self.counters.filtered.load(Ordering::Relaxed),
            dropped_backpressure: self.counters.dropped_backpressure.load(Ordering::Relaxed),
            unrouted: self.counters.unrouted.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            sinks,
        }
    }

    fn queue_depth(&self) -> usize {
        self.shard_senders.iter().map(|s| s.len()).sum()
    }

    fn queue_capacity(&self) -> usize {
        self.shard_senders.iter().map(|s| s.capacity()).sum()
    }
}

fn compile_filters(filters: &[crate::config::SubmitFilter]) -> Result<Vec<(String, Regex)>> {
    let mut compiled = Vec::with_capacity(filters.len());
    for filter in filters {
        let anchored = format!("^(?:{})$", filter.pattern);
        let regex = Regex::new(&anchored).map_err(|e| Error::InvalidConfig {
            reason: format!("submit_filters: bad pattern '{}': {e}", filter.pattern),
        })?;
        compiled.push((filter.label.clone(), regex));
    }
    Ok(compiled)
}

fn shard_for(origin_id: &str, shards: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    origin_id.hash(&mut hasher);
    (hasher.finish() as usize) % shards
}

/// Enqueues a recovered record, waiting for shard capacity. If the
/// channel closes mid-wait (shutdown), the record goes back to disk.
async fn enqueue_wait(
    shards: &[LimitedSender<Record>],
    disk_buffer: &DiskBuffer,
    record: Record,
) {
    let shard = &shards[shard_for(record.origin.id(), shards.len())];
    let mut record = record;
    loop {
        match shard.try_send(record) {
            Ok(()) => return,
            Err(TrySendError::Full(returned)) => {
                record = returned;
                tokio::time::sleep(ENQUEUE_RETRY).await;
            }
            Err(TrySendError::Closed(returned)) => {
                if let Err(error) = disk_buffer.append(&returned) {
                    warn!(
                        message = "Failed to return recovered record to disk.",
                        %error,
                    );
                }
                return;
            }
        }
    }
}

/// Feeds disk-buffered records back into the queue once pressure drops
/// below the soft threshold. Keeping this the only path out of the buffer
/// preserves per-origin ordering: while the buffer is non-empty, new
/// submissions spill behind it.
async fn recovery_loop(
    disk_buffer: Arc<DiskBuffer>,
    shards: Vec<LimitedSender<Record>>,
    config: Arc<DispatcherConfig>,
    shutdown: CancellationToken,
) {
    let capacity: usize = shards.iter().map(|s| s.capacity()).sum();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(RECOVERY_POLL) => {}
        }

        let depth: usize = shards.iter().map(|s| s.len()).sum();
        let utilisation = depth as f64 / capacity as f64;
        if disk_buffer.depth() == 0 || utilisation >= config.soft_threshold {
            continue;
        }

        let result = disk_buffer
            .drain(|record| enqueue_wait(&shards, &disk_buffer, record))
            .await;
        if let Err(error) = result {
            warn!(message = "Disk buffer recovery pass failed.", %error);
        }
    }
}
