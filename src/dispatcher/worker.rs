//! Worker loop: batch assembly and delivery.
//!
//! Each worker owns one queue shard, so the records of any single origin
//! are never split across concurrent batches for the same sink. A worker
//! finishes a batch completely (retries, deferral, DLQ routing) before it
//! pops the next one.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::FutureExt;
use parking_lot::Mutex;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::{
    breaker::{BreakerState, CircuitBreaker},
    config::{DispatcherConfig, SinkConfig},
    dlq::{DeadLetterQueue, DlqEntry},
    disk_buffer::DiskBuffer,
    event::{Batch, Cursor, DeliveryStatus, Origin, Record},
    internal_events::{BatchDeadLettered, BatchFailed, BatchSent, RecordsDropped},
    limiter::{AcquireOutcome, RateLimiter},
    positions::PositionsView,
    queue::LimitedReceiver,
    sinks::Sink,
};

use super::Counters;

/// How many recent sink errors are kept for the stats snapshot.
const RECENT_ERRORS: usize = 10;

/// A registered sink plus its delivery machinery.
pub(crate) struct SinkRuntime {
    pub(crate) sink: Arc<dyn Sink>,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) limiter: RateLimiter,
    pub(crate) max_attempts: u32,
    pub(crate) initial_backoff: Duration,
    pub(crate) max_backoff: Duration,
    pub(crate) max_batch_records: usize,
    pub(crate) max_batch_bytes: usize,
    pub(crate) sent: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) recent_errors: Mutex<std::collections::VecDeque<String>>,
}

impl SinkRuntime {
    pub(crate) fn new(
        sink: Arc<dyn Sink>,
        config: &SinkConfig,
        defaults: &DispatcherConfig,
    ) -> SinkRuntime {
        SinkRuntime {
            breaker: CircuitBreaker::new(sink.name(), &config.circuit_breaker),
            limiter: RateLimiter::new(sink.name(), &config.rate_limiter),
            max_attempts: config.retry.max_attempts.unwrap_or(defaults.max_attempts),
            initial_backoff: config
                .retry
                .initial_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| defaults.initial_backoff()),
            max_backoff: config
                .retry
                .max_backoff_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| defaults.max_backoff()),
            max_batch_records: config
                .batch
                .max_records
                .unwrap_or(defaults.max_batch_records)
                .min(defaults.max_batch_records),
            max_batch_bytes: config
                .batch
                .max_bytes
                .unwrap_or(defaults.max_batch_bytes)
                .min(defaults.max_batch_bytes),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            recent_errors: Mutex::new(std::collections::VecDeque::with_capacity(RECENT_ERRORS)),
            sink,
        }
    }

    pub(crate) fn note_error(&self, message: String) {
        let mut errors = self.recent_errors.lock();
        if errors.len() == RECENT_ERRORS {
            errors.pop_front();
        }
        errors.push_back(message);
    }
}

/// Terminal state of one (sink, batch) delivery.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SinkOutcome {
    Delivered,
    DeadLettered,
    /// DLQ refused or shutdown interrupted; the records are not terminal.
    Abandoned,
}

pub(crate) struct Worker {
    pub(crate) index: usize,
    pub(crate) receiver: LimitedReceiver<Record>,
    /// A record popped for a batch that had no byte budget left for it;
    /// it seeds the next batch instead of overflowing this one.
    pub(crate) carry: Option<Record>,
    pub(crate) sinks: Arc<Vec<Arc<SinkRuntime>>>,
    pub(crate) config: Arc<DispatcherConfig>,
    pub(crate) positions: Arc<PositionsView>,
    pub(crate) dlq: Arc<DeadLetterQueue>,
    pub(crate) disk_buffer: Arc<DiskBuffer>,
    pub(crate) counters: Arc<Counters>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) batch_ids: Arc<AtomicU64>,
    /// Hands the shard receiver back to the dispatcher on exit so residual
    /// records can be spilled to disk.
    pub(crate) residual_tx: tokio::sync::mpsc::UnboundedSender<LimitedReceiver<Record>>,
}

impl Worker {
    pub(crate) async fn run(mut self) {
        loop {
            let first = match self.carry.take() {
                Some(record) => record,
                None => tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    record = self.receiver.recv() => match record {
                        Some(record) => record,
                        None => break,
                    },
                },
            };
            let records = self.assemble(first).await;

            // A panicking sink or transform must not take the worker down;
            // log it and move to the next batch.
            let dispatch = std::panic::AssertUnwindSafe(self.dispatch(records)).catch_unwind();
            if let Err(panic) = dispatch.await {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(
                    message = "Worker recovered from panic during dispatch.",
                    worker = %self.index,
                    detail = %detail,
                );
            }
        }

        // On a clean close, deliver whatever is left in the shard; a
        // forced cancellation leaves the residue for the dispatcher to
        // spill.
        if !self.shutdown.is_cancelled() {
            while let Some(first) = self.carry.take().or_else(|| self.receiver.try_recv()) {
                let records = self.assemble(first).await;
                self.dispatch(records).await;
            }
        }

        // A cancelled worker may still hold a carried-over record; it goes
        // to disk with the rest of the residue.
        if let Some(record) = self.carry.take() {
            if let Err(error) = self.disk_buffer.append(&record) {
                warn!(message = "Failed to spill carried record.", %error);
                self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            }
        }

        let Worker {
            receiver, residual_tx, ..
        } = self;
        let _ = residual_tx.send(receiver);
    }

    /// Pops records until the batch is full by count or bytes, or the
    /// linger window since the first record closes.
    async fn assemble(&mut self, first: Record) -> Vec<Record> {
        let mut records = Vec::with_capacity(self.config.max_batch_records.min(1_024));
        let mut bytes = first.byte_size();
        records.push(first);

        let deadline = tokio::time::Instant::now() + self.config.max_batch_linger();
        while records.len() < self.config.max_batch_records {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => break,
                record = self.receiver.recv() => record,
            };
            match next {
                Some(record) => {
                    let size = record.byte_size();
                    if bytes + size > self.config.max_batch_bytes {
                        self.carry = Some(record);
                        break;
                    }
                    bytes += size;
                    records.push(record);
                }
                None => break,
            }
        }
        records
    }

    /// Routes the assembled records to every matching sink and settles
    /// terminal state: acks, counters, and grouped position advancement.
    async fn dispatch(&self, records: Vec<Record>) {
        let mut matched = vec![false; records.len()];
        let mut delivered = vec![false; records.len()];
        let mut dead = vec![false; records.len()];
        let mut abandoned = vec![false; records.len()];

        for runtime in self.sinks.iter() {
            let member_indexes: Vec<usize> = records
                .iter()
                .enumerate()
                .filter(|(_, record)| runtime.sink.matches(record))
                .map(|(i, _)| i)
                .collect();
            if member_indexes.is_empty() {
                continue;
            }
            for index in &member_indexes {
                matched[*index] = true;
            }

            // Chunk to the sink's own batch limits, preserving order.
            let mut chunk: Vec<usize> = Vec::new();
            let mut chunk_bytes = 0usize;
            let mut flushes: Vec<Vec<usize>> = Vec::new();
            for index in member_indexes {
                let size = records[index].byte_size();
                if !chunk.is_empty()
                    && (chunk.len() >= runtime.max_batch_records
                        || chunk_bytes + size > runtime.max_batch_bytes)
                {
                    flushes.push(std::mem::take(&mut chunk));
                    chunk_bytes = 0;
                }
                chunk.push(index);
                chunk_bytes += size;
            }
            if !chunk.is_empty() {
                flushes.push(chunk);
            }

            for indexes in flushes {
                let mut batch = Batch::new(self.batch_ids.fetch_add(1, Ordering::Relaxed));
                for index in &indexes {
                    batch.push(records[*index].clone());
                }
                let outcome = self.deliver(runtime, &mut batch).await;
                for index in indexes {
                    match outcome {
                        SinkOutcome::Delivered => delivered[index] = true,
                        SinkOutcome::DeadLettered => dead[index] = true,
                        SinkOutcome::Abandoned => abandoned[index] = true,
                    }
                }
            }
        }

        // Settle each record. Unrouted records are terminal by policy.
        let mut unrouted = 0u64;
        let mut delivered_count = 0u64;
        let mut dead_count = 0u64;
        let mut advance: BTreeMap<Origin, Cursor> = BTreeMap::new();
        let mut blocked: std::collections::BTreeSet<Origin> = std::collections::BTreeSet::new();

        for (index, record) in records.iter().enumerate() {
            let terminal = if !matched[index] {
                unrouted += 1;
                record.acknowledge(DeliveryStatus::Dropped);
                true
            } else if delivered[index] {
                delivered_count += 1;
                record.acknowledge(DeliveryStatus::Delivered);
                true
            } else if dead[index] && !abandoned[index] {
                dead_count += 1;
                record.acknowledge(DeliveryStatus::DeadLettered);
                true
            } else {
                // Not terminal: spill back to disk so a restart replays it.
                if let Err(error) = self.disk_buffer.append(record) {
                    warn!(
                        message = "Failed to spill unsettled record; it will be re-read from its source.",
                        origin = %record.origin,
                        %error,
                    );
                    self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                }
                false
            };

            // Positions advance strictly in cursor order per origin; a
            // non-terminal record fences everything behind it.
            if terminal {
                if !blocked.contains(&record.origin) {
                    advance.insert(record.origin.clone(), record.cursor);
                }
            } else {
                blocked.insert(record.origin.clone());
            }
        }

        for (origin, cursor) in advance {
            self.positions.advance(origin, cursor);
        }

        if unrouted > 0 {
            RecordsDropped {
                reason: "unrouted",
                count: unrouted,
            }
            .emit();
            self.counters.unrouted.fetch_add(unrouted, Ordering::Relaxed);
        }
        self.counters
            .delivered
            .fetch_add(delivered_count, Ordering::Relaxed);
        self.counters
            .dead_lettered
            .fetch_add(dead_count, Ordering::Relaxed);
    }

    /// Drives one batch to a terminal outcome against one sink.
    async fn deliver(&self, runtime: &Arc<SinkRuntime>, batch: &mut Batch) -> SinkOutcome {
        let mut attempts = 0u32;
        let mut defers = 0u32;

        loop {
            // Tokens are acquired before the breaker gate; the acquire
            // also paces deferral spins.
            let acquired = tokio::select! {
                _ = self.shutdown.cancelled() => return SinkOutcome::Abandoned,
                outcome = runtime
                    .limiter
                    .acquire(batch.len() as u64, self.config.acquire_timeout()) => outcome,
            };
            if acquired == AcquireOutcome::TimedOut {
                continue;
            }

            if !runtime.breaker.allow_request() {
                defers += 1;
                if defers > self.config.open_defer_limit {
                    return self.to_dlq(runtime, batch, attempts, "circuit_open").await;
                }
                let wait = self.backoff_delay(runtime, defers);
                tokio::select! {
                    _ = self.shutdown.cancelled() => return SinkOutcome::Abandoned,
                    _ = tokio::time::sleep(wait) => {}
                }
                continue;
            }

            attempts += 1;
            batch.attempts = attempts;
            // Biased so a completed send is never mistaken for a
            // cancellation; the in-flight request is only torn down while
            // it is still pending.
            let result = tokio::select! {
                biased;
                result = runtime.sink.send_batch(batch) => result,
                _ = self.shutdown.cancelled() => {
                    // The request may or may not have landed; at-least-once
                    // permits the replay.
                    runtime.breaker.record_failure();
                    return SinkOutcome::Abandoned;
                }
            };

            match result {
                Ok(()) => {
                    runtime.breaker.record_success();
                    runtime.limiter.note_success();
                    runtime
                        .sent
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    BatchSent {
                        sink: runtime.sink.name(),
                        records: batch.len(),
                        byte_size: batch.byte_size(),
                        attempts,
                    }
                    .emit();
                    return SinkOutcome::Delivered;
                }
                Err(error) if error.is_transient() => {
                    runtime.breaker.record_failure();
                    if runtime.breaker.state() == BreakerState::Open {
                        runtime.limiter.note_breaker_trip();
                    }
                    runtime
                        .failed
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    runtime.note_error(error.to_string());
                    BatchFailed {
                        sink: runtime.sink.name(),
                        records: batch.len(),
                        error_kind: "transient_io",
                        error: error.to_string(),
                    }
                    .emit();

                    if attempts >= runtime.max_attempts {
                        return self.to_dlq(runtime, batch, attempts, "transient_io").await;
                    }
                    let mut wait = self.backoff_delay(runtime, attempts);
                    if let Some(hint) = error.retry_after() {
                        wait = wait.max(hint);
                    }
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return SinkOutcome::Abandoned,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Err(error) => {
                    // Permanent rejection: no retries, breaker untouched.
                    runtime
                        .failed
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    runtime.note_error(error.to_string());
                    BatchFailed {
                        sink: runtime.sink.name(),
                        records: batch.len(),
                        error_kind: "permanent_rejection",
                        error: error.to_string(),
                    }
                    .emit();
                    return self
                        .to_dlq(runtime, batch, attempts, "permanent_rejection")
                        .await;
                }
            }
        }
    }

    async fn to_dlq(
        &self,
        runtime: &Arc<SinkRuntime>,
        batch: &Batch,
        attempts: u32,
        reason: &'static str,
    ) -> SinkOutcome {
        let first_failure_time = chrono::Utc::now();
        let mut refused = 0u64;
        for record in batch.records() {
            let entry = DlqEntry {
                record: record.clone(),
                first_failure_time,
                attempts,
                last_error_kind: reason.to_string(),
                target_sink: runtime.sink.name().to_string(),
            };
            if let Err(error) = self.dlq.push(&entry) {
                refused += 1;
                warn!(
                    message = "Dead letter queue refused an entry.",
                    sink = %runtime.sink.name(),
                    origin = %record.origin,
                    %error,
                );
            }
        }

        if refused > 0 {
            RecordsDropped {
                reason: "dlq_full",
                count: refused,
            }
            .emit();
            return SinkOutcome::Abandoned;
        }
        BatchDeadLettered {
            sink: runtime.sink.name(),
            records: batch.len(),
            reason,
        }
        .emit();
        SinkOutcome::DeadLettered
    }

    /// Exponential backoff with ±25% jitter, capped at `max_backoff`.
    fn backoff_delay(&self, runtime: &SinkRuntime, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = runtime
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(runtime.max_backoff);
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        base.mul_f64(jitter)
    }
}
