//! Structured telemetry events.
//!
//! Each observable moment in the pipeline is a small struct with an
//! `emit()` that writes the log line and bumps the matching metrics. The
//! embedding process installs the `metrics` recorder; nothing here
//! registers global state.

use metrics::{counter, gauge};
use tracing::{debug, error, info, warn};

pub struct BreakerStateChanged<'a> {
    pub sink: &'a str,
    pub from: &'static str,
    pub to: &'static str,
}

impl BreakerStateChanged<'_> {
    pub fn emit(self) {
        if self.to == "open" {
            warn!(
                message = "Circuit breaker state changed.",
                sink = %self.sink,
                from = %self.from,
                to = %self.to,
            );
        } else {
            info!(
                message = "Circuit breaker state changed.",
                sink = %self.sink,
                from = %self.from,
                to = %self.to,
            );
        }
        counter!(
            "breaker_transitions_total",
            "sink" => self.sink.to_string(),
            "to" => self.to,
        )
        .increment(1);
    }
}

pub struct RateLimiterAdjusted<'a> {
    pub sink: &'a str,
    pub from: f64,
    pub to: f64,
    pub reason: &'static str,
}

impl RateLimiterAdjusted<'_> {
    pub fn emit(self) {
        info!(
            message = "Rate limiter refill rate adjusted.",
            sink = %self.sink,
            from = %self.from,
            to = %self.to,
            reason = %self.reason,
        );
        gauge!("rate_limit_refill_per_second", "sink" => self.sink.to_string()).set(self.to);
    }
}

pub struct RecordsDropped<'a> {
    pub reason: &'a str,
    pub count: u64,
}

impl RecordsDropped<'_> {
    pub fn emit(self) {
        debug!(
            message = "Records dropped by policy.",
            reason = %self.reason,
            count = %self.count,
        );
        counter!("records_dropped_total", "reason" => self.reason.to_string())
            .increment(self.count);
    }
}

pub struct BatchSent<'a> {
    pub sink: &'a str,
    pub records: usize,
    pub byte_size: usize,
    pub attempts: u32,
}

impl BatchSent<'_> {
    pub fn emit(self) {
        debug!(
            message = "Batch delivered.",
            sink = %self.sink,
            records = %self.records,
            byte_size = %self.byte_size,
            attempts = %self.attempts,
        );
        counter!("sink_sent_records_total", "sink" => self.sink.to_string())
            .increment(self.records as u64);
        counter!("sink_sent_bytes_total", "sink" => self.sink.to_string())
            .increment(self.byte_size as u64);
    }
}

pub struct BatchFailed<'a> {
    pub sink: &'a str,
    pub records: usize,
    pub error_kind: &'static str,
    pub error: String,
}

impl BatchFailed<'_> {
    pub fn emit(self) {
        warn!(
            message = "Batch send failed.",
            sink = %self.sink,
            records = %self.records,
            error_kind = %self.error_kind,
            error = %self.error,
        );
        counter!(
            "sink_failed_records_total",
            "sink" => self.sink.to_string(),
            "error_kind" => self.error_kind,
        )
        .increment(self.records as u64);
    }
}

pub struct BatchDeadLettered<'a> {
    pub sink: &'a str,
    pub records: usize,
    pub reason: &'static str,
}

impl BatchDeadLettered<'_> {
    pub fn emit(self) {
        warn!(
            message = "Batch routed to dead letter queue.",
            sink = %self.sink,
            records = %self.records,
            reason = %self.reason,
        );
        counter!("dlq_written_records_total", "sink" => self.sink.to_string())
            .increment(self.records as u64);
    }
}

pub struct DlqSegmentDropped {
    pub path: std::path::PathBuf,
    pub bytes: u64,
}

impl DlqSegmentDropped {
    pub fn emit(self) {
        warn!(
            message = "Dead letter queue over capacity; oldest segment dropped.",
            path = %self.path.display(),
            bytes = %self.bytes,
        );
        counter!("dlq_dropped_segments_total").increment(1);
    }
}

pub struct DlqReprocessed {
    pub records: usize,
}

impl DlqReprocessed {
    pub fn emit(self) {
        info!(
            message = "Dead letter queue entries requeued.",
            records = %self.records,
        );
        counter!("dlq_reprocessed_records_total").increment(self.records as u64);
    }
}

pub struct DiskBufferEntryCorrupted<'a> {
    pub path: &'a std::path::Path,
    pub reason: &'a str,
}

impl DiskBufferEntryCorrupted<'_> {
    pub fn emit(self) {
        error!(
            message = "Corrupt disk buffer entry skipped.",
            path = %self.path.display(),
            reason = %self.reason,
        );
        counter!("disk_buffer_corrupted_entries_total").increment(1);
    }
}

pub struct DiskBufferRecovered {
    pub segments: usize,
    pub records: u64,
}

impl DiskBufferRecovered {
    pub fn emit(self) {
        info!(
            message = "Disk buffer drained at startup.",
            segments = %self.segments,
            records = %self.records,
        );
        counter!("disk_buffer_recovered_records_total").increment(self.records);
    }
}

pub struct PositionCorruptionDetected<'a> {
    pub path: &'a std::path::Path,
    pub reason: &'a str,
}

impl PositionCorruptionDetected<'_> {
    pub fn emit(self) {
        error!(
            message = "position_corruption_detected",
            path = %self.path.display(),
            reason = %self.reason,
        );
        counter!("position_corruption_total").increment(1);
    }
}

pub struct PositionsFlushed {
    pub positions: usize,
}

impl PositionsFlushed {
    pub fn emit(self) {
        debug!(message = "Positions flushed.", positions = %self.positions);
        counter!("position_flushes_total").increment(1);
    }
}

pub struct PipelineStepFailed<'a> {
    pub origin: &'a str,
    pub step: &'static str,
    pub error: String,
}

impl PipelineStepFailed<'_> {
    pub fn emit(self) {
        warn!(
            message = "Pipeline step failed; record passed through unchanged.",
            origin = %self.origin,
            step = %self.step,
            error = %self.error,
        );
        counter!("pipeline_step_failures_total", "step" => self.step).increment(1);
    }
}
