//! The record and batch model shared by every stage of the pipeline.
//!
//! A [`Record`] is created by a source, handed to the dispatcher via
//! `submit`, and lives until a sink accepts it or it lands in the DLQ. Once
//! a record leaves the submit path it is read-only; pipeline transforms
//! mutate it before first enqueue and never afterwards.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A logical source of records: one file or one container.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Origin {
    /// A tailed file, identified by path. The inode travels with the
    /// persisted position so a recreated file is not resumed mid-stream.
    File { path: String, inode: u64 },
    /// A container stdout/stderr stream. `started_at` (unix nanos of
    /// container start) plays the same role the inode does for files.
    Container { id: String, started_at: i64 },
}

impl Origin {
    /// Stable identifier used as the key for positions and routing.
    pub fn id(&self) -> &str {
        match self {
            Origin::File { path, .. } => path,
            Origin::Container { id, .. } => id,
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Opaque per-origin position.
///
/// Byte offsets for files, timestamp plus a monotonic sequence for
/// containers; the sequence breaks timestamp ties.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cursor {
    Bytes(u64),
    Timestamp { nanos: i64, sequence: u64 },
}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cursor {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use Cursor::*;
        match (self, other) {
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (
                Timestamp { nanos: an, sequence: asq },
                Timestamp { nanos: bn, sequence: bsq },
            ) => an.cmp(bn).then(asq.cmp(bsq)),
            // Mixing cursor flavors for one origin is a caller bug, but the
            // ordering must still be total. Byte cursors sort first.
            (Bytes(_), Timestamp { .. }) => std::cmp::Ordering::Less,
            (Timestamp { .. }, Bytes(_)) => std::cmp::Ordering::Greater,
        }
    }
}

/// Record severity, coarse syslog-style levels.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Trace => "trace",
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        }
    }

    /// Lenient parse used by the `severity_remap` pipeline step.
    pub fn parse(s: &str) -> Option<Severity> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Some(Severity::Trace),
            "debug" => Some(Severity::Debug),
            "info" | "informational" => Some(Severity::Info),
            "warn" | "warning" => Some(Severity::Warn),
            "error" | "err" => Some(Severity::Error),
            "fatal" | "critical" | "crit" => Some(Severity::Fatal),
            _ => None,
        }
    }
}

/// Terminal disposition of a record, reported back to its source.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeliveryStatus {
    /// At least one sink accepted the record.
    Delivered,
    /// The record is durably parked in the dead letter queue.
    DeadLettered,
    /// Dropped by explicit policy: dedup, submit filter, or backpressure.
    Dropped,
}

/// Ack contract between the core and a source monitor.
///
/// Sources use this to learn when a record has reached a terminal
/// destination; position advancement itself is handled by the core.
pub trait SourceAck: Send + Sync {
    fn ack(&self, status: DeliveryStatus);
}

/// One timestamp adjustment performed by a pipeline step.
///
/// The record's original and ingestion timestamps are immutable;
/// adjustments are an audit trail, never a rewrite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimestampAdjustment {
    pub step: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Immutable logical unit handed to the core.
#[derive(Clone, Serialize, Deserialize)]
pub struct Record {
    /// Monotonic ingestion id, assigned by the dispatcher at submit.
    pub id: u64,
    pub origin: Origin,
    pub cursor: Cursor,
    /// UTF-8 payload, framed as a single line (no trailing newline).
    #[serde(with = "payload_serde")]
    pub payload: Bytes,
    /// Timestamp carried by the log line itself.
    pub timestamp: DateTime<Utc>,
    /// When the core first saw the record. Never rewritten once set.
    pub ingested_at: DateTime<Utc>,
    pub severity: Severity,
    labels: BTreeMap<String, String>,
    /// Label keys present at ingress; these are never overwritten.
    sealed: Arc<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timestamp_adjustments: Vec<TimestampAdjustment>,
    #[serde(skip)]
    ack: Option<Arc<dyn SourceAck>>,
}

impl Record {
    pub fn new(
        origin: Origin,
        cursor: Cursor,
        payload: impl Into<Vec<u8>>,
        timestamp: DateTime<Utc>,
        severity: Severity,
        labels: BTreeMap<String, String>,
    ) -> Record {
        let sealed = Arc::new(labels.keys().cloned().collect());
        Record {
            id: 0,
            origin,
            cursor,
            payload: Bytes::from(payload.into()),
            timestamp,
            ingested_at: Utc::now(),
            severity,
            labels,
            sealed,
            timestamp_adjustments: Vec::new(),
            ack: None,
        }
    }

    pub fn with_ack(mut self, ack: Arc<dyn SourceAck>) -> Record {
        self.ack = Some(ack);
        self
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Sets a label, refusing to overwrite keys that existed at ingress.
    ///
    /// Returns whether the write took effect.
    pub fn set_label(&mut self, key: &str, value: String) -> bool {
        if self.sealed.contains(key) {
            return false;
        }
        self.labels.insert(key.to_string(), value);
        true
    }

    /// Renames a label. Ingress keys cannot be renamed away and existing
    /// ingress keys cannot be shadowed by the new name.
    pub fn rename_label(&mut self, from: &str, to: &str) -> bool {
        if self.sealed.contains(from) || self.sealed.contains(to) {
            return false;
        }
        match self.labels.remove(from) {
            Some(value) => {
                self.labels.insert(to.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Drops a label added after ingress. Ingress keys are kept.
    pub fn drop_label(&mut self, key: &str) -> bool {
        if self.sealed.contains(key) {
            return false;
        }
        self.labels.remove(key).is_some()
    }

    /// Approximate wire-independent size used for batch byte budgeting and
    /// queue accounting.
    pub fn byte_size(&self) -> usize {
        self.payload.len()
            + self
                .labels
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
            + self.origin.id().len()
    }

    /// Reports this record's terminal disposition to its source, if the
    /// source asked for acks.
    pub fn acknowledge(&self, status: DeliveryStatus) {
        if let Some(ack) = &self.ack {
            ack.ack(status);
        }
    }
}

/// Persists the payload as a UTF-8 string rather than a byte array, so
/// DLQ and disk-buffer entries stay human-readable.
mod payload_serde {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Bytes::from(raw.into_bytes()))
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("cursor", &self.cursor)
            .field("payload_len", &self.payload.len())
            .field("severity", &self.severity)
            .field("labels", &self.labels)
            .field("has_ack", &self.ack.is_some())
            .finish()
    }
}

/// Smallest and largest cursor observed for one origin inside a batch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CursorRange {
    pub first: Cursor,
    pub last: Cursor,
}

/// Ordered set of records bound for the sinks of one routing group.
///
/// Bounded by `max_batch_records` and `max_batch_bytes`; assembly is
/// single-threaded per worker so records of one origin keep their order.
#[derive(Debug)]
pub struct Batch {
    pub id: u64,
    records: Vec<Record>,
    byte_size: usize,
    pub attempts: u32,
    cursors: BTreeMap<Origin, CursorRange>,
}

impl Batch {
    pub fn new(id: u64) -> Batch {
        Batch {
            id,
            records: Vec::new(),
            byte_size: 0,
            attempts: 0,
            cursors: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, record: Record) {
        self.byte_size += record.byte_size();
        self.cursors
            .entry(record.origin.clone())
            .and_modify(|range| {
                // Tolerates out-of-order pushes even though callers append
                // in origin order.
                if record.cursor < range.first {
                    range.first = record.cursor;
                }
                if record.cursor > range.last {
                    range.last = record.cursor;
                }
            })
            .or_insert(CursorRange {
                first: record.cursor,
                last: record.cursor,
            });
        self.records.push(record);
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Per-origin cursor ranges, used for the grouped position update after
    /// the batch reaches a terminal destination.
    pub fn cursor_ranges(&self) -> &BTreeMap<Origin, CursorRange> {
        &self.cursors
    }

    /// Acknowledges every record in the batch with the same disposition.
    pub fn acknowledge_all(&self, status: DeliveryStatus) {
        for record in &self.records {
            record.acknowledge(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(origin: Origin, cursor: Cursor) -> Record {
        Record::new(
            origin,
            cursor,
            "a line",
            Utc::now(),
            Severity::Info,
            BTreeMap::new(),
        )
    }

    #[test]
    fn ingress_labels_are_sealed() {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "payments".to_string());
        let mut rec = Record::new(
            Origin::File {
                path: "/var/log/app.log".into(),
                inode: 7,
            },
            Cursor::Bytes(0),
            "x",
            Utc::now(),
            Severity::Info,
            labels,
        );

        assert!(!rec.set_label("app", "other".into()));
        assert_eq!(rec.labels()["app"], "payments");

        assert!(rec.set_label("env", "prod".into()));
        assert!(rec.rename_label("env", "environment"));
        assert_eq!(rec.labels()["environment"], "prod");
        assert!(!rec.drop_label("app"));
        assert!(rec.drop_label("environment"));
    }

    #[test]
    fn container_cursor_ties_break_on_sequence() {
        let a = Cursor::Timestamp {
            nanos: 100,
            sequence: 1,
        };
        let b = Cursor::Timestamp {
            nanos: 100,
            sequence: 2,
        };
        let c = Cursor::Timestamp {
            nanos: 101,
            sequence: 0,
        };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn batch_tracks_per_origin_cursor_ranges() {
        let file = Origin::File {
            path: "/var/log/a.log".into(),
            inode: 1,
        };
        let container = Origin::Container {
            id: "abc123".into(),
            started_at: 0,
        };

        let mut batch = Batch::new(1);
        batch.push(record(file.clone(), Cursor::Bytes(10)));
        batch.push(record(container.clone(), Cursor::Timestamp { nanos: 5, sequence: 0 }));
        batch.push(record(file.clone(), Cursor::Bytes(42)));

        let ranges = batch.cursor_ranges();
        assert_eq!(ranges[&file].first, Cursor::Bytes(10));
        assert_eq!(ranges[&file].last, Cursor::Bytes(42));
        assert_eq!(
            ranges[&container].last,
            Cursor::Timestamp { nanos: 5, sequence: 0 }
        );
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn record_round_trips_through_json() {
        let rec = record(
            Origin::Container {
                id: "c1".into(),
                started_at: 123,
            },
            Cursor::Timestamp {
                nanos: 42,
                sequence: 7,
            },
        );
        let encoded = serde_json::to_string(&rec).unwrap();
        let decoded: Record = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.origin, rec.origin);
        assert_eq!(decoded.cursor, rec.cursor);
        assert_eq!(decoded.payload, rec.payload);
        assert_eq!(decoded.severity, rec.severity);
    }
}
