//! On-disk overflow ring for records the in-memory queue cannot hold.
//!
//! Segments are `buffer_<6-digit-index>.dat`, plus `.gz` when compression
//! is enabled. A background loop syncs the open segment at
//! `sync_interval` and enforces `max_files` / `total_max_size` /
//! `retention` over closed segments. At startup every existing segment is
//! drained back into the dispatcher before source monitors begin.

mod reader;
mod writer;

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::DiskBufferConfig,
    error::{Error, Result},
    event::Record,
    internal_events::{DiskBufferRecovered, RecordsDropped},
};

use self::{reader::read_segment, writer::SegmentWriter};

const SEGMENT_PREFIX: &str = "buffer_";
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct ClosedSegment {
    path: PathBuf,
    bytes: u64,
    entries: u64,
}

struct WriterState {
    writer: Option<SegmentWriter>,
    next_index: u32,
    closed: BTreeMap<u32, ClosedSegment>,
}

/// Counters describing one full startup drain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    pub segments: usize,
    pub records: u64,
    pub corrupted: u64,
}

pub struct DiskBuffer {
    base_dir: PathBuf,
    max_file_size: u64,
    max_total_size: u64,
    max_files: usize,
    compressed: bool,
    sync_interval: Duration,
    retention: Duration,
    state: Mutex<WriterState>,
    depth: AtomicU64,
}

impl DiskBuffer {
    /// Opens the buffer directory, indexing any segments left behind by a
    /// previous run. Directory failures are `fatal_init`.
    pub fn new(config: &DiskBufferConfig) -> Result<DiskBuffer> {
        fs::create_dir_all(&config.base_dir).map_err(|source| Error::CreateDir {
            path: config.base_dir.clone(),
            source,
        })?;

        let mut closed = BTreeMap::new();
        let mut next_index = 0;
        for (index, path) in list_segments(&config.base_dir) {
            let bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            // Entry counts of inherited segments are unknown until drained.
            closed.insert(
                index,
                ClosedSegment {
                    path,
                    bytes,
                    entries: 0,
                },
            );
            next_index = next_index.max(index + 1);
        }

        Ok(DiskBuffer {
            base_dir: config.base_dir.clone(),
            max_file_size: config.max_file_size,
            max_total_size: config.max_total_size,
            max_files: config.max_files,
            compressed: config.compression_enabled,
            sync_interval: config.sync_interval(),
            retention: config.retention(),
            state: Mutex::new(WriterState {
                writer: None,
                next_index,
                closed,
            }),
            depth: AtomicU64::new(0),
        })
    }

    /// Appends one record to the current segment, rotating first if the
    /// segment is at its size cap. Refuses the write when the buffer is at
    /// `max_total_size`; the dispatcher turns that into its drop policy.
    pub fn append(&self, record: &Record) -> Result<()> {
        let payload = serde_json::to_vec(record).map_err(|e| Error::CorruptState {
            path: self.base_dir.clone(),
            reason: e.to_string(),
        })?;

        let mut state = self.state.lock();
        if self.total_bytes(&state) + payload.len() as u64 > self.max_total_size {
            return Err(Error::QueueFull);
        }

        if state
            .writer
            .as_ref()
            .map(|w| w.written() >= self.max_file_size)
            .unwrap_or(false)
        {
            self.rotate(&mut state)?;
        }
        if state.writer.is_none() {
            let path = self.segment_path(state.next_index);
            state.next_index += 1;
            state.writer = Some(
                SegmentWriter::create(&path, self.compressed).map_err(|source| Error::Io {
                    path: path.clone(),
                    source,
                })?,
            );
        }

        let writer = state.writer.as_mut().expect("writer just ensured");
        writer.append(&payload).map_err(|source| Error::Io {
            path: writer.path().to_path_buf(),
            source,
        })?;
        self.depth.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Records currently buffered on disk.
    pub fn depth(&self) -> u64 {
        self.depth.load(Ordering::SeqCst)
    }

    /// Whether an append of `bytes` more would exceed the total cap.
    pub fn is_full(&self) -> bool {
        let state = self.state.lock();
        self.total_bytes(&state) >= self.max_total_size
    }

    /// Closes the open segment, making everything written durable.
    pub fn flush_and_close(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.rotate(&mut state)
    }

    /// Reads every segment oldest-first, hands the surviving records to
    /// `handle`, and deletes each segment once consumed. Corrupt entries
    /// are skipped and counted; a truncated tail ends its segment only.
    pub async fn drain<F, Fut>(&self, mut handle: F) -> Result<DrainStats>
    where
        F: FnMut(Record) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        // Close the open segment so its tail is durable and readable.
        {
            let mut state = self.state.lock();
            self.rotate(&mut state)?;
        }

        let segments: Vec<(u32, PathBuf)> = list_segments(&self.base_dir);
        let mut stats = DrainStats::default();
        for (index, path) in segments {
            let compressed = path.extension().map(|e| e == "gz").unwrap_or(false);
            let scan_path = path.clone();
            let scan = tokio::task::spawn_blocking(move || read_segment(&scan_path, compressed))
                .await
                .map_err(|e| Error::CorruptState {
                    path: path.clone(),
                    reason: e.to_string(),
                })?
                .map_err(|source| Error::Io {
                    path: path.clone(),
                    source,
                })?;

            if scan.truncated {
                warn!(
                    message = "Disk buffer segment has a truncated tail.",
                    path = %path.display(),
                );
            }
            stats.segments += 1;
            stats.corrupted += scan.corrupted;
            stats.records += scan.records.len() as u64;
            for record in scan.records {
                handle(record).await;
            }

            fs::remove_file(&path).ok();
            self.state.lock().closed.remove(&index);
        }

        self.depth.store(0, Ordering::SeqCst);
        DiskBufferRecovered {
            segments: stats.segments,
            records: stats.records,
        }
        .emit();
        Ok(stats)
    }

    /// Background sync and cleanup loop.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut sync = tokio::time::interval(self.sync_interval);
        sync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        sync.tick().await;
        cleanup.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sync.tick() => {
                    if let Err(error) = self.sync_current() {
                        warn!(message = "Disk buffer sync failed.", %error);
                    }
                }
                _ = cleanup.tick() => self.enforce_limits(),
            }
        }

        if let Err(error) = self.flush_and_close() {
            warn!(message = "Disk buffer close failed.", %error);
        }
    }

    fn sync_current(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(writer) = state.writer.as_mut() {
            let path = writer.path().to_path_buf();
            writer.sync().map_err(|source| Error::Io { path, source })?;
        }
        Ok(())
    }

    /// Enforces `max_files`, `max_total_size`, and `retention` over closed
    /// segments, oldest first. The open segment is never deleted.
    fn enforce_limits(&self) {
        let mut state = self.state.lock();
        let now = SystemTime::now();

        let expired: Vec<u32> = state
            .closed
            .iter()
            .filter(|(_, segment)| {
                fs::metadata(&segment.path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|mtime| now.duration_since(mtime).ok())
                    .map(|age| age > self.retention)
                    .unwrap_or(false)
            })
            .map(|(index, _)| *index)
            .collect();
        for index in expired {
            self.drop_segment(&mut state, index, "disk_buffer_retention");
        }

        while state.closed.len() + usize::from(state.writer.is_some()) > self.max_files
            || self.total_bytes(&state) > self.max_total_size
        {
            let Some(oldest) = state.closed.keys().next().copied() else {
                break;
            };
            self.drop_segment(&mut state, oldest, "disk_buffer_capacity");
        }
    }

    fn drop_segment(&self, state: &mut WriterState, index: u32, reason: &'static str) {
        if let Some(segment) = state.closed.remove(&index) {
            info!(
                message = "Dropping disk buffer segment.",
                path = %segment.path.display(),
                entries = %segment.entries,
                reason = %reason,
            );
            fs::remove_file(&segment.path).ok();
            if segment.entries > 0 {
                RecordsDropped {
                    reason,
                    count: segment.entries,
                }
                .emit();
                self.depth.fetch_sub(
                    segment.entries.min(self.depth.load(Ordering::SeqCst)),
                    Ordering::SeqCst,
                );
            }
        }
    }

    fn rotate(&self, state: &mut WriterState) -> Result<()> {
        if let Some(writer) = state.writer.take() {
            let path = writer.path().to_path_buf();
            let bytes = writer.written();
            let entries = writer.entries();
            let index = parse_index(&path).unwrap_or(state.next_index.saturating_sub(1));
            writer.finish().map_err(|source| Error::Io {
                path: path.clone(),
                source,
            })?;
            state.closed.insert(
                index,
                ClosedSegment {
                    path,
                    bytes,
                    entries,
                },
            );
        }
        Ok(())
    }

    fn total_bytes(&self, state: &WriterState) -> u64 {
        state.closed.values().map(|s| s.bytes).sum::<u64>()
            + state.writer.as_ref().map(|w| w.written()).unwrap_or(0)
    }

    fn segment_path(&self, index: u32) -> PathBuf {
        let suffix = if self.compressed { ".dat.gz" } else { ".dat" };
        self.base_dir
            .join(format!("{SEGMENT_PREFIX}{index:06}{suffix}"))
    }
}

fn parse_index(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_string_lossy();
    name.strip_prefix(SEGMENT_PREFIX)?
        .split('.')
        .next()?
        .parse()
        .ok()
}

fn list_segments(dir: &Path) -> Vec<(u32, PathBuf)> {
    let pattern = dir
        .join(format!("{SEGMENT_PREFIX}*.dat*"))
        .to_string_lossy()
        .into_owned();
    let mut segments: Vec<(u32, PathBuf)> = glob::glob(&pattern)
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|path| parse_index(&path).map(|index| (index, path)))
        .collect();
    segments.sort_by_key(|(index, _)| *index);
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Cursor, Origin, Severity};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn config(dir: &Path) -> DiskBufferConfig {
        DiskBufferConfig {
            base_dir: dir.to_path_buf(),
            max_file_size: 100 * 1024 * 1024,
            max_total_size: 1024 * 1024 * 1024,
            max_files: 50,
            compression_enabled: false,
            sync_interval_secs: 5,
            retention_secs: 24 * 60 * 60,
        }
    }

    fn record(n: u64) -> Record {
        Record::new(
            Origin::File {
                path: "/var/log/app.log".to_string(),
                inode: 3,
            },
            Cursor::Bytes(n),
            format!("line {n}"),
            Utc::now(),
            Severity::Info,
            BTreeMap::new(),
        )
    }

    async fn drain_all(buffer: &DiskBuffer) -> (DrainStats, Vec<Record>) {
        let collected = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        let stats = buffer
            .drain(move |record| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(record);
                }
            })
            .await
            .unwrap();
        let records = Arc::try_unwrap(collected).unwrap().into_inner().unwrap();
        (stats, records)
    }

    #[tokio::test]
    async fn writes_survive_reopen_and_drain_in_order() {
        let dir = tempdir().unwrap();
        {
            let buffer = DiskBuffer::new(&config(dir.path())).unwrap();
            for n in 0..25 {
                buffer.append(&record(n)).unwrap();
            }
            assert_eq!(buffer.depth(), 25);
            buffer.flush_and_close().unwrap();
        }

        let buffer = DiskBuffer::new(&config(dir.path())).unwrap();
        let (stats, records) = drain_all(&buffer).await;
        assert_eq!(stats.records, 25);
        assert_eq!(stats.corrupted, 0);
        assert_eq!(records.len(), 25);
        let cursors: Vec<_> = records.iter().map(|r| r.cursor).collect();
        assert_eq!(cursors[0], Cursor::Bytes(0));
        assert_eq!(cursors[24], Cursor::Bytes(24));
        assert_eq!(buffer.depth(), 0);
        // Consumed segments are gone.
        assert!(list_segments(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn gzip_segments_round_trip() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.compression_enabled = true;
        {
            let buffer = DiskBuffer::new(&cfg).unwrap();
            for n in 0..10 {
                buffer.append(&record(n)).unwrap();
            }
            buffer.flush_and_close().unwrap();
        }
        let buffer = DiskBuffer::new(&cfg).unwrap();
        let (stats, records) = drain_all(&buffer).await;
        assert_eq!(stats.records, 10);
        assert_eq!(records.len(), 10);
    }

    #[tokio::test]
    async fn segments_rotate_at_the_size_cap() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_file_size = 256;
        let buffer = DiskBuffer::new(&cfg).unwrap();
        for n in 0..20 {
            buffer.append(&record(n)).unwrap();
        }
        buffer.flush_and_close().unwrap();
        assert!(list_segments(dir.path()).len() > 1);

        let (stats, _) = drain_all(&buffer).await;
        assert_eq!(stats.records, 20);
    }

    #[tokio::test]
    async fn corrupt_entry_is_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        {
            let buffer = DiskBuffer::new(&config(dir.path())).unwrap();
            for n in 0..3 {
                buffer.append(&record(n)).unwrap();
            }
            buffer.flush_and_close().unwrap();
        }
        // Flip a payload byte in the middle of the file.
        let (_, path) = &list_segments(dir.path())[0];
        let mut raw = fs::read(path).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0xff;
        fs::write(path, raw).unwrap();

        let buffer = DiskBuffer::new(&config(dir.path())).unwrap();
        let (stats, records) = drain_all(&buffer).await;
        assert_eq!(stats.corrupted, 1);
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn truncated_tail_keeps_earlier_entries() {
        let dir = tempdir().unwrap();
        {
            let buffer = DiskBuffer::new(&config(dir.path())).unwrap();
            for n in 0..3 {
                buffer.append(&record(n)).unwrap();
            }
            buffer.flush_and_close().unwrap();
        }
        let (_, path) = &list_segments(dir.path())[0];
        let raw = fs::read(path).unwrap();
        // Chop into the last entry's frame.
        fs::write(path, &raw[..raw.len() - 10]).unwrap();

        let buffer = DiskBuffer::new(&config(dir.path())).unwrap();
        let (stats, records) = drain_all(&buffer).await;
        assert_eq!(records.len(), 2);
        assert_eq!(stats.records, 2);
    }

    #[tokio::test]
    async fn full_buffer_refuses_appends() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_total_size = 4 * 1024;
        cfg.max_file_size = 1024;
        let buffer = DiskBuffer::new(&cfg).unwrap();
        let mut accepted = 0;
        let mut refused = 0;
        for n in 0..50 {
            match buffer.append(&record(n)) {
                Ok(()) => accepted += 1,
                Err(Error::QueueFull) => refused += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(accepted > 0);
        assert!(refused > 0);
    }

    #[tokio::test]
    async fn cleanup_enforces_max_files() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_file_size = 128;
        let buffer = DiskBuffer::new(&cfg).unwrap();
        for n in 0..30 {
            buffer.append(&record(n)).unwrap();
        }
        buffer.flush_and_close().unwrap();
        let before = list_segments(dir.path()).len();
        assert!(before > 2);

        // Shrink the cap and run one cleanup pass.
        let mut cfg2 = cfg.clone();
        cfg2.max_files = 2;
        let buffer = DiskBuffer::new(&cfg2).unwrap();
        buffer.enforce_limits();
        assert!(list_segments(dir.path()).len() <= 2);
    }
}
