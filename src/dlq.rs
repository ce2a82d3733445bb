//! Dead letter queue: an append-only segmented log of records a sink
//! permanently rejected.
//!
//! Entries are `[u32 BE length][json]` frames in `segment_<N>.log` files.
//! The queue never discards silently: at `total_max_bytes` it either
//! deletes its oldest full segment (`retention_on_full = false`, the
//! default) or refuses the write with a terminal `dlq_full` error.
//! Reprocessing drains oldest-first and moves consumed entries into a
//! `processed/<YYYY-MM-DD>/` subtree.

use std::{
    collections::BTreeMap,
    fs,
    io::{self, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    config::DlqConfig,
    error::{Error, Result},
    event::Record,
    internal_events::{DlqReprocessed, DlqSegmentDropped},
};

const SEGMENT_PREFIX: &str = "segment_";
const SEGMENT_SUFFIX: &str = ".log";
const PROCESSED_DIR: &str = "processed";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DlqEntry {
    pub record: Record,
    pub first_failure_time: DateTime<Utc>,
    pub attempts: u32,
    pub last_error_kind: String,
    pub target_sink: String,
}

struct OpenSegment {
    writer: BufWriter<fs::File>,
    path: PathBuf,
    index: u64,
    bytes: u64,
    entries: u64,
}

struct DlqState {
    current: Option<OpenSegment>,
    next_index: u64,
    /// Closed segments by index, with their on-disk size.
    closed: BTreeMap<u64, (PathBuf, u64)>,
}

pub struct DeadLetterQueue {
    base_dir: PathBuf,
    segment_max_bytes: u64,
    total_max_bytes: u64,
    retention_on_full: bool,
    state: Mutex<DlqState>,
    depth: AtomicU64,
}

impl DeadLetterQueue {
    /// Opens the queue directory, indexing existing segments and counting
    /// their entries for the depth gauge. Directory failures are
    /// `fatal_init`.
    pub fn new(config: &DlqConfig) -> Result<DeadLetterQueue> {
        fs::create_dir_all(&config.base_dir).map_err(|source| Error::CreateDir {
            path: config.base_dir.clone(),
            source,
        })?;
        let processed = config.base_dir.join(PROCESSED_DIR);
        fs::create_dir_all(&processed).map_err(|source| Error::CreateDir {
            path: processed,
            source,
        })?;

        let mut closed = BTreeMap::new();
        let mut next_index = 0;
        let mut depth = 0;
        for (index, path) in list_segments(&config.base_dir) {
            let bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            depth += count_entries(&path).unwrap_or(0);
            closed.insert(index, (path, bytes));
            next_index = next_index.max(index + 1);
        }

        Ok(DeadLetterQueue {
            base_dir: config.base_dir.clone(),
            segment_max_bytes: config.segment_max_bytes,
            total_max_bytes: config.total_max_bytes,
            retention_on_full: config.retention_on_full,
            state: Mutex::new(DlqState {
                current: None,
                next_index,
                closed,
            }),
            depth: AtomicU64::new(depth),
        })
    }

    /// Appends one entry, rotating and enforcing the total cap first.
    pub fn push(&self, entry: &DlqEntry) -> Result<()> {
        let payload = serde_json::to_vec(entry).map_err(|e| Error::CorruptState {
            path: self.base_dir.clone(),
            reason: e.to_string(),
        })?;
        let frame_len = 4 + payload.len() as u64;

        let mut state = self.state.lock();

        if self
            .current_bytes(&state)
            .map(|bytes| bytes + frame_len > self.segment_max_bytes)
            .unwrap_or(false)
        {
            self.close_current(&mut state)?;
        }

        while self.total_bytes(&state) + frame_len > self.total_max_bytes {
            if self.retention_on_full {
                return Err(Error::DlqFull);
            }
            let Some(oldest) = state.closed.keys().next().copied() else {
                // Nothing left to evict; the single entry exceeds the cap.
                return Err(Error::DlqFull);
            };
            let (path, bytes) = state.closed.remove(&oldest).expect("key just observed");
            let dropped = count_entries(&path).unwrap_or(0);
            fs::remove_file(&path).ok();
            self.depth
                .fetch_sub(dropped.min(self.depth.load(Ordering::SeqCst)), Ordering::SeqCst);
            DlqSegmentDropped { path, bytes }.emit();
        }

        if state.current.is_none() {
            let index = state.next_index;
            state.next_index += 1;
            let path = self.segment_path(index);
            let file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&path)
                .map_err(|source| Error::Io {
                    path: path.clone(),
                    source,
                })?;
            state.current = Some(OpenSegment {
                writer: BufWriter::new(file),
                path,
                index,
                bytes: 0,
                entries: 0,
            });
        }

        let segment = state.current.as_mut().expect("segment just ensured");
        let len = payload.len() as u32;
        let write = segment
            .writer
            .write_all(&len.to_be_bytes())
            .and_then(|()| segment.writer.write_all(&payload))
            .and_then(|()| segment.writer.flush());
        write.map_err(|source| Error::Io {
            path: segment.path.clone(),
            source,
        })?;
        segment.bytes += frame_len;
        segment.entries += 1;
        self.depth.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Entries currently parked in the queue.
    pub fn depth(&self) -> u64 {
        self.depth.load(Ordering::SeqCst)
    }

    /// Flushes and fsyncs the open segment.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(segment) = state.current.as_mut() {
            segment
                .writer
                .flush()
                .and_then(|()| segment.writer.get_ref().sync_all())
                .map_err(|source| Error::Io {
                    path: segment.path.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.close_current(&mut state)
    }

    /// Drains up to `limit` entries oldest-first, handing each to
    /// `submit`; `submit` returns whether the dispatcher accepted it.
    ///
    /// Fully consumed segments move atomically into `processed/<date>/`.
    /// A partially consumed segment is rewritten in place with only its
    /// remaining entries, so nothing is resubmitted twice on the next
    /// pass. On rejection the drain stops and everything unconsumed stays
    /// put.
    pub async fn reprocess<F, Fut>(&self, limit: usize, mut submit: F) -> Result<usize>
    where
        F: FnMut(DlqEntry) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        {
            let mut state = self.state.lock();
            self.close_current(&mut state)?;
        }

        let segments: Vec<(u64, PathBuf)> = {
            let state = self.state.lock();
            state
                .closed
                .iter()
                .map(|(index, (path, _))| (*index, path.clone()))
                .collect()
        };

        let mut consumed_total = 0;
        let mut stopped = false;
        for (index, path) in segments {
            if consumed_total >= limit || stopped {
                break;
            }
            let entries = read_entries(&path).map_err(|source| Error::Io {
                path: path.clone(),
                source,
            })?;

            let mut consumed_here = 0;
            for entry in &entries {
                if consumed_total >= limit {
                    break;
                }
                if submit(entry.clone()).await {
                    consumed_here += 1;
                    consumed_total += 1;
                } else {
                    stopped = true;
                    break;
                }
            }

            if consumed_here == 0 {
                continue;
            }
            if consumed_here == entries.len() {
                self.mark_segment_processed(index, &path)?;
            } else {
                self.rewrite_segment_tail(index, &path, &entries[consumed_here..])?;
            }
            self.depth.fetch_sub(
                (consumed_here as u64).min(self.depth.load(Ordering::SeqCst)),
                Ordering::SeqCst,
            );
        }

        if consumed_total > 0 {
            DlqReprocessed {
                records: consumed_total,
            }
            .emit();
        }
        Ok(consumed_total)
    }

    fn mark_segment_processed(&self, index: u64, path: &Path) -> Result<()> {
        let day_dir = self
            .base_dir
            .join(PROCESSED_DIR)
            .join(Utc::now().format("%Y-%m-%d").to_string());
        fs::create_dir_all(&day_dir).map_err(|source| Error::Io {
            path: day_dir.clone(),
            source,
        })?;
        let target = day_dir.join(
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("{SEGMENT_PREFIX}{index}{SEGMENT_SUFFIX}")),
        );
        fs::rename(path, &target).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.state.lock().closed.remove(&index);
        Ok(())
    }

    /// Rewrites a segment with only its unconsumed entries, atomically.
    fn rewrite_segment_tail(&self, index: u64, path: &Path, remaining: &[DlqEntry]) -> Result<()> {
        let tmp = path.with_extension("log.rewrite");
        {
            let mut writer = BufWriter::new(fs::File::create(&tmp).map_err(|source| Error::Io {
                path: tmp.clone(),
                source,
            })?);
            for entry in remaining {
                let payload = serde_json::to_vec(entry).map_err(|e| Error::CorruptState {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
                let len = payload.len() as u32;
                writer
                    .write_all(&len.to_be_bytes())
                    .and_then(|()| writer.write_all(&payload))
                    .map_err(|source| Error::Io {
                        path: tmp.clone(),
                        source,
                    })?;
            }
            writer
                .flush()
                .and_then(|()| writer.get_ref().sync_all())
                .map_err(|source| Error::Io {
                    path: tmp.clone(),
                    source,
                })?;
        }
        fs::rename(&tmp, path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some((_, bytes)) = self.state.lock().closed.get_mut(&index) {
            *bytes = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        }
        Ok(())
    }

    fn close_current(&self, state: &mut DlqState) -> Result<()> {
        if let Some(mut segment) = state.current.take() {
            segment
                .writer
                .flush()
                .and_then(|()| segment.writer.get_ref().sync_all())
                .map_err(|source| Error::Io {
                    path: segment.path.clone(),
                    source,
                })?;
            if segment.entries == 0 {
                // Nothing was written; don't leave an empty segment behind.
                fs::remove_file(&segment.path).ok();
            } else {
                state.closed.insert(segment.index, (segment.path, segment.bytes));
            }
        }
        Ok(())
    }

    fn current_bytes(&self, state: &DlqState) -> Option<u64> {
        state.current.as_ref().map(|s| s.bytes)
    }

    fn total_bytes(&self, state: &DlqState) -> u64 {
        state.closed.values().map(|(_, bytes)| bytes).sum::<u64>()
            + state.current.as_ref().map(|s| s.bytes).unwrap_or(0)
    }

    fn segment_path(&self, index: u64) -> PathBuf {
        self.base_dir
            .join(format!("{SEGMENT_PREFIX}{index}{SEGMENT_SUFFIX}"))
    }
}

fn list_segments(dir: &Path) -> Vec<(u64, PathBuf)> {
    let pattern = dir
        .join(format!("{SEGMENT_PREFIX}*{SEGMENT_SUFFIX}"))
        .to_string_lossy()
        .into_owned();
    let mut segments: Vec<(u64, PathBuf)> = glob::glob(&pattern)
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().into_owned();
            let index = name
                .strip_prefix(SEGMENT_PREFIX)?
                .strip_suffix(SEGMENT_SUFFIX)?
                .parse()
                .ok()?;
            Some((index, path))
        })
        .collect();
    segments.sort_by_key(|(index, _)| *index);
    segments
}

/// Counts frames by walking length prefixes, without parsing payloads.
fn count_entries(path: &Path) -> io::Result<u64> {
    let mut file = fs::File::open(path)?;
    let mut count = 0;
    let mut len_buf = [0u8; 4];
    loop {
        match file.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(len_buf) as i64;
        match file.seek(SeekFrom::Current(len)) {
            Ok(_) => count += 1,
            Err(_) => break,
        }
    }
    Ok(count)
}

fn read_entries(path: &Path) -> io::Result<Vec<DlqEntry>> {
    let raw = fs::read(path)?;
    let mut entries = Vec::new();
    let mut offset = 0usize;
    while offset + 4 <= raw.len() {
        let len = u32::from_be_bytes(raw[offset..offset + 4].try_into().expect("4 bytes checked"))
            as usize;
        offset += 4;
        if offset + len > raw.len() {
            warn!(
                message = "Truncated dead letter segment tail.",
                path = %path.display(),
            );
            break;
        }
        match serde_json::from_slice::<DlqEntry>(&raw[offset..offset + len]) {
            Ok(entry) => entries.push(entry),
            Err(error) => {
                warn!(
                    message = "Skipping unreadable dead letter entry.",
                    path = %path.display(),
                    %error,
                );
            }
        }
        offset += len;
    }
    Ok(entries)
}
