//! Durable per-origin delivery cursors.
//!
//! Workers stage cursor advances in memory through a shared
//! [`PositionsView`]; one background task owns every write to disk. The
//! durability protocol is tmp-file + fsync + atomic rename onto the
//! primary, with the previous primary rotated into `.backup.{1,2,3}` and
//! periodic gzip checkpoints as the final fallback. Recovery walks the
//! candidates in that order and renames corrupt files aside instead of
//! deleting them.

mod checkpoint;

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::PositionsConfig,
    error::{Error, Result},
    event::{Cursor, Origin},
    internal_events::{PositionCorruptionDetected, PositionsFlushed},
};

pub const POSITION_FILE_NAME: &str = "positions.json";
const TMP_FILE_NAME: &str = "positions.new.json";
const BACKUP_COUNT: u8 = 3;

/// How long a dead origin's position is kept before it is dropped from the
/// persisted set.
const REMOVED_GRACE: chrono::Duration = chrono::Duration::seconds(60);

/// On-disk format. Any incompatible change requires a new variant.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "version")]
enum State {
    #[serde(rename = "1")]
    V1 { positions: Vec<PositionEntry> },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PositionEntry {
    pub origin: Origin,
    pub cursor: Cursor,
    pub last_update: DateTime<Utc>,
}

/// Where the state was recovered from at startup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadedFrom {
    Primary,
    Backup(u8),
    Checkpoint(u64),
    Fresh,
}

/// Thread-safe in-memory staging area shared between the workers (who
/// advance cursors) and the single background writer.
#[derive(Debug, Default)]
pub struct PositionsView {
    positions: DashMap<Origin, Cursor>,
    modified: DashMap<Origin, DateTime<Utc>>,
    removed: DashMap<Origin, DateTime<Utc>>,
    staged: AtomicUsize,
    flush_signal: Notify,
}

impl PositionsView {
    /// Advances the cursor for an origin. Advancement is monotonic: a
    /// stale cursor (from a retried batch that raced a newer one) is
    /// ignored.
    pub fn advance(&self, origin: Origin, cursor: Cursor) -> bool {
        let mut advanced = false;
        self.positions
            .entry(origin.clone())
            .and_modify(|current| {
                if cursor > *current {
                    *current = cursor;
                    advanced = true;
                }
            })
            .or_insert_with(|| {
                advanced = true;
                cursor
            });
        if advanced {
            self.modified.insert(origin.clone(), Utc::now());
            self.removed.remove(&origin);
            self.staged.fetch_add(1, Ordering::Relaxed);
            self.flush_signal.notify_one();
        }
        advanced
    }

    pub fn get(&self, origin: &Origin) -> Option<Cursor> {
        self.positions.get(origin).map(|r| *r.value())
    }

    /// Marks an origin gone (file deleted, container removed). Its final
    /// cursor stays persisted for the grace period, then ages out.
    pub fn set_dead(&self, origin: &Origin) {
        self.removed.insert(origin.clone(), Utc::now());
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Staged advances since the last flush.
    fn staged_count(&self) -> usize {
        self.staged.load(Ordering::Relaxed)
    }

    fn remove_expired(&self) {
        let now = Utc::now();
        let to_remove: Vec<Origin> = self
            .removed
            .iter()
            .filter(|entry| now - *entry.value() >= REMOVED_GRACE)
            .map(|entry| entry.key().clone())
            .collect();
        for origin in to_remove {
            self.positions.remove(&origin);
            self.modified.remove(&origin);
            self.removed.remove(&origin);
        }
    }

    fn get_state(&self) -> State {
        State::V1 {
            positions: self
                .positions
                .iter()
                .map(|entry| PositionEntry {
                    origin: entry.key().clone(),
                    cursor: *entry.value(),
                    last_update: self
                        .modified
                        .get(entry.key())
                        .map(|r| *r.value())
                        .unwrap_or_else(Utc::now),
                })
                .collect(),
        }
    }

    fn set_state(&self, state: State) {
        match state {
            State::V1 { positions } => {
                for entry in positions {
                    self.positions.insert(entry.origin.clone(), entry.cursor);
                    self.modified.insert(entry.origin, entry.last_update);
                }
            }
        }
    }
}

pub struct PositionStore {
    primary_path: PathBuf,
    tmp_path: PathBuf,
    checkpoint_dir: PathBuf,
    flush_interval: Duration,
    flush_batch_size: usize,
    checkpoint_interval: Duration,
    max_checkpoints: usize,
    view: Arc<PositionsView>,
    last_written: Mutex<Option<State>>,
}

impl PositionStore {
    /// Creates the store and its directories. Directory failures are
    /// `fatal_init`.
    pub fn new(config: &PositionsConfig) -> Result<PositionStore> {
        let checkpoint_dir = config.base_dir.join("checkpoints");
        fs::create_dir_all(&config.base_dir).map_err(|source| Error::CreateDir {
            path: config.base_dir.clone(),
            source,
        })?;
        fs::create_dir_all(&checkpoint_dir).map_err(|source| Error::CreateDir {
            path: checkpoint_dir.clone(),
            source,
        })?;

        Ok(PositionStore {
            primary_path: config.base_dir.join(POSITION_FILE_NAME),
            tmp_path: config.base_dir.join(TMP_FILE_NAME),
            checkpoint_dir,
            flush_interval: config.flush_interval(),
            flush_batch_size: config.flush_batch_size,
            checkpoint_interval: config.checkpoint_interval(),
            max_checkpoints: config.max_checkpoints,
            view: Arc::new(PositionsView::default()),
            last_written: Mutex::new(None),
        })
    }

    pub fn view(&self) -> Arc<PositionsView> {
        Arc::clone(&self.view)
    }

    /// Loads persisted state, walking primary → backups → newest
    /// checkpoint. The first candidate that parses and validates wins;
    /// corrupt candidates are renamed aside for forensics.
    pub fn load(&self) -> LoadedFrom {
        let mut candidates: Vec<(LoadedFrom, PathBuf, bool)> = Vec::new();
        candidates.push((LoadedFrom::Primary, self.primary_path.clone(), false));
        for n in 1..=BACKUP_COUNT {
            candidates.push((LoadedFrom::Backup(n), self.backup_path(n), false));
        }
        for (generation, path) in checkpoint::list(&self.checkpoint_dir) {
            candidates.push((LoadedFrom::Checkpoint(generation), path, true));
        }

        let mut any_existed = false;
        for (source, path, compressed) in candidates {
            match self.read_candidate(&path, compressed) {
                Ok(Some(state)) => {
                    let State::V1 { positions } = &state;
                    info!(
                        message = "Loaded position data.",
                        path = %path.display(),
                        positions = positions.len(),
                    );
                    self.view.set_state(state);
                    return source;
                }
                Ok(None) => {}
                Err(error) => {
                    any_existed = true;
                    PositionCorruptionDetected {
                        path: &path,
                        reason: &error.to_string(),
                    }
                    .emit();
                    self.quarantine(&path);
                }
            }
        }

        if any_existed {
            warn!(message = "All position candidates failed validation; starting fresh.");
        }
        LoadedFrom::Fresh
    }

    /// Persists the current state if it changed since the last write.
    ///
    /// Protocol: serialize to a temp file, fsync, rotate the previous
    /// primary into the backup chain, rename the temp file into place.
    pub fn write_positions(&self) -> io::Result<usize> {
        self.view.remove_expired();
        let current = self.view.get_state();
        let count = match &current {
            State::V1 { positions } => positions.len(),
        };

        let mut last = self.last_written.lock();
        if last.as_ref() == Some(&current) {
            return Ok(count);
        }

        let mut file = io::BufWriter::new(fs::File::create(&self.tmp_path)?);
        serde_json::to_writer(&mut file, &current)?;
        file.into_inner()
            .map_err(|e| e.into_error())?
            .sync_all()?;

        self.rotate_backups();
        fs::rename(&self.tmp_path, &self.primary_path)?;

        self.view.staged.store(0, Ordering::Relaxed);
        *last = Some(current);
        PositionsFlushed { positions: count }.emit();
        Ok(count)
    }

    /// Writes a generational checkpoint of the current state.
    pub fn write_checkpoint(&self) -> io::Result<u64> {
        let state = self.view.get_state();
        let payload = serde_json::to_vec(&state)?;
        checkpoint::write(&self.checkpoint_dir, &payload, self.max_checkpoints)
    }

    /// Background flush/checkpoint loop; owns every disk write.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut flush = tokio::time::interval(self.flush_interval);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut checkpoint = tokio::time::interval(self.checkpoint_interval);
        checkpoint.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Both intervals fire immediately once; swallow that.
        flush.tick().await;
        checkpoint.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = flush.tick() => Self::blocking_flush(&self).await,
                _ = checkpoint.tick() => Self::blocking_checkpoint(&self).await,
                _ = self.view.flush_signal.notified() => {
                    if self.view.staged_count() >= self.flush_batch_size {
                        Self::blocking_flush(&self).await;
                    }
                }
            }
        }

        // Final flush so a clean shutdown never loses acknowledged cursors.
        Self::blocking_flush(&self).await;
    }

    async fn blocking_flush(store: &Arc<Self>) {
        let store = Arc::clone(store);
        let result = tokio::task::spawn_blocking(move || store.write_positions()).await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => warn!(message = "Failed to flush positions.", %error),
            Err(error) => warn!(message = "Position flush task panicked.", %error),
        }
    }

    async fn blocking_checkpoint(store: &Arc<Self>) {
        let store = Arc::clone(store);
        let result = tokio::task::spawn_blocking(move || store.write_checkpoint()).await;
        match result {
            Ok(Ok(generation)) => {
                info!(message = "Position checkpoint written.", generation = %generation);
            }
            Ok(Err(error)) => warn!(message = "Failed to write position checkpoint.", %error),
            Err(error) => warn!(message = "Checkpoint task panicked.", %error),
        }
    }

    fn backup_path(&self, n: u8) -> PathBuf {
        let mut name = POSITION_FILE_NAME.to_string();
        name.push_str(&format!(".backup.{n}"));
        self.primary_path.with_file_name(name)
    }

    /// Rotates primary → backup.1 → … → backup.3 before a new primary is
    /// renamed into place. The oldest backup falls off the end.
    fn rotate_backups(&self) {
        for n in (1..BACKUP_COUNT).rev() {
            fs::rename(self.backup_path(n), self.backup_path(n + 1)).ok();
        }
        fs::rename(&self.primary_path, self.backup_path(1)).ok();
    }

    fn read_candidate(&self, path: &Path, compressed: bool) -> io::Result<Option<State>> {
        let raw = if compressed {
            match checkpoint::read(path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e),
            }
        } else {
            match fs::read(path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e),
            }
        };
        let state: State = serde_json::from_slice(&raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(state))
    }

    fn quarantine(&self, path: &Path) {
        let aside = path.with_extension(format!("corrupt.{}", Utc::now().timestamp()));
        if let Err(error) = fs::rename(path, &aside) {
            warn!(
                message = "Failed to quarantine corrupt position file.",
                path = %path.display(),
                %error,
            );
        }
    }
}
