//! Rotated local-file sink.
//!
//! One JSON record per line. The active file rotates at `max_bytes` or
//! `max_age` into `<path>.<timestamp>`; the newest `max_files` rotated
//! files are kept. Disk-full is the only transient condition: the sink
//! prunes rotated files and asks for a retry; anything else either
//! succeeds or is a permanent rejection.

use std::{
    io,
    path::PathBuf,
    time::Instant,
};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{info, warn};

use crate::{
    config::{SinkConfig, SinkKind},
    error::{Error, Result},
    event::{Batch, Record},
    sinks::{labels_match, missing_field, SendResult, Sink, SinkError},
};

const ENOSPC: i32 = 28;

/// The shape of one output line.
#[derive(Serialize)]
struct LogLine<'a> {
    timestamp: &'a chrono::DateTime<Utc>,
    ingested_at: &'a chrono::DateTime<Utc>,
    severity: &'a str,
    origin: &'a str,
    labels: &'a std::collections::BTreeMap<String, String>,
    message: String,
}

struct OpenFile {
    file: fs::File,
    bytes: u64,
    opened_at: Instant,
}

pub struct FileSink {
    name: String,
    path: PathBuf,
    max_bytes: u64,
    max_age: std::time::Duration,
    max_files: usize,
    match_labels: std::collections::BTreeMap<String, String>,
    state: tokio::sync::Mutex<Option<OpenFile>>,
}

impl FileSink {
    pub fn new(name: &str, config: &SinkConfig) -> Result<FileSink> {
        let path = config
            .path
            .clone()
            .ok_or_else(|| missing_field(name, "path"))?;
        Ok(FileSink {
            name: name.to_string(),
            path,
            max_bytes: config.max_bytes,
            max_age: config.max_age(),
            max_files: config.max_files,
            match_labels: config.match_labels.clone(),
            state: tokio::sync::Mutex::new(None),
        })
    }

    async fn ensure_open(&self, state: &mut Option<OpenFile>) -> io::Result<()> {
        if state.is_none() {
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            let bytes = file.metadata().await.map(|m| m.len()).unwrap_or(0);
            *state = Some(OpenFile {
                file,
                bytes,
                opened_at: Instant::now(),
            });
        }
        Ok(())
    }

    async fn rotate_if_due(&self, state: &mut Option<OpenFile>) -> io::Result<()> {
        let due = state
            .as_ref()
            .map(|open| open.bytes >= self.max_bytes || open.opened_at.elapsed() >= self.max_age)
            .unwrap_or(false);
        if !due {
            return Ok(());
        }
        if let Some(mut open) = state.take() {
            open.file.flush().await?;
            open.file.sync_all().await?;
        }

        let mut target = self.rotated_path(&Utc::now().format("%Y%m%dT%H%M%S%.3f").to_string());
        let mut attempt = 1;
        while fs::try_exists(&target).await.unwrap_or(false) {
            target = self.rotated_path(&format!(
                "{}.{attempt}",
                Utc::now().format("%Y%m%dT%H%M%S%.3f")
            ));
            attempt += 1;
        }
        fs::rename(&self.path, &target).await?;
        info!(
            message = "Output file rotated.",
            sink = %self.name,
            to = %target.display(),
        );
        self.prune_rotated().await;
        Ok(())
    }

    fn rotated_path(&self, stamp: &str) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output.log".to_string());
        self.path.with_file_name(format!("{name}.{stamp}"))
    }

    /// Deletes the oldest rotated files beyond `max_files`. Rotation
    /// stamps sort lexicographically, so name order is age order.
    async fn prune_rotated(&self) {
        let Some(parent) = self.path.parent() else {
            return;
        };
        let prefix = format!(
            "{}.",
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        );

        let mut rotated = Vec::new();
        let Ok(mut entries) = fs::read_dir(parent).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with(&prefix) {
                rotated.push(entry.path());
            }
        }
        rotated.sort();

        if rotated.len() > self.max_files {
            let excess = rotated.len() - self.max_files;
            for path in rotated.into_iter().take(excess) {
                if let Err(error) = fs::remove_file(&path).await {
                    warn!(
                        message = "Failed to prune rotated file.",
                        path = %path.display(),
                        %error,
                    );
                }
            }
        }
    }

    async fn write_batch(&self, state: &mut Option<OpenFile>, batch: &Batch) -> io::Result<()> {
        self.rotate_if_due(state).await?;
        self.ensure_open(state).await?;
        let open = state.as_mut().expect("file just ensured");
        for record in batch.records() {
            let line = Self::render_line(record)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            open.file.write_all(&line).await?;
            open.bytes += line.len() as u64;
        }
        open.file.flush().await
    }

    fn render_line(record: &Record) -> serde_json::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(&LogLine {
            timestamp: &record.timestamp,
            ingested_at: &record.ingested_at,
            severity: record.severity.as_str(),
            origin: record.origin.id(),
            labels: record.labels(),
            message: String::from_utf8_lossy(&record.payload).into_owned(),
        })?;
        line.push(b'\n');
        Ok(line)
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SinkKind {
        SinkKind::RotatedFile
    }

    fn matches(&self, record: &Record) -> bool {
        labels_match(&self.match_labels, record)
    }

    async fn start(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| Error::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }

    async fn send_batch(&self, batch: &Batch) -> SendResult {
        let mut state = self.state.lock().await;

        let outcome = self.write_batch(&mut state, batch).await;
        match outcome {
            Ok(()) => Ok(()),
            Err(error) if error.raw_os_error() == Some(ENOSPC) => {
                // Disk full: drop the handle, prune rotated files, and
                // retry the write once before reporting transient. A
                // partially written first attempt may leave duplicate
                // lines; at-least-once permits that.
                warn!(
                    message = "Disk full; pruning rotated files and retrying once.",
                    sink = %self.name,
                );
                *state = None;
                self.prune_rotated().await;
                match self.write_batch(&mut state, batch).await {
                    Ok(()) => Ok(()),
                    Err(retry_error) if retry_error.raw_os_error() == Some(ENOSPC) => {
                        *state = None;
                        Err(SinkError::transient("disk full"))
                    }
                    Err(retry_error) => {
                        Err(SinkError::permanent(format!("write failed: {retry_error}")))
                    }
                }
            }
            Err(error) => Err(SinkError::permanent(format!("write failed: {error}"))),
        }
    }

    async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(open) = state.as_mut() {
            if let Err(error) = open.file.sync_all().await {
                warn!(message = "Failed to sync output file on stop.", %error);
            }
        }
        *state = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Cursor, Origin, Severity};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn sink_config(path: PathBuf, max_bytes: u64, max_files: usize) -> SinkConfig {
        SinkConfig {
            kind: SinkKind::RotatedFile,
            endpoint: None,
            headers: BTreeMap::new(),
            request_timeout_secs: 30,
            path: Some(path),
            max_bytes,
            max_age_secs: 24 * 60 * 60,
            max_files,
            match_labels: BTreeMap::new(),
            compression: crate::config::Compression::None,
            batch: Default::default(),
            retry: Default::default(),
            circuit_breaker: Default::default(),
            rate_limiter: Default::default(),
        }
    }

    fn batch_of(lines: &[&str]) -> Batch {
        let mut batch = Batch::new(1);
        for (n, line) in lines.iter().enumerate() {
            batch.push(Record::new(
                Origin::File {
                    path: "/var/log/in.log".to_string(),
                    inode: 2,
                },
                Cursor::Bytes(n as u64),
                line.to_string(),
                Utc::now(),
                Severity::Info,
                BTreeMap::new(),
            ));
        }
        batch
    }

    #[tokio::test]
    async fn writes_one_json_record_per_line() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.log");
        let sink = FileSink::new("file", &sink_config(out.clone(), 1024 * 1024, 5)).unwrap();
        sink.start().await.unwrap();

        sink.send_batch(&batch_of(&["first", "second"])).await.unwrap();
        sink.stop().await;

        let contents = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["message"], "first");
        assert_eq!(parsed["severity"], "info");
        assert_eq!(parsed["origin"], "/var/log/in.log");
    }

    #[tokio::test]
    async fn rotates_at_max_bytes_and_prunes() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.log");
        let sink = FileSink::new("file", &sink_config(out.clone(), 64, 2)).unwrap();
        sink.start().await.unwrap();

        for n in 0..10 {
            sink.send_batch(&batch_of(&[&format!("line number {n} with padding")]))
                .await
                .unwrap();
        }
        sink.stop().await;

        let rotated: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("out.log."))
            .collect();
        assert!(!rotated.is_empty());
        assert!(rotated.len() <= 2);
        // The active file still exists.
        assert!(out.exists());
    }

    #[tokio::test]
    async fn routing_labels_filter_records() {
        let dir = tempdir().unwrap();
        let mut config = sink_config(dir.path().join("out.log"), 1024, 2);
        config
            .match_labels
            .insert("tier".to_string(), "web".to_string());
        let sink = FileSink::new("file", &config).unwrap();

        let mut labels = BTreeMap::new();
        labels.insert("tier".to_string(), "web".to_string());
        let matching = Record::new(
            Origin::File {
                path: "/a".into(),
                inode: 1,
            },
            Cursor::Bytes(0),
            "x",
            Utc::now(),
            Severity::Info,
            labels,
        );
        let other = Record::new(
            Origin::File {
                path: "/a".into(),
                inode: 1,
            },
            Cursor::Bytes(1),
            "x",
            Utc::now(),
            Severity::Info,
            BTreeMap::new(),
        );
        assert!(sink.matches(&matching));
        assert!(!sink.matches(&other));
    }
}
