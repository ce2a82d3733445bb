//! Sink contract and the two concrete adapters.
//!
//! The core hands batches to sinks opaquely; each sink owns its wire
//! format. A send outcome is `ok`, `transient` (worth retrying, counts
//! against the circuit breaker), or `permanent` (straight to the DLQ).

pub mod file;
pub mod http;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use snafu::Snafu;

use crate::{
    config::{SinkConfig, SinkKind},
    error::{Error, ErrorKind, Result},
    event::{Batch, Record},
};

#[derive(Debug, Snafu)]
pub enum SinkError {
    #[snafu(display("transient failure: {message}"))]
    Transient {
        message: String,
        /// Server-provided backoff hint (`Retry-After`), when present.
        retry_after: Option<Duration>,
    },
    #[snafu(display("batch rejected: {message}"))]
    Permanent { message: String },
}

impl SinkError {
    pub fn transient(message: impl Into<String>) -> SinkError {
        SinkError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> SinkError {
        SinkError::Permanent {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SinkError::Transient { retry_after, .. } => *retry_after,
            SinkError::Permanent { .. } => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SinkError::Transient { .. } => ErrorKind::TransientIo,
            SinkError::Permanent { .. } => ErrorKind::PermanentRejection,
        }
    }
}

pub type SendResult = std::result::Result<(), SinkError>;

/// Batch-delivery contract every destination implements.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> SinkKind;

    /// Whether this sink wants the record, based on its routing labels.
    fn matches(&self, record: &Record) -> bool;

    /// Called once before the first batch.
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Called during shutdown, after the last batch.
    async fn stop(&self) {}

    /// Delivers one batch. Implementations bound each attempt with their
    /// own per-attempt timeout.
    async fn send_batch(&self, batch: &Batch) -> SendResult;

    async fn healthcheck(&self) -> SendResult {
        Ok(())
    }
}

/// Label-subset routing shared by both adapters.
pub(crate) fn labels_match(
    wanted: &std::collections::BTreeMap<String, String>,
    record: &Record,
) -> bool {
    wanted
        .iter()
        .all(|(key, value)| record.labels().get(key) == Some(value))
}

/// Builds a sink from its configuration.
pub fn build(name: &str, config: &SinkConfig) -> Result<Arc<dyn Sink>> {
    match config.kind {
        SinkKind::LineProtocolHttp => Ok(Arc::new(http::HttpSink::new(name, config)?)),
        SinkKind::RotatedFile => Ok(Arc::new(file::FileSink::new(name, config)?)),
    }
}

pub(crate) fn missing_field(name: &str, field: &str) -> Error {
    Error::InvalidConfig {
        reason: format!("sinks.{name}: {field} is required"),
    }
}
