//! Error taxonomy for the pipeline core.
//!
//! Components return their own `snafu` error enums; everything that crosses
//! the dispatcher boundary is classified into an [`ErrorKind`] so the
//! dispatcher can own the retry / DLQ / defer / drop decision tree without
//! inspecting component internals.

use std::io;

use snafu::Snafu;

/// Coarse classification of a pipeline failure.
///
/// Kinds, not types: several concrete errors map onto the same kind, and the
/// kind alone determines how the dispatcher reacts.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Recoverable sink or network failure. Triggers retry and increments
    /// the sink's circuit breaker.
    TransientIo,
    /// The sink refused the payload outright. Routed to the DLQ, never
    /// retried.
    PermanentRejection,
    /// The queue is full under the configured overflow policy.
    Backpressure,
    /// Persisted state failed validation on read. The reader falls back to
    /// the next candidate; state is never silently zeroed out.
    Corruption,
    /// Configuration or persistence directories are unusable. The only kind
    /// that aborts before serving.
    FatalInit,
    /// Shutdown in progress.
    Cancelled,
}

impl ErrorKind {
    /// Stable label used for metrics and log fields.
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::PermanentRejection => "permanent_rejection",
            ErrorKind::Backpressure => "backpressure",
            ErrorKind::Corruption => "corruption",
            ErrorKind::FatalInit => "fatal_init",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level pipeline error.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("invalid configuration: {reason}"))]
    InvalidConfig { reason: String },

    #[snafu(display("failed to create persistence directory '{}': {source}", path.display()))]
    CreateDir {
        path: std::path::PathBuf,
        source: io::Error,
    },

    #[snafu(display("sink '{sink}' failed transiently: {reason}"))]
    SinkTransient { sink: String, reason: String },

    #[snafu(display("sink '{sink}' rejected the batch: {reason}"))]
    SinkRejected { sink: String, reason: String },

    #[snafu(display("queue is full"))]
    QueueFull,

    #[snafu(display("dead letter queue is full"))]
    DlqFull,

    #[snafu(display("corrupt state in '{}': {reason}", path.display()))]
    CorruptState {
        path: std::path::PathBuf,
        reason: String,
    },

    #[snafu(display("I/O failure on '{}': {source}", path.display()))]
    Io {
        path: std::path::PathBuf,
        source: io::Error,
    },

    #[snafu(display("operation cancelled by shutdown"))]
    Cancelled,
}

impl Error {
    /// Classify this error for the dispatcher's decision tree.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidConfig { .. } | Error::CreateDir { .. } => ErrorKind::FatalInit,
            Error::SinkTransient { .. } | Error::Io { .. } => ErrorKind::TransientIo,
            Error::SinkRejected { .. } | Error::DlqFull => ErrorKind::PermanentRejection,
            Error::QueueFull => ErrorKind::Backpressure,
            Error::CorruptState { .. } => ErrorKind::Corruption,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
