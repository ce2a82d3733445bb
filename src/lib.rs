//! Durable log ingestion and delivery pipeline core.
//!
//! Sources submit line-framed records; the dispatcher routes each one
//! through submit filters, per-origin transform chains, and content
//! deduplication, then batches them to every matching sink with retries,
//! per-sink circuit breaking, and adaptive rate limiting. Durability is
//! layered: a disk buffer absorbs queue overflow and shutdown residue, a
//! dead letter queue parks permanently rejected records for replay, and a
//! position store checkpoints per-origin cursors so a restart resumes
//! exactly where confirmed delivery left off.
//!
//! The admin surface, configuration loading, metric exposition, and the
//! source monitors themselves live in the embedding process; this crate
//! exposes [`Dispatcher`] and the typed [`Config`] they drive it with.

pub mod breaker;
pub mod config;
pub mod dedup;
pub mod disk_buffer;
pub mod dispatcher;
pub mod dlq;
pub mod error;
pub mod event;
mod internal_events;
pub mod limiter;
pub mod pipeline;
pub mod positions;
pub mod queue;
pub mod sinks;

pub use crate::{
    config::Config,
    dispatcher::{Dispatcher, DrainReport, PipelineStats, SubmitOutcome},
    error::{Error, ErrorKind, Result},
    event::{Batch, Cursor, DeliveryStatus, Origin, Record, Severity, SourceAck},
};
