//! Typed configuration for the pipeline core.
//!
//! One document configures the dispatcher, every sink, and the persistence
//! subsystems. Durations are plain integer `*_secs` / `*_ms` fields.
//! Parsing and hot reload live in the embedding process; this module only
//! defines the document, its defaults, and validation. Validation failures
//! are `fatal_init`: the core refuses to start on a bad document.

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_QUEUE_SIZE: usize = 50_000;
pub const DEFAULT_MAX_BATCH_RECORDS: usize = 500;
pub const DEFAULT_MAX_BATCH_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MAX_BATCH_LINGER_MS: u64 = 200;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 200;
pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 30;
pub const DEFAULT_SOFT_THRESHOLD: f64 = 0.7;
pub const DEFAULT_HARD_THRESHOLD: f64 = 0.9;
pub const DEFAULT_DRAIN_DEADLINE_SECS: u64 = 30;
pub const DEFAULT_OPEN_DEFER_LIMIT: u32 = 3;
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 1_000;
pub const MAX_WORKER_COUNT: usize = 64;

/// What to do with a new submission once the queue and disk buffer are at
/// `max_total_pending`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the new submission.
    DropNew,
    /// Evict the oldest queued record to make room.
    DropOldest,
    /// Spill new submissions to the disk buffer.
    #[default]
    DiskBuffer,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatcherConfig {
    /// Worker pool size. Defaults to the CPU count, clamped to 1..=64.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_max_batch_records")]
    pub max_batch_records: usize,
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    #[serde(default = "default_max_batch_linger_ms")]
    pub max_batch_linger_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Queue utilisation at which new submissions start writing through to
    /// the disk buffer.
    #[serde(default = "default_soft_threshold")]
    pub soft_threshold: f64,
    /// Queue utilisation at which `priority=low` submissions are rejected.
    #[serde(default = "default_hard_threshold")]
    pub hard_threshold: f64,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    #[serde(default = "default_drain_deadline_secs")]
    pub drain_deadline_secs: u64,
    /// How many times a batch is returned to the queue tail while a sink's
    /// breaker is open before it is routed to the DLQ.
    #[serde(default = "default_open_defer_limit")]
    pub open_defer_limit: u32,
    /// Upper bound on a worker's wait for rate limiter tokens.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Whether `submit` keeps accepting records while draining.
    #[serde(default)]
    pub accept_during_drain: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            worker_count: default_worker_count(),
            queue_size: default_queue_size(),
            max_batch_records: default_max_batch_records(),
            max_batch_bytes: default_max_batch_bytes(),
            max_batch_linger_ms: default_max_batch_linger_ms(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            soft_threshold: default_soft_threshold(),
            hard_threshold: default_hard_threshold(),
            overflow_policy: OverflowPolicy::default(),
            drain_deadline_secs: default_drain_deadline_secs(),
            open_defer_limit: default_open_defer_limit(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            accept_during_drain: false,
        }
    }
}

impl DispatcherConfig {
    pub fn max_batch_linger(&self) -> Duration {
        Duration::from_millis(self.max_batch_linger_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn drain_deadline(&self) -> Duration {
        Duration::from_secs(self.drain_deadline_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SinkKind {
    LineProtocolHttp,
    RotatedFile,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_breaker_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_breaker_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            max_failures: default_breaker_max_failures(),
            reset_timeout_secs: default_breaker_reset_timeout_secs(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimiterConfig {
    #[serde(default = "default_limiter_capacity")]
    pub capacity: u64,
    /// Steady-state refill rate, tokens per second.
    #[serde(default = "default_limiter_refill_rate")]
    pub refill_rate: f64,
    /// Floor the adaptive controller will not halve below.
    #[serde(default = "default_limiter_min_refill")]
    pub min_refill: f64,
    /// Minimum spacing between adaptive adjustments.
    #[serde(default = "default_limiter_adjust_interval_secs")]
    pub adjust_interval_secs: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        RateLimiterConfig {
            capacity: default_limiter_capacity(),
            refill_rate: default_limiter_refill_rate(),
            min_refill: default_limiter_min_refill(),
            adjust_interval_secs: default_limiter_adjust_interval_secs(),
        }
    }
}

impl RateLimiterConfig {
    pub fn adjust_interval(&self) -> Duration {
        Duration::from_secs(self.adjust_interval_secs)
    }
}

/// Per-sink batch limits. Unset fields inherit the dispatcher's limits.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkBatchConfig {
    pub max_records: Option<usize>,
    pub max_bytes: Option<usize>,
}

/// Per-sink retry overrides. Unset fields inherit the dispatcher's policy.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkRetryConfig {
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_secs: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    #[serde(rename = "type")]
    pub kind: SinkKind,

    /// Push endpoint for the line-protocol HTTP sink.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Extra request headers, credentials included. Opaque to the core.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Per-attempt request timeout for the HTTP sink.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Output path for the rotated-file sink.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_file_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_file_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default = "default_file_max_files")]
    pub max_files: usize,

    /// Only records whose labels contain every entry here are routed to
    /// this sink. Empty means the sink receives everything.
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,

    #[serde(default)]
    pub compression: Compression,
    #[serde(default)]
    pub batch: SinkBatchConfig,
    #[serde(default)]
    pub retry: SinkRetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
}

impl SinkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PositionsConfig {
    pub base_dir: PathBuf,
    #[serde(default = "default_positions_flush_interval_secs")]
    pub flush_interval_secs: u64,
    /// Staged update count that forces an early flush.
    #[serde(default = "default_positions_flush_batch_size")]
    pub flush_batch_size: usize,
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,
}

impl PositionsConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskBufferConfig {
    pub base_dir: PathBuf,
    #[serde(default = "default_buffer_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_buffer_max_total_size")]
    pub max_total_size: u64,
    #[serde(default = "default_buffer_max_files")]
    pub max_files: usize,
    #[serde(default)]
    pub compression_enabled: bool,
    #[serde(default = "default_buffer_sync_interval_secs")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_buffer_retention_secs")]
    pub retention_secs: u64,
}

impl DiskBufferConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DlqConfig {
    pub base_dir: PathBuf,
    #[serde(default = "default_dlq_segment_max_bytes")]
    pub segment_max_bytes: u64,
    #[serde(default = "default_dlq_total_max_bytes")]
    pub total_max_bytes: u64,
    /// When true, a full DLQ refuses writes instead of deleting its oldest
    /// segment.
    #[serde(default)]
    pub retention_on_full: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DedupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_dedup_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_dedup_ttl_secs")]
    pub ttl_secs: u64,
    /// Labels folded into the content fingerprint.
    #[serde(default)]
    pub fingerprint_labels: Vec<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        DedupConfig {
            enabled: true,
            cache_capacity: default_dedup_cache_capacity(),
            ttl_secs: default_dedup_ttl_secs(),
            fingerprint_labels: Vec::new(),
        }
    }
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// A drop rule applied at the submit boundary, before dedup and pipeline.
///
/// The feedback guard that keeps the service from ingesting its own logs is
/// expressed as one of these rules.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitFilter {
    pub label: String,
    /// Anchored regular expression the label value must match for the
    /// record to be dropped.
    pub pattern: String,
}

/// One pipeline step, applied in order.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum PipelineStepConfig {
    LabelSet { key: String, value: String },
    LabelRename { from: String, to: String },
    LabelDrop { key: String },
    /// Parse the payload as JSON and lift the named top-level string
    /// fields into labels.
    JsonParseIntoLabels { fields: Vec<String> },
    DropIfMatch { pattern: String },
    SeverityRemap { from_label: String },
}

/// A transform chain bound to the origins matching `origin_glob`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Glob over origin ids; `*` matches everything.
    #[serde(default = "default_origin_glob")]
    pub origin_glob: String,
    pub steps: Vec<PipelineStepConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub sinks: BTreeMap<String, SinkConfig>,
    pub positions: PositionsConfig,
    pub disk_buffer: DiskBufferConfig,
    pub dlq: DlqConfig,
    #[serde(default)]
    pub deduplication: DedupConfig,
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
    #[serde(default)]
    pub submit_filters: Vec<SubmitFilter>,
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Config> {
        let config: Config = toml::from_str(raw).map_err(|e| Error::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &std::path::Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Config::from_toml_str(&raw)
    }

    /// Validates the whole document. Any failure here is `fatal_init`.
    pub fn validate(&self) -> Result<()> {
        let d = &self.dispatcher;
        if d.worker_count == 0 || d.worker_count > MAX_WORKER_COUNT {
            return invalid(format!(
                "dispatcher.worker_count must be 1..={MAX_WORKER_COUNT}, got {}",
                d.worker_count
            ));
        }
        if d.queue_size == 0 {
            return invalid("dispatcher.queue_size must be non-zero".to_string());
        }
        if d.max_batch_records == 0 || d.max_batch_bytes == 0 {
            return invalid("dispatcher batch limits must be non-zero".to_string());
        }
        if d.max_attempts == 0 {
            return invalid("dispatcher.max_attempts must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&d.soft_threshold)
            || !(0.0..=1.0).contains(&d.hard_threshold)
            || d.soft_threshold >= d.hard_threshold
        {
            return invalid(format!(
                "dispatcher thresholds must satisfy 0 <= soft < hard <= 1, got soft={} hard={}",
                d.soft_threshold, d.hard_threshold
            ));
        }

        for (name, sink) in &self.sinks {
            match sink.kind {
                SinkKind::LineProtocolHttp => {
                    if sink.endpoint.as_deref().unwrap_or("").is_empty() {
                        return invalid(format!("sinks.{name}: endpoint is required"));
                    }
                }
                SinkKind::RotatedFile => {
                    if sink.path.is_none() {
                        return invalid(format!("sinks.{name}: path is required"));
                    }
                    if sink.max_files == 0 || sink.max_bytes == 0 {
                        return invalid(format!(
                            "sinks.{name}: max_files and max_bytes must be non-zero"
                        ));
                    }
                }
            }
            let rl = &sink.rate_limiter;
            if rl.capacity == 0 {
                return invalid(format!("sinks.{name}: rate_limiter.capacity must be non-zero"));
            }
            if rl.refill_rate <= 0.0 || rl.min_refill <= 0.0 || rl.min_refill > rl.refill_rate {
                return invalid(format!(
                    "sinks.{name}: rate_limiter refill rates must satisfy 0 < min_refill <= refill_rate"
                ));
            }
            if sink.circuit_breaker.max_failures == 0 {
                return invalid(format!(
                    "sinks.{name}: circuit_breaker.max_failures must be non-zero"
                ));
            }
        }

        if d.acquire_timeout_ms == 0 {
            return invalid("dispatcher.acquire_timeout_ms must be non-zero".to_string());
        }

        if self.positions.flush_interval_secs == 0 || self.positions.checkpoint_interval_secs == 0
        {
            return invalid("positions intervals must be non-zero".to_string());
        }
        if self.disk_buffer.max_file_size == 0 || self.disk_buffer.max_files == 0 {
            return invalid("disk_buffer limits must be non-zero".to_string());
        }
        if self.disk_buffer.sync_interval_secs == 0 {
            return invalid("disk_buffer.sync_interval_secs must be non-zero".to_string());
        }
        if self.dlq.segment_max_bytes == 0 {
            return invalid("dlq.segment_max_bytes must be non-zero".to_string());
        }
        if self.deduplication.enabled && self.deduplication.cache_capacity == 0 {
            return invalid("deduplication.cache_capacity must be non-zero".to_string());
        }

        for filter in &self.submit_filters {
            if let Err(e) = regex::Regex::new(&filter.pattern) {
                return invalid(format!("submit_filters: bad pattern '{}': {e}", filter.pattern));
            }
        }
        for pipeline in &self.pipelines {
            for step in &pipeline.steps {
                if let PipelineStepConfig::DropIfMatch { pattern } = step {
                    if let Err(e) = regex::Regex::new(pattern) {
                        return invalid(format!("pipelines: bad pattern '{pattern}': {e}"));
                    }
                }
            }
        }

        Ok(())
    }
}

fn invalid(reason: String) -> Result<()> {
    Err(Error::InvalidConfig { reason })
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_WORKER_COUNT)
}

fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}

fn default_max_batch_records() -> usize {
    DEFAULT_MAX_BATCH_RECORDS
}

fn default_max_batch_bytes() -> usize {
    DEFAULT_MAX_BATCH_BYTES
}

fn default_max_batch_linger_ms() -> u64 {
    DEFAULT_MAX_BATCH_LINGER_MS
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_initial_backoff_ms() -> u64 {
    DEFAULT_INITIAL_BACKOFF_MS
}

fn default_max_backoff_secs() -> u64 {
    DEFAULT_MAX_BACKOFF_SECS
}

fn default_soft_threshold() -> f64 {
    DEFAULT_SOFT_THRESHOLD
}

fn default_hard_threshold() -> f64 {
    DEFAULT_HARD_THRESHOLD
}

fn default_drain_deadline_secs() -> u64 {
    DEFAULT_DRAIN_DEADLINE_SECS
}

fn default_open_defer_limit() -> u32 {
    DEFAULT_OPEN_DEFER_LIMIT
}

fn default_acquire_timeout_ms() -> u64 {
    DEFAULT_ACQUIRE_TIMEOUT_MS
}

fn default_breaker_max_failures() -> u32 {
    5
}

fn default_breaker_reset_timeout_secs() -> u64 {
    30
}

fn default_limiter_capacity() -> u64 {
    1_000
}

fn default_limiter_refill_rate() -> f64 {
    500.0
}

fn default_limiter_min_refill() -> f64 {
    10.0
}

fn default_limiter_adjust_interval_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_file_max_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_file_max_age_secs() -> u64 {
    24 * 60 * 60
}

fn default_file_max_files() -> usize {
    10
}

fn default_positions_flush_interval_secs() -> u64 {
    5
}

fn default_positions_flush_batch_size() -> usize {
    1_000
}

fn default_checkpoint_interval_secs() -> u64 {
    5 * 60
}

fn default_max_checkpoints() -> usize {
    10
}

fn default_buffer_max_file_size() -> u64 {
    100 * 1024 * 1024
}

fn default_buffer_max_total_size() -> u64 {
    1024 * 1024 * 1024
}

fn default_buffer_max_files() -> usize {
    50
}

fn default_buffer_sync_interval_secs() -> u64 {
    5
}

fn default_buffer_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_dlq_segment_max_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_dlq_total_max_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_dedup_cache_capacity() -> usize {
    100_000
}

fn default_dedup_ttl_secs() -> u64 {
    60
}

fn default_origin_glob() -> String {
    "*".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn minimal_toml(dir: &str) -> String {
        format!(
            r#"
            [positions]
            base_dir = "{dir}/positions"

            [disk_buffer]
            base_dir = "{dir}/buffer"

            [dlq]
            base_dir = "{dir}/dlq"

            [sinks.loki]
            type = "line-protocol-http"
            endpoint = "http://localhost:3100/loki/api/v1/push"
            compression = "gzip"
            "#
        )
    }

    #[test]
    fn minimal_document_parses_with_defaults() {
        let config = Config::from_toml_str(&minimal_toml("/tmp/logship")).unwrap();
        assert_eq!(config.dispatcher.queue_size, DEFAULT_QUEUE_SIZE);
        assert_eq!(config.dispatcher.max_batch_records, DEFAULT_MAX_BATCH_RECORDS);
        assert_eq!(config.deduplication.cache_capacity, 100_000);
        assert_eq!(config.deduplication.ttl(), Duration::from_secs(60));
        assert!(config.dispatcher.worker_count >= 1);

        let loki = &config.sinks["loki"];
        assert_eq!(loki.kind, SinkKind::LineProtocolHttp);
        assert_eq!(loki.compression, Compression::Gzip);
        assert_eq!(loki.circuit_breaker.max_failures, 5);
        assert_eq!(loki.circuit_breaker.reset_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn http_sink_without_endpoint_is_fatal() {
        let raw = r#"
            [positions]
            base_dir = "/tmp/p"
            [disk_buffer]
            base_dir = "/tmp/b"
            [dlq]
            base_dir = "/tmp/d"
            [sinks.bad]
            type = "line-protocol-http"
        "#;
        let err = Config::from_toml_str(raw).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FatalInit);
    }

    #[test]
    fn thresholds_must_be_ordered() {
        let mut config = Config::from_toml_str(&minimal_toml("/tmp/x")).unwrap();
        config.dispatcher.soft_threshold = 0.95;
        config.dispatcher.hard_threshold = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_filter_pattern_is_fatal() {
        let mut config = Config::from_toml_str(&minimal_toml("/tmp/x")).unwrap();
        config.submit_filters.push(SubmitFilter {
            label: "source".into(),
            pattern: "(unclosed".into(),
        });
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::FatalInit);
    }
}
