//! Shared harness for the end-to-end dispatcher tests: a scripted mock
//! sink and a fast-timing configuration rooted in a temp directory.

use std::{
    collections::{BTreeMap, VecDeque},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;

use logship::{
    config::{CircuitBreakerConfig, Config, RateLimiterConfig, SinkConfig, SinkKind},
    event::{Batch, Cursor, Origin, Record, Severity},
    sinks::{SendResult, Sink, SinkError},
};

#[derive(Clone, Copy, Debug)]
pub enum Scripted {
    Ok,
    Transient,
    Permanent,
}

/// In-process sink with a scripted response sequence.
pub struct MockSink {
    name: String,
    script: Mutex<VecDeque<Scripted>>,
    default: Scripted,
    delay: Option<Duration>,
    invocations: AtomicU64,
    received: Mutex<Vec<Record>>,
}

impl MockSink {
    pub fn ok(name: &str) -> Arc<MockSink> {
        MockSink::scripted(name, vec![], Scripted::Ok)
    }

    pub fn scripted(name: &str, script: Vec<Scripted>, default: Scripted) -> Arc<MockSink> {
        Arc::new(MockSink {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            default,
            delay: None,
            invocations: AtomicU64::new(0),
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn slow(name: &str, delay: Duration) -> Arc<MockSink> {
        Arc::new(MockSink {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            default: Scripted::Ok,
            delay: Some(delay),
            invocations: AtomicU64::new(0),
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    #[allow(dead_code)]
    pub fn received(&self) -> Vec<Record> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sink for MockSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SinkKind {
        SinkKind::LineProtocolHttp
    }

    fn matches(&self, _record: &Record) -> bool {
        true
    }

    async fn send_batch(&self, batch: &Batch) -> SendResult {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let response = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default);
        match response {
            Scripted::Ok => {
                self.received
                    .lock()
                    .unwrap()
                    .extend(batch.records().iter().cloned());
                Ok(())
            }
            Scripted::Transient => Err(SinkError::transient("scripted 503")),
            Scripted::Permanent => Err(SinkError::permanent("scripted 400")),
        }
    }
}

/// Config rooted in `root`, with timings tightened for tests.
pub fn test_config(root: &Path) -> Config {
    let raw = format!(
        r#"
        [dispatcher]
        worker_count = 2
        queue_size = 1000
        max_batch_records = 100
        max_batch_bytes = 1048576
        max_batch_linger_ms = 50
        max_attempts = 5
        initial_backoff_ms = 10
        max_backoff_secs = 1
        drain_deadline_secs = 5
        acquire_timeout_ms = 200

        [positions]
        base_dir = "{root}/positions"
        flush_interval_secs = 1

        [disk_buffer]
        base_dir = "{root}/buffer"
        sync_interval_secs = 1

        [dlq]
        base_dir = "{root}/dlq"
        "#,
        root = root.display(),
    );
    Config::from_toml_str(&raw).expect("test config must validate")
}

/// Sink settings for registering mock sinks: limits generous enough that
/// the rate limiter never interferes unless a test wants it to.
pub fn mock_sink_config() -> SinkConfig {
    SinkConfig {
        kind: SinkKind::LineProtocolHttp,
        endpoint: Some("http://mock.invalid/push".to_string()),
        headers: BTreeMap::new(),
        request_timeout_secs: 5,
        path: None,
        max_bytes: 100 * 1024 * 1024,
        max_age_secs: 24 * 60 * 60,
        max_files: 10,
        match_labels: BTreeMap::new(),
        compression: Default::default(),
        batch: Default::default(),
        retry: Default::default(),
        circuit_breaker: CircuitBreakerConfig {
            max_failures: 5,
            reset_timeout_secs: 60,
        },
        rate_limiter: RateLimiterConfig {
            capacity: 1_000_000,
            refill_rate: 1_000_000.0,
            min_refill: 10.0,
            adjust_interval_secs: 10,
        },
    }
}

pub fn file_origin(path: &str) -> Origin {
    Origin::File {
        path: path.to_string(),
        inode: 7,
    }
}

pub fn record(origin: &Origin, cursor: u64, line: &str) -> Record {
    Record::new(
        origin.clone(),
        Cursor::Bytes(cursor),
        line.to_string(),
        Utc::now(),
        Severity::Info,
        BTreeMap::new(),
    )
}

/// Polls `predicate` until it holds or `timeout` elapses.
pub async fn wait_until(what: &str, timeout: Duration, predicate: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
