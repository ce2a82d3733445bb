//! Line-protocol HTTP sink (Loki-compatible push API).
//!
//! Records are grouped into streams by their full label set, sorted by
//! timestamp within each stream, and POSTed as the standard streams
//! payload. Connection pooling is always on: idle keep-alive with a
//! per-host cap, HTTP/1.1.

use std::{collections::BTreeMap, io::Write, time::Duration};

use async_trait::async_trait;
use flate2::{write::GzEncoder, Compression as GzLevel};
use reqwest::{header, StatusCode, Url};
use serde::Serialize;
use tracing::debug;

use crate::{
    config::{Compression, SinkConfig, SinkKind},
    error::{Error, Result},
    event::{Batch, Record},
    sinks::{labels_match, missing_field, SendResult, Sink, SinkError},
};

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 10;

#[derive(Serialize)]
struct PushRequest<'a> {
    streams: Vec<Stream<'a>>,
}

#[derive(Serialize)]
struct Stream<'a> {
    stream: &'a BTreeMap<String, String>,
    values: Vec<[String; 2]>,
}

pub struct HttpSink {
    name: String,
    endpoint: Url,
    ready_endpoint: Url,
    headers: BTreeMap<String, String>,
    compression: Compression,
    match_labels: BTreeMap<String, String>,
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(name: &str, config: &SinkConfig) -> Result<HttpSink> {
        let raw_endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| missing_field(name, "endpoint"))?;
        let endpoint = Url::parse(raw_endpoint).map_err(|e| Error::InvalidConfig {
            reason: format!("sinks.{name}: bad endpoint '{raw_endpoint}': {e}"),
        })?;
        let mut ready_endpoint = endpoint.clone();
        ready_endpoint.set_path("/ready");
        ready_endpoint.set_query(None);

        let client = reqwest::Client::builder()
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .http1_only()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::InvalidConfig {
                reason: format!("sinks.{name}: failed to build HTTP client: {e}"),
            })?;

        Ok(HttpSink {
            name: name.to_string(),
            endpoint,
            ready_endpoint,
            headers: config.headers.clone(),
            compression: config.compression,
            match_labels: config.match_labels.clone(),
            client,
        })
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SinkKind {
        SinkKind::LineProtocolHttp
    }

    fn matches(&self, record: &Record) -> bool {
        labels_match(&self.match_labels, record)
    }

    async fn send_batch(&self, batch: &Batch) -> SendResult {
        let body = encode_streams(batch)
            .map_err(|e| SinkError::permanent(format!("payload serialization failed: {e}")))?;
        let (body, encoding) = compress(body, self.compression)
            .map_err(|e| SinkError::permanent(format!("payload compression failed: {e}")))?;

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(encoding) = encoding {
            request = request.header(header::CONTENT_ENCODING, encoding);
        }
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Err(SinkError::transient(format!("request failed: {e}"))),
        };

        let status = response.status();
        if status.is_success() {
            debug!(
                message = "Push accepted.",
                sink = %self.name,
                records = %batch.len(),
                status = %status,
            );
            return Ok(());
        }
        let retry_after = parse_retry_after(response.headers());
        let detail = response.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after, &detail))
    }

    async fn healthcheck(&self) -> SendResult {
        match self.client.get(self.ready_endpoint.clone()).send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(SinkError::transient(format!(
                "readiness probe returned {}",
                response.status()
            ))),
            Err(e) => Err(SinkError::transient(format!("readiness probe failed: {e}"))),
        }
    }
}

/// Builds the streams payload: records grouped by label set, values
/// sorted by timestamp within each stream.
fn encode_streams(batch: &Batch) -> serde_json::Result<Vec<u8>> {
    let mut streams: BTreeMap<&BTreeMap<String, String>, Vec<(i64, &Record)>> = BTreeMap::new();
    for record in batch.records() {
        let nanos = record
            .timestamp
            .timestamp_nanos_opt()
            .unwrap_or_else(|| record.timestamp.timestamp_micros().saturating_mul(1_000));
        streams.entry(record.labels()).or_default().push((nanos, record));
    }

    let streams = streams
        .into_iter()
        .map(|(labels, mut values)| {
            values.sort_by_key(|(nanos, _)| *nanos);
            Stream {
                stream: labels,
                values: values
                    .into_iter()
                    .map(|(nanos, record)| {
                        [
                            nanos.to_string(),
                            String::from_utf8_lossy(&record.payload).into_owned(),
                        ]
                    })
                    .collect(),
            }
        })
        .collect();

    serde_json::to_vec(&PushRequest { streams })
}

fn compress(
    body: Vec<u8>,
    compression: Compression,
) -> std::io::Result<(Vec<u8>, Option<&'static str>)> {
    match compression {
        Compression::None => Ok((body, None)),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
            encoder.write_all(&body)?;
            Ok((encoder.finish()?, Some("gzip")))
        }
        Compression::Snappy => {
            let compressed = snap::raw::Encoder::new()
                .compress_vec(&body)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            Ok((compressed, Some("snappy")))
        }
    }
}

/// HTTP status → error class. 4xx is a rejection the server will repeat,
/// except 408 and 429 which are load conditions.
fn classify_status(status: StatusCode, retry_after: Option<Duration>, detail: &str) -> SinkError {
    let message = if detail.is_empty() {
        format!("server returned {status}")
    } else {
        format!("server returned {status}: {detail}")
    };
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        SinkError::Transient {
            message,
            retry_after,
        }
    } else {
        SinkError::Permanent { message }
    }
}

fn parse_retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Cursor, Origin, Severity};
    use chrono::{TimeZone, Utc};
    use std::io::Read;

    fn record(labels: &[(&str, &str)], nanos: i64, line: &str) -> Record {
        Record::new(
            Origin::File {
                path: "/var/log/a.log".to_string(),
                inode: 1,
            },
            Cursor::Bytes(0),
            line.to_string(),
            Utc.timestamp_nanos(nanos),
            Severity::Info,
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn streams_group_by_label_set_and_sort_by_timestamp() {
        let mut batch = Batch::new(1);
        batch.push(record(&[("app", "web")], 300, "third"));
        batch.push(record(&[("app", "web")], 100, "first"));
        batch.push(record(&[("app", "db")], 200, "other stream"));

        let body = encode_streams(&batch).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let streams = parsed["streams"].as_array().unwrap();
        assert_eq!(streams.len(), 2);

        let web = streams
            .iter()
            .find(|s| s["stream"]["app"] == "web")
            .unwrap();
        let values = web["values"].as_array().unwrap();
        assert_eq!(values[0][0], "100");
        assert_eq!(values[0][1], "first");
        assert_eq!(values[1][0], "300");
        assert_eq!(values[1][1], "third");
    }

    #[test]
    fn gzip_body_round_trips() {
        let (compressed, encoding) = compress(b"hello streams".to_vec(), Compression::Gzip).unwrap();
        assert_eq!(encoding, Some("gzip"));

        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello streams");
    }

    #[test]
    fn snappy_body_round_trips() {
        let (compressed, encoding) =
            compress(b"hello streams".to_vec(), Compression::Snappy).unwrap();
        assert_eq!(encoding, Some("snappy"));
        let out = snap::raw::Decoder::new().decompress_vec(&compressed).unwrap();
        assert_eq!(out, b"hello streams");
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, None, "").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, None, "").is_transient());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, None, "").is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, None, "").is_transient());
        assert!(!classify_status(StatusCode::UNPROCESSABLE_ENTITY, None, "").is_transient());

        let err = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(7)),
            "slow down",
        );
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }
}
