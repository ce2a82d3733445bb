//! Per-origin transform chains, applied on the submit path before
//! deduplication fingerprints are computed.
//!
//! A chain is an ordered list of declarative steps. A failing step (bad
//! JSON, unknown severity value) logs at most once per origin per minute
//! and passes the record through unchanged; only `drop_if_match` removes a
//! record.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use regex::Regex;

use crate::{
    config::{PipelineConfig, PipelineStepConfig},
    error::{Error, Result},
    event::{Record, Severity},
    internal_events::PipelineStepFailed,
};

const FAILURE_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    Continue,
    Drop,
}

enum Step {
    LabelSet { key: String, value: String },
    LabelRename { from: String, to: String },
    LabelDrop { key: String },
    JsonParseIntoLabels { fields: Vec<String> },
    DropIfMatch { pattern: Regex },
    SeverityRemap { from_label: String },
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Step::LabelSet { .. } => "label_set",
            Step::LabelRename { .. } => "label_rename",
            Step::LabelDrop { .. } => "label_drop",
            Step::JsonParseIntoLabels { .. } => "json_parse_into_labels",
            Step::DropIfMatch { .. } => "drop_if_match",
            Step::SeverityRemap { .. } => "severity_remap",
        }
    }

    fn compile(config: &PipelineStepConfig) -> Result<Step> {
        Ok(match config {
            PipelineStepConfig::LabelSet { key, value } => Step::LabelSet {
                key: key.clone(),
                value: value.clone(),
            },
            PipelineStepConfig::LabelRename { from, to } => Step::LabelRename {
                from: from.clone(),
                to: to.clone(),
            },
            PipelineStepConfig::LabelDrop { key } => Step::LabelDrop { key: key.clone() },
            PipelineStepConfig::JsonParseIntoLabels { fields } => Step::JsonParseIntoLabels {
                fields: fields.clone(),
            },
            PipelineStepConfig::DropIfMatch { pattern } => Step::DropIfMatch {
                pattern: Regex::new(pattern).map_err(|e| Error::InvalidConfig {
                    reason: format!("bad drop_if_match pattern '{pattern}': {e}"),
                })?,
            },
            PipelineStepConfig::SeverityRemap { from_label } => Step::SeverityRemap {
                from_label: from_label.clone(),
            },
        })
    }

    /// Applies the step. `Err` carries the failure description for the
    /// rate-limited log; the record is left as it was.
    fn apply(&self, record: &mut Record) -> std::result::Result<Disposition, String> {
        match self {
            Step::LabelSet { key, value } => {
                record.set_label(key, value.clone());
                Ok(Disposition::Continue)
            }
            Step::LabelRename { from, to } => {
                record.rename_label(from, to);
                Ok(Disposition::Continue)
            }
            Step::LabelDrop { key } => {
                record.drop_label(key);
                Ok(Disposition::Continue)
            }
            Step::JsonParseIntoLabels { fields } => {
                let parsed: serde_json::Value = serde_json::from_slice(&record.payload)
                    .map_err(|e| format!("payload is not JSON: {e}"))?;
                let object = parsed
                    .as_object()
                    .ok_or_else(|| "payload is not a JSON object".to_string())?;
                for field in fields {
                    if let Some(value) = object.get(field) {
                        let rendered = match value {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        record.set_label(field, rendered);
                    }
                }
                Ok(Disposition::Continue)
            }
            Step::DropIfMatch { pattern } => {
                let line = String::from_utf8_lossy(&record.payload);
                if pattern.is_match(&line) {
                    Ok(Disposition::Drop)
                } else {
                    Ok(Disposition::Continue)
                }
            }
            Step::SeverityRemap { from_label } => {
                let value = record
                    .labels()
                    .get(from_label)
                    .cloned()
                    .ok_or_else(|| format!("label '{from_label}' is not set"))?;
                let severity = Severity::parse(&value)
                    .ok_or_else(|| format!("'{value}' is not a severity"))?;
                record.severity = severity;
                Ok(Disposition::Continue)
            }
        }
    }
}

struct Chain {
    matcher: glob::Pattern,
    steps: Vec<Step>,
}

pub struct Pipeline {
    chains: Vec<Chain>,
    /// (origin id, step name) -> last failure log time.
    failure_log: Mutex<HashMap<(String, &'static str), Instant>>,
}

impl Pipeline {
    pub fn new(configs: &[PipelineConfig]) -> Result<Pipeline> {
        let mut chains = Vec::with_capacity(configs.len());
        for config in configs {
            let matcher =
                glob::Pattern::new(&config.origin_glob).map_err(|e| Error::InvalidConfig {
                    reason: format!("bad origin glob '{}': {e}", config.origin_glob),
                })?;
            let steps = config
                .steps
                .iter()
                .map(Step::compile)
                .collect::<Result<Vec<_>>>()?;
            chains.push(Chain { matcher, steps });
        }
        Ok(Pipeline {
            chains,
            failure_log: Mutex::new(HashMap::new()),
        })
    }

    /// Runs every matching chain over the record, in configuration order.
    pub fn process(&self, record: &mut Record) -> Disposition {
        for chain in &self.chains {
            if !chain.matcher.matches(record.origin.id()) {
                continue;
            }
            for step in &chain.steps {
                match step.apply(record) {
                    Ok(Disposition::Continue) => {}
                    Ok(Disposition::Drop) => return Disposition::Drop,
                    Err(reason) => self.log_failure(record, step.name(), reason),
                }
            }
        }
        Disposition::Continue
    }

    /// Emits the step-failure event at most once per origin per minute.
    fn log_failure(&self, record: &Record, step: &'static str, reason: String) {
        let key = (record.origin.id().to_string(), step);
        let mut log = self.failure_log.lock();
        let now = Instant::now();
        let due = log
            .get(&key)
            .map(|last| now.duration_since(*last) >= FAILURE_LOG_INTERVAL)
            .unwrap_or(true);
        if due {
            log.insert(key, now);
            PipelineStepFailed {
                origin: record.origin.id(),
                step,
                error: reason,
            }
            .emit();
        }
    }
}
