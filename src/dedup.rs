//! Content deduplication with a bounded, TTL-aware fingerprint cache.
//!
//! A fingerprint is the SHA-256 of a canonical form of the record: origin
//! id, trimmed payload, severity, and the configured subset of labels. The
//! cache suppresses a fingerprint for the TTL window after it was first
//! admitted; once the window elapses (or the entry is evicted for
//! capacity, which is counted) the same content flows again.

use std::{
    collections::{HashMap, VecDeque},
    hash::{Hash, Hasher},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::{config::DedupConfig, event::Record};

/// Canonical content hash of a record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Lower-case hex rendering, used in logs.
    pub fn to_hex(self) -> String {
        let mut out = String::with_capacity(64);
        for byte in self.0 {
            use std::fmt::Write;
            write!(out, "{byte:02x}").expect("writing to a String cannot fail");
        }
        out
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DedupOutcome {
    Fresh,
    Duplicate,
}

struct Entry {
    expires_at: Instant,
    inserted_at: Instant,
    origin_hash: u64,
}

struct Cache {
    entries: HashMap<Fingerprint, Entry>,
    /// Insertion order, used for both TTL expiry sweeps and capacity
    /// eviction. Stale order entries (superseded by a re-insert) are
    /// detected by comparing `inserted_at`.
    order: VecDeque<(Fingerprint, Instant)>,
}

/// Bounded fingerprint cache. All operations are O(1) amortised.
pub struct Deduplicator {
    enabled: bool,
    capacity: usize,
    ttl: Duration,
    fingerprint_labels: Vec<String>,
    cache: Mutex<Cache>,
    duplicates: AtomicU64,
    evictions: AtomicU64,
    admitted: AtomicU64,
}

impl Deduplicator {
    pub fn new(config: &DedupConfig) -> Deduplicator {
        Deduplicator {
            enabled: config.enabled,
            capacity: config.cache_capacity,
            ttl: config.ttl(),
            fingerprint_labels: config.fingerprint_labels.clone(),
            cache: Mutex::new(Cache {
                entries: HashMap::with_capacity(config.cache_capacity.min(16_384)),
                order: VecDeque::new(),
            }),
            duplicates: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            admitted: AtomicU64::new(0),
        }
    }

    /// Computes the canonical fingerprint for a record.
    pub fn fingerprint(&self, record: &Record) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(record.origin.id().as_bytes());
        hasher.update([0]);
        hasher.update(trim_ascii(&record.payload));
        hasher.update([0]);
        hasher.update(record.severity.as_str().as_bytes());
        for label in &self.fingerprint_labels {
            hasher.update([0]);
            hasher.update(label.as_bytes());
            hasher.update([b'=']);
            if let Some(value) = record.labels().get(label) {
                hasher.update(value.as_bytes());
            }
        }
        Fingerprint(hasher.finalize().into())
    }

    /// Checks the record against the cache and admits its fingerprint.
    ///
    /// Disabled deduplication admits everything. A fingerprint hit whose
    /// stored origin differs from this record's is treated as fresh, so a
    /// hash collision between two origins cannot suppress either of them.
    pub fn check_and_insert(&self, record: &Record) -> DedupOutcome {
        if !self.enabled {
            return DedupOutcome::Fresh;
        }
        let fingerprint = self.fingerprint(record);
        let origin_hash = hash_origin(record.origin.id());
        let now = Instant::now();

        let mut cache = self.cache.lock();
        self.sweep_expired(&mut cache, now);

        if let Some(entry) = cache.entries.get(&fingerprint) {
            if entry.expires_at > now {
                if entry.origin_hash == origin_hash {
                    self.duplicates.fetch_add(1, Ordering::Relaxed);
                    return DedupOutcome::Duplicate;
                }
                return DedupOutcome::Fresh;
            }
        }

        if cache.entries.len() >= self.capacity {
            self.evict_one(&mut cache);
        }
        cache.entries.insert(
            fingerprint,
            Entry {
                expires_at: now + self.ttl,
                inserted_at: now,
                origin_hash,
            },
        );
        cache.order.push_back((fingerprint, now));
        self.admitted.fetch_add(1, Ordering::Relaxed);
        DedupOutcome::Fresh
    }

    /// Removes expired entries from the head of the insertion order. Each
    /// call does at most a handful of pops; cost amortises to O(1) per
    /// insert.
    fn sweep_expired(&self, cache: &mut Cache, now: Instant) {
        while let Some((fingerprint, inserted_at)) = cache.order.front().copied() {
            let remove = match cache.entries.get(&fingerprint) {
                // A newer insert owns this fingerprint; the order entry is
                // stale and can be discarded without touching the map.
                Some(entry) if entry.inserted_at != inserted_at => {
                    cache.order.pop_front();
                    continue;
                }
                Some(entry) => entry.expires_at <= now,
                None => {
                    cache.order.pop_front();
                    continue;
                }
            };
            if !remove {
                break;
            }
            cache.order.pop_front();
            cache.entries.remove(&fingerprint);
        }
    }

    fn evict_one(&self, cache: &mut Cache) {
        while let Some((fingerprint, inserted_at)) = cache.order.pop_front() {
            match cache.entries.get(&fingerprint) {
                Some(entry) if entry.inserted_at == inserted_at => {
                    cache.entries.remove(&fingerprint);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                _ => continue,
            }
        }
    }

    pub fn duplicate_count(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Fraction of checks that were suppressed as duplicates.
    pub fn hit_ratio(&self) -> f64 {
        let duplicates = self.duplicates.load(Ordering::Relaxed);
        let admitted = self.admitted.load(Ordering::Relaxed);
        let total = duplicates + admitted;
        if total == 0 {
            0.0
        } else {
            duplicates as f64 / total as f64
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn hash_origin(origin_id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    origin_id.hash(&mut hasher);
    hasher.finish()
}

fn trim_ascii(payload: &[u8]) -> &[u8] {
    let start = payload
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(payload.len());
    let end = payload
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &payload[start..end]
}
