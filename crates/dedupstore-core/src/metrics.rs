//! Prometheus-compatible counters for the dedup engine.
//!
//! Every counter is an `AtomicU64` updated with relaxed ordering so hot
//! paths never take a lock. [`DedupMetrics::collect`] renders them as named
//! metrics, [`DedupMetrics::snapshot`] as a serialisable struct.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The type of metric: counter or gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up or down.
    Gauge,
}

/// The value of a metric.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// A counter value.
    Counter(u64),
    /// A gauge value.
    Gauge(f64),
}

/// A single metric with metadata and value.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupMetric {
    /// The metric name.
    pub name: String,
    /// Help text describing the metric.
    pub help: String,
    /// The kind of metric.
    pub kind: MetricKind,
    /// The metric value.
    pub value: MetricValue,
}

impl DedupMetric {
    fn counter(name: &str, help: &str, v: u64) -> Self {
        Self {
            name: format!("dedupstore_{name}"),
            help: help.to_string(),
            kind: MetricKind::Counter,
            value: MetricValue::Counter(v),
        }
    }

    fn gauge(name: &str, help: &str, v: f64) -> Self {
        Self {
            name: format!("dedupstore_{name}"),
            help: help.to_string(),
            kind: MetricKind::Gauge,
            value: MetricValue::Gauge(v),
        }
    }
}

/// Thread-safe engine counters.
#[derive(Default)]
pub struct DedupMetrics {
    uploads: AtomicU64,
    duplicate_uploads: AtomicU64,
    unique_objects: AtomicU64,
    bytes_uploaded: AtomicU64,
    bytes_saved: AtomicU64,
    index_negatives: AtomicU64,
    index_false_positives: AtomicU64,
    encrypt_ops: AtomicU64,
    encrypt_bytes: AtomicU64,
    encrypt_nanos: AtomicU64,
    decrypt_ops: AtomicU64,
    decrypt_nanos: AtomicU64,
    integrity_failures: AtomicU64,
    challenges_issued: AtomicU64,
    verify_ops: AtomicU64,
    verify_failures: AtomicU64,
    verify_nanos: AtomicU64,
    key_rotations: AtomicU64,
    kek_nodes_updated: AtomicU64,
    blocks_new: AtomicU64,
    blocks_deduplicated: AtomicU64,
    block_bytes_saved: AtomicU64,
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

fn avg_millis(total_nanos: u64, ops: u64) -> f64 {
    if ops == 0 {
        0.0
    } else {
        total_nanos as f64 / ops as f64 / 1_000_000.0
    }
}

impl DedupMetrics {
    /// All counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// An upload of `bytes` arrived.
    #[inline]
    pub fn record_upload(&self, bytes: u64) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// An upload matched an existing object.
    #[inline]
    pub fn record_duplicate(&self, bytes_saved: u64) {
        self.duplicate_uploads.fetch_add(1, Ordering::Relaxed);
        self.bytes_saved.fetch_add(bytes_saved, Ordering::Relaxed);
    }

    /// A new object was stored.
    #[inline]
    pub fn record_unique_object(&self) {
        self.unique_objects.fetch_add(1, Ordering::Relaxed);
    }

    /// The membership index answered "definitely absent".
    #[inline]
    pub fn record_index_negative(&self) {
        self.index_negatives.fetch_add(1, Ordering::Relaxed);
    }

    /// The membership index said "maybe" but the record store had nothing.
    #[inline]
    pub fn record_index_false_positive(&self) {
        self.index_false_positives.fetch_add(1, Ordering::Relaxed);
    }

    /// An encryption finished.
    #[inline]
    pub fn record_encrypt(&self, bytes: u64, elapsed: Duration) {
        self.encrypt_ops.fetch_add(1, Ordering::Relaxed);
        self.encrypt_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.encrypt_nanos.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    /// A decryption finished.
    #[inline]
    pub fn record_decrypt(&self, elapsed: Duration) {
        self.decrypt_ops.fetch_add(1, Ordering::Relaxed);
        self.decrypt_nanos.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    /// Decrypted bytes failed the digest check.
    #[inline]
    pub fn record_integrity_failure(&self) {
        self.integrity_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A proof-of-ownership challenge was issued.
    #[inline]
    pub fn record_challenge(&self) {
        self.challenges_issued.fetch_add(1, Ordering::Relaxed);
    }

    /// A proof was checked.
    #[inline]
    pub fn record_verification(&self, success: bool, elapsed: Duration) {
        self.verify_ops.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.verify_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.verify_nanos.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    /// KEK rotations were applied, touching `nodes` tree nodes.
    #[inline]
    pub fn record_key_rotation(&self, rotations: u64, nodes: u64) {
        self.key_rotations.fetch_add(rotations, Ordering::Relaxed);
        self.kek_nodes_updated.fetch_add(nodes, Ordering::Relaxed);
    }

    /// Block-level store outcome.
    #[inline]
    pub fn record_blocks(&self, new: u64, deduplicated: u64, bytes_saved: u64) {
        self.blocks_new.fetch_add(new, Ordering::Relaxed);
        self.blocks_deduplicated
            .fetch_add(deduplicated, Ordering::Relaxed);
        self.block_bytes_saved
            .fetch_add(bytes_saved, Ordering::Relaxed);
    }

    /// Duplicate uploads / all uploads. Returns 0.0 before the first upload.
    pub fn dedup_ratio(&self) -> f64 {
        let uploads = self.uploads.load(Ordering::Relaxed);
        if uploads == 0 {
            0.0
        } else {
            self.duplicate_uploads.load(Ordering::Relaxed) as f64 / uploads as f64
        }
    }

    /// Point-in-time snapshot of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        let uploads = load(&self.uploads);
        let bytes_uploaded = load(&self.bytes_uploaded);
        let bytes_saved = load(&self.bytes_saved);
        let encrypt_ops = load(&self.encrypt_ops);
        let decrypt_ops = load(&self.decrypt_ops);
        let verify_ops = load(&self.verify_ops);
        MetricsSnapshot {
            uploads,
            duplicate_uploads: load(&self.duplicate_uploads),
            unique_objects: load(&self.unique_objects),
            bytes_uploaded,
            bytes_saved,
            index_negatives: load(&self.index_negatives),
            index_false_positives: load(&self.index_false_positives),
            encrypt_ops,
            encrypt_bytes: load(&self.encrypt_bytes),
            decrypt_ops,
            integrity_failures: load(&self.integrity_failures),
            challenges_issued: load(&self.challenges_issued),
            verify_ops,
            verify_failures: load(&self.verify_failures),
            key_rotations: load(&self.key_rotations),
            kek_nodes_updated: load(&self.kek_nodes_updated),
            blocks_new: load(&self.blocks_new),
            blocks_deduplicated: load(&self.blocks_deduplicated),
            block_bytes_saved: load(&self.block_bytes_saved),
            dedup_ratio: self.dedup_ratio(),
            space_savings: if bytes_uploaded == 0 {
                0.0
            } else {
                bytes_saved as f64 / bytes_uploaded as f64
            },
            avg_encrypt_ms: avg_millis(load(&self.encrypt_nanos), encrypt_ops),
            avg_decrypt_ms: avg_millis(load(&self.decrypt_nanos), decrypt_ops),
            avg_verify_ms: avg_millis(load(&self.verify_nanos), verify_ops),
        }
    }

    /// Collect all metrics for a Prometheus exposition.
    pub fn collect(&self) -> Vec<DedupMetric> {
        let s = self.snapshot();
        vec![
            DedupMetric::counter("uploads_total", "Uploads received", s.uploads),
            DedupMetric::counter(
                "duplicate_uploads_total",
                "Uploads that matched an existing object",
                s.duplicate_uploads,
            ),
            DedupMetric::counter("unique_objects_total", "Objects physically stored", s.unique_objects),
            DedupMetric::counter("bytes_uploaded_total", "Plaintext bytes received", s.bytes_uploaded),
            DedupMetric::counter("bytes_saved_total", "Plaintext bytes not stored due to dedup", s.bytes_saved),
            DedupMetric::counter(
                "index_negatives_total",
                "Lookups answered by the membership index alone",
                s.index_negatives,
            ),
            DedupMetric::counter(
                "index_false_positives_total",
                "Membership index positives not confirmed by the record store",
                s.index_false_positives,
            ),
            DedupMetric::counter("encrypt_ops_total", "Payload encryptions", s.encrypt_ops),
            DedupMetric::counter("decrypt_ops_total", "Payload decryptions", s.decrypt_ops),
            DedupMetric::counter(
                "integrity_failures_total",
                "Reads whose plaintext failed the digest check",
                s.integrity_failures,
            ),
            DedupMetric::counter("challenges_issued_total", "Ownership challenges issued", s.challenges_issued),
            DedupMetric::counter("proof_verifications_total", "Ownership proofs checked", s.verify_ops),
            DedupMetric::counter("proof_failures_total", "Ownership proofs rejected", s.verify_failures),
            DedupMetric::counter("key_rotations_total", "KEK rotations applied", s.key_rotations),
            DedupMetric::counter("kek_nodes_updated_total", "KEK nodes re-keyed", s.kek_nodes_updated),
            DedupMetric::counter("blocks_new_total", "Blocks written", s.blocks_new),
            DedupMetric::counter(
                "blocks_deduplicated_total",
                "Blocks matched to an existing block",
                s.blocks_deduplicated,
            ),
            DedupMetric::gauge("dedup_ratio", "Duplicate uploads / uploads", s.dedup_ratio),
            DedupMetric::gauge("avg_encrypt_ms", "Mean encryption time", s.avg_encrypt_ms),
            DedupMetric::gauge("avg_verify_ms", "Mean proof verification time", s.avg_verify_ms),
        ]
    }
}

/// A point-in-time snapshot of all engine counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Uploads received.
    pub uploads: u64,
    /// Uploads that matched an existing object.
    pub duplicate_uploads: u64,
    /// Objects physically stored.
    pub unique_objects: u64,
    /// Plaintext bytes received.
    pub bytes_uploaded: u64,
    /// Plaintext bytes not stored.
    pub bytes_saved: u64,
    /// Lookups answered negatively by the index.
    pub index_negatives: u64,
    /// Index positives not confirmed.
    pub index_false_positives: u64,
    /// Encryption operations.
    pub encrypt_ops: u64,
    /// Plaintext bytes encrypted.
    pub encrypt_bytes: u64,
    /// Decryption operations.
    pub decrypt_ops: u64,
    /// Failed digest checks after decryption.
    pub integrity_failures: u64,
    /// Challenges issued.
    pub challenges_issued: u64,
    /// Proofs checked.
    pub verify_ops: u64,
    /// Proofs rejected.
    pub verify_failures: u64,
    /// KEK rotations applied.
    pub key_rotations: u64,
    /// KEK nodes re-keyed.
    pub kek_nodes_updated: u64,
    /// Blocks written.
    pub blocks_new: u64,
    /// Blocks deduplicated.
    pub blocks_deduplicated: u64,
    /// Bytes saved at block level.
    pub block_bytes_saved: u64,
    /// Duplicate uploads / uploads.
    pub dedup_ratio: f64,
    /// Bytes saved / bytes uploaded.
    pub space_savings: f64,
    /// Mean encryption time in milliseconds.
    pub avg_encrypt_ms: f64,
    /// Mean decryption time in milliseconds.
    pub avg_decrypt_ms: f64,
    /// Mean proof verification time in milliseconds.
    pub avg_verify_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_metrics_are_zero() {
        let m = DedupMetrics::new();
        let s = m.snapshot();
        assert_eq!(s.uploads, 0);
        assert_eq!(s.dedup_ratio, 0.0);
        assert_eq!(s.avg_encrypt_ms, 0.0);
    }

    #[test]
    fn test_dedup_ratio_and_savings() {
        let m = DedupMetrics::new();
        m.record_upload(100);
        m.record_unique_object();
        m.record_upload(100);
        m.record_duplicate(100);
        let s = m.snapshot();
        assert!((s.dedup_ratio - 0.5).abs() < 1e-9);
        assert!((s.space_savings - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_average_timings() {
        let m = DedupMetrics::new();
        m.record_encrypt(10, Duration::from_millis(2));
        m.record_encrypt(10, Duration::from_millis(4));
        m.record_verification(true, Duration::from_millis(1));
        m.record_verification(false, Duration::from_millis(3));
        let s = m.snapshot();
        assert!((s.avg_encrypt_ms - 3.0).abs() < 1e-6);
        assert!((s.avg_verify_ms - 2.0).abs() < 1e-6);
        assert_eq!(s.verify_failures, 1);
    }

    #[test]
    fn test_collect_names_are_prefixed() {
        let m = DedupMetrics::new();
        m.record_key_rotation(1, 3);
        let all = m.collect();
        assert!(all.iter().all(|x| x.name.starts_with("dedupstore_")));
        let nodes = all
            .iter()
            .find(|x| x.name == "dedupstore_kek_nodes_updated_total")
            .unwrap();
        assert_eq!(nodes.value, MetricValue::Counter(3));
        assert_eq!(nodes.kind, MetricKind::Counter);
    }
}
