//! Probabilistic membership index over stored object digests.
//!
//! A negative answer from [`BloomFilter::might_contain`] is definitive; a
//! positive one must be confirmed against the record store. The filter
//! never deletes, so removals require [`MembershipIndex::rebuild`].
//!
//! Persisted state is a single blob: the `DSBF` magic, a little-endian
//! format version, then a bincode body holding the sizing parameters and
//! the compressed bit array. Anything that fails to parse is reported as
//! [`DedupError::CorruptIndexState`] and answered by a rebuild.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::compression::{compress_with_stats, decompress, CompressionAlgorithm, CompressionStats};
use crate::digest::ContentDigest;
use crate::error::{DedupError, DedupResult};
use crate::records::RecordStore;

/// Blob magic.
pub const INDEX_MAGIC: &[u8; 4] = b"DSBF";
/// Current blob format version.
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Membership index configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Number of digests the filter is sized for (default 10 000).
    pub expected_items: u64,
    /// Target false-positive rate at `expected_items` (default 0.01).
    pub false_positive_rate: f64,
    /// Codec for the persisted bit array.
    pub compression: CompressionAlgorithm,
    /// Persist the blob after every newly stored object.
    pub persist_on_insert: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            expected_items: 10_000,
            false_positive_rate: 0.01,
            compression: CompressionAlgorithm::default(),
            persist_on_insert: true,
        }
    }
}

/// Filter statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloomStats {
    /// Bits in the filter (m)
    pub size_bits: u64,
    /// Hash functions (k)
    pub hash_count: u32,
    /// Digests added (n)
    pub item_count: u64,
    /// Bits currently set
    pub bits_set: u64,
    /// bits_set / size_bits
    pub fill_ratio: f64,
    /// (1 - e^(-kn/m))^k
    pub estimated_false_positive_rate: f64,
    /// n recovered from the fill ratio
    pub estimated_item_count: u64,
}

/// Classic Bloom filter keyed by content digests.
#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    hash_count: u32,
    item_count: u64,
}

/// m = ceil(-n ln p / (ln 2)^2)
pub fn optimal_num_bits(expected_items: u64, fp_rate: f64) -> u64 {
    let n = expected_items.max(1) as f64;
    let ln2 = std::f64::consts::LN_2;
    ((-n * fp_rate.ln()) / (ln2 * ln2)).ceil().max(8.0) as u64
}

/// k = round(m / n * ln 2), at least 1
pub fn optimal_hash_count(num_bits: u64, expected_items: u64) -> u32 {
    let n = expected_items.max(1) as f64;
    ((num_bits as f64 / n) * std::f64::consts::LN_2)
        .round()
        .max(1.0) as u32
}

impl BloomFilter {
    /// Filter sized for `expected_items` at false-positive rate `fp_rate`.
    pub fn with_rate(expected_items: u64, fp_rate: f64) -> DedupResult<Self> {
        if !(fp_rate > 0.0 && fp_rate < 1.0) {
            return Err(DedupError::InvalidConfig(format!(
                "false positive rate must be in (0, 1), got {fp_rate}"
            )));
        }
        let m = optimal_num_bits(expected_items, fp_rate);
        let k = optimal_hash_count(m, expected_items);
        Ok(Self::with_params(m, k))
    }

    /// Filter with explicit size and hash count.
    pub fn with_params(num_bits: u64, hash_count: u32) -> Self {
        let num_bits = num_bits.max(8);
        Self {
            bits: vec![0u8; num_bits.div_ceil(8) as usize],
            num_bits,
            hash_count: hash_count.max(1),
            item_count: 0,
        }
    }

    fn positions<'a>(&'a self, digest: &'a ContentDigest) -> impl Iterator<Item = u64> + 'a {
        (0..self.hash_count).map(move |seed| {
            let mut h = blake3::Hasher::new();
            h.update(&seed.to_le_bytes());
            h.update(digest.as_bytes());
            let out = h.finalize();
            let mut word = [0u8; 8];
            word.copy_from_slice(&out.as_bytes()[..8]);
            u64::from_le_bytes(word) % self.num_bits
        })
    }

    fn bit(&self, pos: u64) -> bool {
        self.bits[(pos / 8) as usize] & (1 << (pos % 8)) != 0
    }

    /// Insert a digest. Returns true if at least one bit flipped, i.e. the digest was definitely new.
    pub fn add(&mut self, digest: &ContentDigest) -> bool {
        let positions: Vec<u64> = self.positions(digest).collect();
        let mut changed = false;
        for pos in positions {
            let byte = &mut self.bits[(pos / 8) as usize];
            let mask = 1u8 << (pos % 8);
            if *byte & mask == 0 {
                *byte |= mask;
                changed = true;
            }
        }
        self.item_count += 1;
        changed
    }

    /// False means never added. True means possibly added.
    pub fn might_contain(&self, digest: &ContentDigest) -> bool {
        self.positions(digest).all(|p| self.bit(p))
    }

    /// Size in bits.
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    /// Hash function count.
    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Number of `add` calls.
    pub fn item_count(&self) -> u64 {
        self.item_count
    }

    /// Popcount of the bit array.
    pub fn bits_set(&self) -> u64 {
        self.bits.iter().map(|b| b.count_ones() as u64).sum()
    }

    /// Fraction of bits set.
    pub fn fill_ratio(&self) -> f64 {
        self.bits_set() as f64 / self.num_bits as f64
    }

    /// Expected false-positive probability at the current item count.
    pub fn estimated_false_positive_rate(&self) -> f64 {
        let k = self.hash_count as f64;
        let exponent = -k * self.item_count as f64 / self.num_bits as f64;
        (1.0 - exponent.exp()).powf(k)
    }

    /// n ≈ -(m/k) ln(1 - X/m), where X is the number of set bits.
    pub fn estimated_item_count(&self) -> u64 {
        let m = self.num_bits as f64;
        let x = self.bits_set() as f64;
        if x >= m {
            return self.item_count.max(self.num_bits);
        }
        (-(m / self.hash_count as f64) * (1.0 - x / m).ln()).round() as u64
    }

    /// Reset every bit.
    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = 0);
        self.item_count = 0;
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> BloomStats {
        let bits_set = self.bits_set();
        BloomStats {
            size_bits: self.num_bits,
            hash_count: self.hash_count,
            item_count: self.item_count,
            bits_set,
            fill_ratio: bits_set as f64 / self.num_bits as f64,
            estimated_false_positive_rate: self.estimated_false_positive_rate(),
            estimated_item_count: self.estimated_item_count(),
        }
    }

    /// Serialize to a versioned, compressed blob.
    pub fn to_blob(&self, algo: CompressionAlgorithm) -> DedupResult<(Vec<u8>, CompressionStats)> {
        let (compressed, stats) = compress_with_stats(&self.bits, algo)?;
        let body = IndexBlobBody {
            num_bits: self.num_bits,
            hash_count: self.hash_count,
            item_count: self.item_count,
            compression: algo,
            bits: compressed,
        };
        let mut blob = Vec::with_capacity(8 + body.bits.len() + 32);
        blob.extend_from_slice(INDEX_MAGIC);
        blob.extend_from_slice(&INDEX_FORMAT_VERSION.to_le_bytes());
        bincode::serialize_into(&mut blob, &body)?;
        Ok((blob, stats))
    }

    /// Parse a blob written by [`Self::to_blob`].
    pub fn from_blob(blob: &[u8]) -> DedupResult<Self> {
        if blob.len() < 8 || &blob[..4] != INDEX_MAGIC {
            return Err(DedupError::CorruptIndexState("missing magic".into()));
        }
        let mut ver = [0u8; 4];
        ver.copy_from_slice(&blob[4..8]);
        let version = u32::from_le_bytes(ver);
        if version != INDEX_FORMAT_VERSION {
            return Err(DedupError::CorruptIndexState(format!(
                "unsupported format version {version}"
            )));
        }
        let body: IndexBlobBody = bincode::deserialize(&blob[8..])
            .map_err(|e| DedupError::CorruptIndexState(format!("body: {e}")))?;
        if body.num_bits == 0 || body.hash_count == 0 {
            return Err(DedupError::CorruptIndexState("zero-sized filter".into()));
        }
        let bits = decompress(&body.bits, body.compression)
            .map_err(|e| DedupError::CorruptIndexState(e.to_string()))?;
        if bits.len() as u64 != body.num_bits.div_ceil(8) {
            return Err(DedupError::CorruptIndexState(format!(
                "bit array is {} bytes, expected {}",
                bits.len(),
                body.num_bits.div_ceil(8)
            )));
        }
        Ok(Self {
            bits,
            num_bits: body.num_bits,
            hash_count: body.hash_count,
            item_count: body.item_count,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct IndexBlobBody {
    num_bits: u64,
    hash_count: u32,
    item_count: u64,
    compression: CompressionAlgorithm,
    #[serde(with = "serde_bytes")]
    bits: Vec<u8>,
}

/// How the index came up at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexLoadOutcome {
    /// Persisted state parsed cleanly
    Loaded {
        /// Items recorded in the blob
        items: u64,
    },
    /// State was rebuilt from the record store
    Rebuilt {
        /// Digests re-added
        items: u64,
        /// Why the persisted state was not used
        reason: String,
    },
}

/// Index statistics including persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    /// Filter statistics
    pub filter: BloomStats,
    /// Sizes from the last persist
    pub last_persist: CompressionStats,
    /// Number of full rebuilds
    pub rebuilds: u64,
}

/// Thread-safe membership index with persistence and rebuild.
pub struct MembershipIndex {
    filter: RwLock<BloomFilter>,
    config: IndexConfig,
    last_persist: Mutex<CompressionStats>,
    rebuilds: AtomicU64,
}

impl MembershipIndex {
    /// Empty index sized from config.
    pub fn new(config: IndexConfig) -> DedupResult<Self> {
        let filter = BloomFilter::with_rate(config.expected_items, config.false_positive_rate)?;
        Ok(Self {
            filter: RwLock::new(filter),
            config,
            last_persist: Mutex::new(CompressionStats::default()),
            rebuilds: AtomicU64::new(0),
        })
    }

    /// Load persisted state, rebuilding from `records` if it is missing, unreadable or
    /// lacks any stored object digest.
    pub fn load_or_rebuild(
        config: IndexConfig,
        records: &dyn RecordStore,
    ) -> DedupResult<(Self, IndexLoadOutcome)> {
        let index = Self::new(config)?;
        let reason = match records.load_index_state()? {
            None => "no persisted state".to_string(),
            Some(blob) => match BloomFilter::from_blob(&blob) {
                Ok(filter) => {
                    let digests = records.list_object_digests()?;
                    let missing = digests.iter().filter(|d| !filter.might_contain(d)).count();
                    if missing == 0 {
                        let items = filter.item_count();
                        info!(items, bits = filter.num_bits(), "loaded membership index");
                        *index.filter.write() = filter;
                        return Ok((index, IndexLoadOutcome::Loaded { items }));
                    }
                    warn!(missing, stored = digests.len(), "membership index is stale, rebuilding");
                    format!("index misses {} of {} stored objects", missing, digests.len())
                }
                Err(e) => {
                    warn!(error = %e, "membership index unreadable, rebuilding");
                    e.to_string()
                }
            },
        };
        let items = index.rebuild(records)?;
        index.persist(records)?;
        Ok((index, IndexLoadOutcome::Rebuilt { items, reason }))
    }

    /// Record a digest.
    pub fn add(&self, digest: &ContentDigest) -> bool {
        self.filter.write().add(digest)
    }

    /// Fast negative check.
    pub fn might_contain(&self, digest: &ContentDigest) -> bool {
        self.filter.read().might_contain(digest)
    }

    /// Replace the filter with one built from every stored object digest.
    pub fn rebuild(&self, records: &dyn RecordStore) -> DedupResult<u64> {
        let digests = records.list_object_digests()?;
        let expected = self.config.expected_items.max(digests.len() as u64);
        let mut fresh = BloomFilter::with_rate(expected, self.config.false_positive_rate)?;
        for d in &digests {
            fresh.add(d);
        }
        *self.filter.write() = fresh;
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
        info!(items = digests.len(), "rebuilt membership index");
        Ok(digests.len() as u64)
    }

    /// Write the current filter to the record store.
    pub fn persist(&self, records: &dyn RecordStore) -> DedupResult<CompressionStats> {
        let (blob, stats) = self.filter.read().to_blob(self.config.compression)?;
        records.save_index_state(blob)?;
        *self.last_persist.lock() = stats;
        debug!(
            raw = stats.raw_bytes,
            compressed = stats.compressed_bytes,
            "persisted membership index"
        );
        Ok(stats)
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> IndexStats {
        IndexStats {
            filter: self.filter.read().stats(),
            last_persist: *self.last_persist.lock(),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::MemoryRecordStore;
    use proptest::prelude::*;

    fn digest(i: u64) -> ContentDigest {
        ContentDigest::of(&i.to_le_bytes())
    }

    #[test]
    fn test_sizing_matches_formula() {
        assert_eq!(optimal_num_bits(10_000, 0.01), 95_851);
        assert_eq!(optimal_hash_count(95_851, 10_000), 7);
        let f = BloomFilter::with_rate(10_000, 0.01).unwrap();
        assert_eq!(f.num_bits(), 95_851);
        assert_eq!(f.hash_count(), 7);
    }

    #[test]
    fn test_invalid_rate_rejected() {
        assert!(BloomFilter::with_rate(10, 0.0).is_err());
        assert!(BloomFilter::with_rate(10, 1.0).is_err());
    }

    #[test]
    fn test_add_reports_new() {
        let mut f = BloomFilter::with_rate(100, 0.01).unwrap();
        assert!(f.add(&digest(1)));
        assert!(!f.add(&digest(1)));
        assert_eq!(f.item_count(), 2);
    }

    #[test]
    fn test_false_positive_rate_near_target() {
        let mut f = BloomFilter::with_rate(5_000, 0.01).unwrap();
        for i in 0..5_000 {
            f.add(&digest(i));
        }
        let trials = 20_000u64;
        let fps = (1_000_000..1_000_000 + trials)
            .filter(|i| f.might_contain(&digest(*i)))
            .count();
        let rate = fps as f64 / trials as f64;
        assert!(rate < 0.03, "observed fp rate {rate}");
        let est = f.estimated_false_positive_rate();
        assert!(est > 0.005 && est < 0.02, "estimate {est}");
    }

    #[test]
    fn test_estimated_item_count_close() {
        let mut f = BloomFilter::with_rate(1_000, 0.01).unwrap();
        for i in 0..500 {
            f.add(&digest(i));
        }
        let est = f.estimated_item_count() as f64;
        assert!((est - 500.0).abs() < 50.0, "estimate {est}");
    }

    #[test]
    fn test_blob_roundtrip_each_codec() {
        let mut f = BloomFilter::with_rate(1_000, 0.01).unwrap();
        for i in 0..100 {
            f.add(&digest(i));
        }
        for algo in [
            CompressionAlgorithm::None,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zstd { level: 6 },
        ] {
            let (blob, _) = f.to_blob(algo).unwrap();
            assert_eq!(BloomFilter::from_blob(&blob).unwrap(), f);
        }
    }

    #[test]
    fn test_version_mismatch_is_corrupt() {
        let f = BloomFilter::with_rate(100, 0.01).unwrap();
        let (mut blob, _) = f.to_blob(CompressionAlgorithm::default()).unwrap();
        blob[4] = 99;
        assert!(matches!(
            BloomFilter::from_blob(&blob),
            Err(DedupError::CorruptIndexState(_))
        ));
        assert!(matches!(
            BloomFilter::from_blob(b"junk"),
            Err(DedupError::CorruptIndexState(_))
        ));
    }

    #[test]
    fn test_truncated_body_is_corrupt() {
        let f = BloomFilter::with_rate(100, 0.01).unwrap();
        let (blob, _) = f.to_blob(CompressionAlgorithm::default()).unwrap();
        let cut = &blob[..blob.len() - 5];
        assert!(matches!(
            BloomFilter::from_blob(cut),
            Err(DedupError::CorruptIndexState(_))
        ));
    }

    #[test]
    fn test_load_or_rebuild_paths() {
        let records = MemoryRecordStore::new();
        let (index, outcome) =
            MembershipIndex::load_or_rebuild(IndexConfig::default(), &records).unwrap();
        assert!(matches!(outcome, IndexLoadOutcome::Rebuilt { items: 0, .. }));
        index.add(&digest(7));
        index.persist(&records).unwrap();

        let (reloaded, outcome) =
            MembershipIndex::load_or_rebuild(IndexConfig::default(), &records).unwrap();
        assert_eq!(outcome, IndexLoadOutcome::Loaded { items: 1 });
        assert!(reloaded.might_contain(&digest(7)));

        records.save_index_state(b"DSBF\x01\x00\x00\x00garbage".to_vec()).unwrap();
        let (_, outcome) =
            MembershipIndex::load_or_rebuild(IndexConfig::default(), &records).unwrap();
        assert!(matches!(outcome, IndexLoadOutcome::Rebuilt { .. }));
        assert!(BloomFilter::from_blob(&records.load_index_state().unwrap().unwrap()).is_ok());
    }

    proptest! {
        #[test]
        fn prop_no_false_negatives(items in prop::collection::vec(any::<u64>(), 1..300)) {
            let mut f = BloomFilter::with_rate(300, 0.01).unwrap();
            for i in &items {
                f.add(&digest(*i));
            }
            for i in &items {
                prop_assert!(f.might_contain(&digest(*i)));
            }
        }
    }
}
