//! Block-level deduplication: fixed or content-defined chunking, per-block storage and reconstruction.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use fastcdc::v2020::FastCDC;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::backend::ObjectBackend;
use crate::digest::ContentDigest;
use crate::encryption::ConvergentCipher;
use crate::error::{DedupError, DedupResult};
use crate::metrics::DedupMetrics;
use crate::records::{BlockRecord, ObjectManifest, RecordStore};

/// Smallest minimum chunk size FastCDC accepts.
pub const CDC_MIN_FLOOR: usize = 64;
/// Smallest average chunk size FastCDC accepts.
pub const CDC_AVG_FLOOR: usize = 256;
/// Smallest maximum chunk size FastCDC accepts.
pub const CDC_MAX_FLOOR: usize = 1024;

/// How a payload is cut into blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkingStrategy {
    /// Cut every `block_size` bytes
    Fixed {
        /// Block length
        block_size: usize,
    },
    /// FastCDC boundaries clamped to [min_size, max_size]
    ContentDefined {
        /// Minimum block length
        min_size: usize,
        /// Target block length
        avg_size: usize,
        /// Maximum block length
        max_size: usize,
    },
}

impl Default for ChunkingStrategy {
    fn default() -> Self {
        Self::Fixed { block_size: 4096 }
    }
}

/// Block-level dedup configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    /// Store uploads as deduplicated blocks instead of one payload
    pub enabled: bool,
    /// Chunking strategy
    pub strategy: ChunkingStrategy,
    /// Objects smaller than this are stored whole even when enabled
    pub min_object_size: u64,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: ChunkingStrategy::default(),
            min_object_size: 0,
        }
    }
}

/// A block produced by the chunker
#[derive(Debug, Clone)]
pub struct Block {
    /// Block content
    pub data: Bytes,
    /// SHA-256 of the block content
    pub digest: ContentDigest,
    /// Byte offset of this block in the original payload
    pub offset: u64,
}

/// Splits payloads into blocks.
#[derive(Debug, Clone)]
pub struct Chunker {
    strategy: ChunkingStrategy,
}

impl Chunker {
    /// Validate the strategy and build a chunker.
    pub fn new(strategy: ChunkingStrategy) -> DedupResult<Self> {
        match strategy {
            ChunkingStrategy::Fixed { block_size } if block_size == 0 => {
                return Err(DedupError::InvalidConfig("block size must be non-zero".into()))
            }
            ChunkingStrategy::ContentDefined {
                min_size,
                avg_size,
                max_size,
            } => {
                if min_size < CDC_MIN_FLOOR || avg_size < CDC_AVG_FLOOR || max_size < CDC_MAX_FLOOR {
                    return Err(DedupError::InvalidConfig(format!(
                        "content-defined sizes must be at least {CDC_MIN_FLOOR}/{CDC_AVG_FLOOR}/{CDC_MAX_FLOOR}"
                    )));
                }
                if !(min_size <= avg_size && avg_size <= max_size) || max_size > u32::MAX as usize {
                    return Err(DedupError::InvalidConfig(
                        "content-defined sizes must satisfy min <= avg <= max".into(),
                    ));
                }
            }
            _ => {}
        }
        Ok(Self { strategy })
    }

    /// Active strategy.
    pub fn strategy(&self) -> ChunkingStrategy {
        self.strategy
    }

    /// Cut `data` into blocks. Concatenating the blocks reproduces `data`.
    pub fn chunk(&self, data: &[u8]) -> Vec<Block> {
        if data.is_empty() {
            return Vec::new();
        }
        let make = |start: usize, end: usize| {
            let bytes = Bytes::copy_from_slice(&data[start..end]);
            Block {
                digest: ContentDigest::of(&bytes),
                data: bytes,
                offset: start as u64,
            }
        };
        match self.strategy {
            ChunkingStrategy::Fixed { block_size } => (0..data.len())
                .step_by(block_size)
                .map(|start| make(start, (start + block_size).min(data.len())))
                .collect(),
            ChunkingStrategy::ContentDefined {
                min_size,
                avg_size,
                max_size,
            } => FastCDC::new(data, min_size as u32, avg_size as u32, max_size as u32)
                .map(|c| make(c.offset, c.offset + c.length))
                .collect(),
        }
    }
}

/// Outcome of [`BlockStore::store_blocks`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockStoreReport {
    /// Blocks in the payload
    pub total_blocks: u64,
    /// Blocks written to the backend
    pub new_blocks: u64,
    /// Blocks that matched an existing block
    pub deduplicated_blocks: u64,
    /// Plaintext bytes written as new blocks
    pub bytes_stored: u64,
    /// Plaintext bytes not written because the block already existed
    pub bytes_saved: u64,
}

impl BlockStoreReport {
    /// Fraction of blocks that were deduplicated.
    pub fn dedup_ratio(&self) -> f64 {
        if self.total_blocks == 0 {
            0.0
        } else {
            self.deduplicated_blocks as f64 / self.total_blocks as f64
        }
    }
}

/// Corpus-wide block statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockStats {
    /// Distinct stored blocks
    pub unique_blocks: u64,
    /// Sum of block reference counts
    pub total_references: u64,
    /// References beyond the first per block
    pub deduplicated_references: u64,
    /// Plaintext bytes held in stored blocks
    pub stored_bytes: u64,
    /// Plaintext bytes avoided through block sharing
    pub bytes_saved: u64,
}

/// Backend key for a block.
pub fn block_key(digest: &ContentDigest) -> String {
    format!("blocks/{}.blk", digest.to_hex())
}

/// Stores blocks encrypted under their own convergent keys and rebuilds objects from manifests.
pub struct BlockStore {
    records: Arc<dyn RecordStore>,
    backend: Arc<dyn ObjectBackend>,
    cipher: Arc<ConvergentCipher>,
    metrics: Arc<DedupMetrics>,
}

impl BlockStore {
    /// Wire a block store to its collaborators.
    pub fn new(
        records: Arc<dyn RecordStore>,
        backend: Arc<dyn ObjectBackend>,
        cipher: Arc<ConvergentCipher>,
        metrics: Arc<DedupMetrics>,
    ) -> Self {
        Self {
            records,
            backend,
            cipher,
            metrics,
        }
    }

    /// Dedup each block against existing blocks, persist the misses and record the manifest.
    #[instrument(skip_all, fields(object = %object.short(), blocks = blocks.len()))]
    pub async fn store_blocks(
        &self,
        object: ContentDigest,
        blocks: &[Block],
    ) -> DedupResult<BlockStoreReport> {
        let mut report = BlockStoreReport {
            total_blocks: blocks.len() as u64,
            ..BlockStoreReport::default()
        };
        let mut fresh: Vec<(ContentDigest, Bytes)> = Vec::new();
        let mut fresh_seen: HashSet<ContentDigest> = HashSet::new();
        let mut repeats: Vec<ContentDigest> = Vec::new();
        let mut hits: Vec<ContentDigest> = Vec::new();

        for block in blocks {
            let size = block.data.len() as u64;
            if fresh_seen.contains(&block.digest) {
                repeats.push(block.digest);
                report.deduplicated_blocks += 1;
                report.bytes_saved += size;
            } else if self.records.block(&block.digest)?.is_some() {
                hits.push(block.digest);
                report.deduplicated_blocks += 1;
                report.bytes_saved += size;
            } else {
                fresh_seen.insert(block.digest);
                fresh.push((block.digest, block.data.clone()));
            }
        }

        let cipher = Arc::clone(&self.cipher);
        let to_seal = fresh.clone();
        let sealed = tokio::task::spawn_blocking(move || {
            let items: Vec<(ContentDigest, &[u8])> =
                to_seal.iter().map(|(d, b)| (*d, b.as_ref())).collect();
            cipher.encrypt_many(&items)
        })
        .await
        .map_err(|e| DedupError::Worker(e.to_string()))??;

        // every payload lands before any record changes, so a failed put leaves no refs behind
        let mut written = Vec::with_capacity(fresh.len());
        for ((digest, data), ciphertext) in fresh.into_iter().zip(sealed) {
            let location = self.backend.put(&block_key(&digest), ciphertext).await?;
            written.push((digest, data, location));
        }

        for digest in &hits {
            self.records.adjust_block_refs(digest, 1)?;
        }
        for (digest, data, location) in written {
            let record = BlockRecord {
                block_digest: digest,
                size_bytes: data.len() as u64,
                location,
                reference_count: 1,
                owner: object,
                created_at: chrono::Utc::now(),
            };
            if self.records.insert_block(record)? {
                report.new_blocks += 1;
                report.bytes_stored += data.len() as u64;
            } else {
                // another writer stored the same block first
                self.records.adjust_block_refs(&digest, 1)?;
                report.deduplicated_blocks += 1;
                report.bytes_saved += data.len() as u64;
            }
        }
        for digest in &repeats {
            self.records.adjust_block_refs(digest, 1)?;
        }

        self.records.put_manifest(ObjectManifest {
            object,
            blocks: blocks.iter().map(|b| b.digest).collect(),
        })?;
        self.metrics
            .record_blocks(report.new_blocks, report.deduplicated_blocks, report.bytes_saved);
        debug!(
            new = report.new_blocks,
            deduplicated = report.deduplicated_blocks,
            bytes_saved = report.bytes_saved,
            "stored blocks"
        );
        Ok(report)
    }

    /// Rebuild an object from its manifest. Either every block decrypts and verifies, or nothing is returned.
    #[instrument(skip_all, fields(object = %object.short()))]
    pub async fn reconstruct(&self, object: &ContentDigest) -> DedupResult<Vec<u8>> {
        let manifest = self
            .records
            .manifest(object)?
            .ok_or_else(|| DedupError::not_found("manifest", object.to_hex()))?;

        let mut sealed = Vec::with_capacity(manifest.blocks.len());
        for digest in &manifest.blocks {
            let record = self
                .records
                .block(digest)?
                .ok_or_else(|| DedupError::not_found("block", digest.to_hex()))?;
            let ciphertext = self.backend.get(&record.location).await?;
            sealed.push((*digest, ciphertext));
        }

        let cipher = Arc::clone(&self.cipher);
        let plain = tokio::task::spawn_blocking(move || -> DedupResult<Vec<u8>> {
            let parts = cipher.decrypt_many(&sealed)?;
            for ((digest, _), part) in sealed.iter().zip(&parts) {
                let actual = ContentDigest::of(part);
                if actual != *digest {
                    return Err(DedupError::IntegrityFailure {
                        expected: digest.to_hex(),
                        actual: actual.to_hex(),
                    });
                }
            }
            Ok(parts.concat())
        })
        .await
        .map_err(|e| DedupError::Worker(e.to_string()))??;
        Ok(plain)
    }

    /// Drop one reference per listed block occurrence.
    pub fn release_blocks(&self, digests: &[ContentDigest]) -> DedupResult<()> {
        for d in digests {
            self.records.adjust_block_refs(d, -1)?;
        }
        Ok(())
    }

    /// Corpus-wide block statistics.
    pub fn stats(&self) -> DedupResult<BlockStats> {
        let mut stats = BlockStats::default();
        for b in self.records.blocks()? {
            stats.unique_blocks += 1;
            stats.total_references += b.reference_count;
            stats.deduplicated_references += b.reference_count.saturating_sub(1);
            stats.stored_bytes += b.size_bytes;
            stats.bytes_saved += b.size_bytes * b.reference_count.saturating_sub(1);
        }
        Ok(stats)
    }
}
