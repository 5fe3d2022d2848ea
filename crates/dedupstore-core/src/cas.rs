//! Content-addressable store: the authoritative digest → object map and its reference counts.
//!
//! Identity always comes from hashing the bytes; caller hints are only
//! logged. Creation is serialized per digest by the record store's unique
//! insert: a writer that loses the race degrades to the duplicate path.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::backend::ObjectBackend;
use crate::bloom::MembershipIndex;
use crate::cache::{HashLookupCache, LookupCacheConfig, LookupCacheStats};
use crate::chunker::{BlockConfig, BlockStore, BlockStoreReport, Chunker};
use crate::digest::ContentDigest;
use crate::encryption::ConvergentCipher;
use crate::error::{DedupError, DedupResult};
use crate::metrics::DedupMetrics;
use crate::records::{EncryptionMethod, RecordStore, StoredObject};

/// Untrusted metadata supplied with an upload.
#[derive(Debug, Clone, Default)]
pub struct ContentHints {
    /// Name the uploader used
    pub filename: Option<String>,
    /// Size the uploader claimed
    pub declared_size: Option<u64>,
    /// Content type the uploader claimed
    pub media_type: Option<String>,
}

/// Result of [`ContentStore::put`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutOutcome {
    /// Digest computed from the bytes
    pub digest: ContentDigest,
    /// True if this call created the object
    pub is_new: bool,
    /// Plaintext length
    pub size_bytes: u64,
    /// Reference count after this call
    pub reference_count: u64,
    /// Block-level outcome when the object was stored as blocks
    pub block_report: Option<BlockStoreReport>,
}

/// Backend key for a whole-object payload.
pub fn object_key(digest: &ContentDigest) -> String {
    let hex = digest.to_hex();
    format!("objects/{}/{}.enc", &hex[..2], hex)
}

/// Location recorded for block-stored objects.
pub fn manifest_location(digest: &ContentDigest) -> String {
    format!("manifest:{}", digest.to_hex())
}

/// Content-addressable store.
pub struct ContentStore {
    records: Arc<dyn RecordStore>,
    backend: Arc<dyn ObjectBackend>,
    cipher: Arc<ConvergentCipher>,
    index: Arc<MembershipIndex>,
    cache: HashLookupCache<ContentDigest, StoredObject>,
    chunker: Chunker,
    blocks: BlockStore,
    block_config: BlockConfig,
    metrics: Arc<DedupMetrics>,
}

impl ContentStore {
    /// Wire the store to its collaborators. The index must already be loaded.
    pub fn new(
        records: Arc<dyn RecordStore>,
        backend: Arc<dyn ObjectBackend>,
        cipher: Arc<ConvergentCipher>,
        index: Arc<MembershipIndex>,
        cache_config: &LookupCacheConfig,
        block_config: BlockConfig,
        metrics: Arc<DedupMetrics>,
    ) -> DedupResult<Self> {
        let chunker = Chunker::new(block_config.strategy)?;
        let blocks = BlockStore::new(
            Arc::clone(&records),
            Arc::clone(&backend),
            Arc::clone(&cipher),
            Arc::clone(&metrics),
        );
        Ok(Self {
            records,
            backend,
            cipher,
            index,
            cache: HashLookupCache::new(cache_config),
            chunker,
            blocks,
            block_config,
            metrics,
        })
    }

    /// Store bytes once. Existing content only gains a reference.
    #[instrument(skip_all, fields(len = data.len()))]
    pub async fn put(&self, data: Bytes, hints: &ContentHints) -> DedupResult<PutOutcome> {
        let digest = ContentDigest::of(&data);
        let size = data.len() as u64;
        if let Some(declared) = hints.declared_size {
            if declared != size {
                debug!(declared, actual = size, "declared size ignored");
            }
        }

        if self.index.might_contain(&digest) {
            if self.records.object(&digest)?.is_some() {
                let count = self.increment_reference(&digest)?;
                debug!(digest = %digest.short(), count, "duplicate content");
                return Ok(PutOutcome {
                    digest,
                    is_new: false,
                    size_bytes: size,
                    reference_count: count,
                    block_report: None,
                });
            }
            self.metrics.record_index_false_positive();
            debug!(digest = %digest.short(), "membership index false positive");
        } else {
            self.metrics.record_index_negative();
        }

        self.store_new(digest, data, hints).await
    }

    async fn store_new(
        &self,
        digest: ContentDigest,
        data: Bytes,
        hints: &ContentHints,
    ) -> DedupResult<PutOutcome> {
        let size = data.len() as u64;
        let use_blocks = self.block_config.enabled && size >= self.block_config.min_object_size;

        let (location, method, block_report, block_list) = if use_blocks {
            let blocks = self.chunker.chunk(&data);
            let report = self.blocks.store_blocks(digest, &blocks).await?;
            let list: Vec<ContentDigest> = blocks.iter().map(|b| b.digest).collect();
            (
                manifest_location(&digest),
                EncryptionMethod::Convergent,
                Some(report),
                list,
            )
        } else {
            let cipher = Arc::clone(&self.cipher);
            let start = Instant::now();
            let sealed = tokio::task::spawn_blocking(move || cipher.encrypt(&data, &digest))
                .await
                .map_err(|e| DedupError::Worker(e.to_string()))??;
            self.metrics.record_encrypt(size, start.elapsed());
            let location = self.backend.put(&object_key(&digest), sealed.bytes).await?;
            (location, sealed.method, None, Vec::new())
        };

        let object = StoredObject {
            digest,
            size_bytes: size,
            media_type: hints
                .media_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            location,
            encryption_method: method,
            reference_count: 1,
            has_blocks: use_blocks,
            created_at: Utc::now(),
        };

        if self.records.insert_object(object)? {
            self.index.add(&digest);
            self.metrics.record_unique_object();
            debug!(digest = %digest.short(), size, blocks = use_blocks, "stored new object");
            return Ok(PutOutcome {
                digest,
                is_new: true,
                size_bytes: size,
                reference_count: 1,
                block_report,
            });
        }

        // lost the creation race: the payload at our location is byte-identical
        warn!(digest = %digest.short(), "concurrent creation, treating as duplicate");
        if use_blocks {
            self.blocks.release_blocks(&block_list)?;
        }
        let count = self.increment_reference(&digest)?;
        Ok(PutOutcome {
            digest,
            is_new: false,
            size_bytes: size,
            reference_count: count,
            block_report: None,
        })
    }

    /// Object metadata, served from the lookup cache when possible.
    pub fn get(&self, digest: &ContentDigest) -> DedupResult<StoredObject> {
        if let Some(obj) = self.cache.get(digest) {
            return Ok(obj);
        }
        let obj = self
            .records
            .object(digest)?
            .ok_or_else(|| DedupError::not_found("object", digest.to_hex()))?;
        self.cache.put(*digest, obj.clone());
        Ok(obj)
    }

    /// True if an object exists. Negative index answers skip the record store.
    pub fn contains(&self, digest: &ContentDigest) -> DedupResult<bool> {
        if !self.index.might_contain(digest) {
            return Ok(false);
        }
        match self.get(digest) {
            Ok(_) => Ok(true),
            Err(DedupError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Fetch, decrypt and verify an object's plaintext.
    #[instrument(skip_all, fields(digest = %digest.short()))]
    pub async fn read(&self, digest: &ContentDigest) -> DedupResult<Vec<u8>> {
        let obj = self.get(digest)?;
        let start = Instant::now();
        let plain = if obj.has_blocks {
            self.blocks.reconstruct(digest).await?
        } else {
            let sealed = self.backend.get(&obj.location).await?;
            let cipher = Arc::clone(&self.cipher);
            let d = *digest;
            tokio::task::spawn_blocking(move || cipher.decrypt(&sealed, &d))
                .await
                .map_err(|e| DedupError::Worker(e.to_string()))??
        };
        self.metrics.record_decrypt(start.elapsed());

        let actual = ContentDigest::of(&plain);
        if actual != *digest {
            self.metrics.record_integrity_failure();
            return Err(DedupError::IntegrityFailure {
                expected: digest.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(plain)
    }

    /// Add one reference.
    pub fn increment_reference(&self, digest: &ContentDigest) -> DedupResult<u64> {
        let count = self.records.adjust_object_refs(digest, 1)?;
        self.cache.invalidate(digest);
        Ok(count)
    }

    /// Drop one reference. Fails without change when the count is already zero.
    pub fn decrement_reference(&self, digest: &ContentDigest) -> DedupResult<u64> {
        let count = self.records.adjust_object_refs(digest, -1)?;
        self.cache.invalidate(digest);
        if count == 0 {
            debug!(digest = %digest.short(), "object unreferenced, eligible for collection");
        }
        Ok(count)
    }

    /// Digests whose reference count reached zero.
    pub fn reclaimable(&self) -> DedupResult<Vec<ContentDigest>> {
        Ok(self
            .records
            .objects()?
            .into_iter()
            .filter(|o| o.reference_count == 0)
            .map(|o| o.digest)
            .collect())
    }

    /// Lookup cache counters.
    pub fn cache_stats(&self) -> LookupCacheStats {
        self.cache.stats()
    }

    /// Drop expired cache entries.
    pub fn cleanup_cache(&self) -> usize {
        self.cache.cleanup_expired()
    }

    /// Block store used for block-level objects.
    pub fn block_store(&self) -> &BlockStore {
        &self.blocks
    }
}
