//! The store facade: upload, duplicate checks, ownership, proofs, downloads and key rotation.
//!
//! Opening an engine validates the config, loads (or rebuilds) the membership
//! index, loads (or builds and persists) the KEK tree and selects the PoW
//! verifier. All state that must survive a restart goes through the
//! [`RecordStore`] and the [`ObjectBackend`].

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::backend::{atomic_write, MemoryObjectBackend, ObjectBackend};
use crate::bloom::{IndexLoadOutcome, IndexStats, MembershipIndex};
use crate::cache::LookupCacheStats;
use crate::cas::{ContentHints, ContentStore};
use crate::chunker::{BlockStats, BlockStoreReport};
use crate::compression::CompressionStats;
use crate::config::StoreConfig;
use crate::digest::ContentDigest;
use crate::encryption::{ConvergentCipher, EncryptionBenchmark};
use crate::error::{DedupError, DedupResult};
use crate::kek_tree::{random_key_hash, KekNodeId, KekTree, KekTreeStats};
use crate::lazy_update::{FlushReport, LazyUpdateManager, LazyUpdateStats};
use crate::metrics::{DedupMetrics, MetricsSnapshot};
use crate::ownership::{GrantOutcome, OwnershipRegistry, PrincipalStats, RevokeOutcome};
use crate::pow::{build_verifier, Challenge, ChallengeState, OwnershipVerifier, VerifierStats};
use crate::records::{MemoryRecordStore, PrincipalId, RecordStore, VerificationMethod};

/// Result of [`DedupEngine::upload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadOutcome {
    /// Content already existed
    pub is_duplicate: bool,
    /// Digest of the uploaded bytes
    pub object_id: ContentDigest,
    /// Plaintext length
    pub size_bytes: u64,
    /// Bytes not written thanks to dedup (whole object or shared blocks)
    pub bytes_saved: u64,
    /// Object reference count afterwards
    pub reference_count: u64,
    /// Block-level outcome for newly stored block-mode objects
    pub blocks: Option<BlockStoreReport>,
}

/// Result of [`DedupEngine::check_duplicate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCheck {
    /// Object is stored
    pub is_duplicate: bool,
    /// The stored object's id when it is
    pub object_id: Option<ContentDigest>,
}

/// Everything a dashboard needs in one serialisable value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    /// Upload, crypto and verification counters
    pub metrics: MetricsSnapshot,
    /// Membership index
    pub index: IndexStats,
    /// Lookup cache
    pub cache: LookupCacheStats,
    /// Proof-of-ownership verifier
    pub pow: VerifierStats,
    /// KEK tree shape
    pub kek: KekTreeStats,
    /// Rotation queue
    pub lazy_updates: LazyUpdateStats,
    /// Block-level dedup
    pub blocks: BlockStats,
    /// Stored objects
    pub objects: u64,
    /// Ownership rows
    pub ownerships: u64,
    /// Plaintext bytes of unique objects
    pub physical_bytes: u64,
    /// Plaintext bytes across all references
    pub logical_bytes: u64,
    /// Objects with no remaining references
    pub reclaimable_objects: u64,
}

/// Deduplicating encrypted object store.
pub struct DedupEngine {
    config: StoreConfig,
    records: Arc<dyn RecordStore>,
    cipher: Arc<ConvergentCipher>,
    index: Arc<MembershipIndex>,
    cas: Arc<ContentStore>,
    ownership: OwnershipRegistry,
    verifier: Box<dyn OwnershipVerifier>,
    keys: LazyUpdateManager,
    metrics: Arc<DedupMetrics>,
    index_outcome: IndexLoadOutcome,
}

impl DedupEngine {
    /// Open an engine over existing records and payload storage.
    pub fn open(
        config: StoreConfig,
        records: Arc<dyn RecordStore>,
        backend: Arc<dyn ObjectBackend>,
    ) -> DedupResult<Self> {
        config.validate()?;
        let metrics = Arc::new(DedupMetrics::new());
        let cipher = Arc::new(ConvergentCipher::new(config.encryption.clone())?);

        let (index, index_outcome) =
            MembershipIndex::load_or_rebuild(config.index.clone(), records.as_ref())?;
        let index = Arc::new(index);

        let cas = Arc::new(ContentStore::new(
            Arc::clone(&records),
            backend,
            Arc::clone(&cipher),
            Arc::clone(&index),
            &config.cache,
            config.blocks.clone(),
            Arc::clone(&metrics),
        )?);
        let ownership = OwnershipRegistry::new(Arc::clone(&records), Arc::clone(&cas));

        let nodes = records.kek_nodes()?;
        let tree = if nodes.is_empty() {
            let tree = KekTree::build(config.kek.leaf_count, config.kek.branching_factor)?;
            records.upsert_kek_nodes(tree.to_records())?;
            tree
        } else {
            KekTree::from_records(&nodes, config.kek.branching_factor)?
        };
        let keys = LazyUpdateManager::new(tree, config.lazy_updates.clone());
        let verifier = build_verifier(&config.pow)?;

        info!(
            index = ?index_outcome,
            kek_nodes = keys.tree().stats().total_nodes,
            adaptive_pow = config.pow.adaptive,
            "opened dedup engine"
        );
        Ok(Self {
            config,
            records,
            cipher,
            index,
            cas,
            ownership,
            verifier,
            keys,
            metrics,
            index_outcome,
        })
    }

    /// Engine with in-process records and an in-memory payload store.
    pub fn in_memory(config: StoreConfig) -> DedupResult<Self> {
        let bucket = config.storage.remote_bucket.clone();
        Self::open(
            config,
            Arc::new(MemoryRecordStore::new()),
            Arc::new(MemoryObjectBackend::new(&bucket)),
        )
    }

    /// Store bytes for `principal`, deduplicating against everything already stored.
    #[instrument(skip_all, fields(principal = principal, len = data.len()))]
    pub async fn upload(
        &self,
        data: Bytes,
        filename: &str,
        principal: PrincipalId,
    ) -> DedupResult<UploadOutcome> {
        let size = data.len() as u64;
        self.verifier.record_load_event();
        self.metrics.record_upload(size);

        let hints = ContentHints {
            filename: Some(filename.to_string()),
            declared_size: Some(size),
            media_type: None,
        };
        let put = self.cas.put(data, &hints).await?;
        self.ownership
            .record_upload(principal, &put.digest, Some(filename.to_string()), put.is_new)?;

        let bytes_saved = if put.is_new {
            if self.config.index.persist_on_insert {
                self.index.persist(self.records.as_ref())?;
            }
            put.block_report.as_ref().map_or(0, |r| r.bytes_saved)
        } else {
            self.metrics.record_duplicate(size);
            size
        };

        info!(
            digest = %put.digest.short(),
            duplicate = !put.is_new,
            refs = put.reference_count,
            bytes_saved,
            "upload complete"
        );
        Ok(UploadOutcome {
            is_duplicate: !put.is_new,
            object_id: put.digest,
            size_bytes: size,
            bytes_saved,
            reference_count: put.reference_count,
            blocks: put.block_report,
        })
    }

    /// Whether content with this digest is already stored.
    pub fn check_duplicate(&self, digest: &ContentDigest) -> DedupResult<DuplicateCheck> {
        let is_duplicate = self.cas.contains(digest)?;
        Ok(DuplicateCheck {
            is_duplicate,
            object_id: is_duplicate.then_some(*digest),
        })
    }

    /// Grant ownership without a proof.
    pub fn grant_ownership(
        &self,
        principal: PrincipalId,
        digest: &ContentDigest,
    ) -> DedupResult<GrantOutcome> {
        self.ownership
            .grant(principal, digest, VerificationMethod::Simple, None)
    }

    /// True if `principal` owns the object.
    pub fn verify_ownership(&self, principal: PrincipalId, digest: &ContentDigest) -> DedupResult<bool> {
        self.ownership.verify(principal, digest)
    }

    /// Revoke ownership and queue a re-key of the principal's KEK leaf.
    pub fn revoke_ownership(
        &self,
        principal: PrincipalId,
        digest: &ContentDigest,
    ) -> DedupResult<RevokeOutcome> {
        let outcome = self.ownership.revoke(principal, digest)?;
        let leaf = self.keys.tree().leaf_for(principal);
        self.queue_key_rotation(leaf)?;
        Ok(outcome)
    }

    /// Let an owner share an object with another principal.
    pub fn share(
        &self,
        owner: PrincipalId,
        recipient: PrincipalId,
        digest: &ContentDigest,
    ) -> DedupResult<GrantOutcome> {
        self.ownership.share(owner, recipient, digest)
    }

    /// Issue a proof-of-ownership challenge for a stored object.
    pub fn generate_challenge(
        &self,
        principal: PrincipalId,
        digest: &ContentDigest,
    ) -> DedupResult<Challenge> {
        self.cas.get(digest)?;
        let challenge = self.verifier.generate_challenge(principal, digest);
        self.metrics.record_challenge();
        Ok(challenge)
    }

    /// Check a nonce and grant PoW ownership on success.
    pub fn verify_proof(
        &self,
        principal: PrincipalId,
        digest: &ContentDigest,
        nonce: u64,
    ) -> DedupResult<GrantOutcome> {
        let start = Instant::now();
        let result = self.verifier.verify_proof(principal, digest, nonce);
        self.metrics
            .record_verification(result.is_ok(), start.elapsed());
        let receipt = result?;
        debug!(
            principal,
            difficulty = receipt.difficulty,
            solve_ms = receipt.solve_time.as_millis() as u64,
            "proof accepted"
        );
        self.ownership
            .grant(principal, digest, VerificationMethod::Pow, Some(&receipt))
    }

    /// Protocol state of a (principal, object) pair.
    pub fn challenge_state(&self, principal: PrincipalId, digest: &ContentDigest) -> ChallengeState {
        self.verifier.challenge_state(principal, digest)
    }

    /// Plaintext of an owned object. Pending key updates are applied first.
    #[instrument(skip_all, fields(principal = principal, digest = %digest.short()))]
    pub async fn download(&self, principal: PrincipalId, digest: &ContentDigest) -> DedupResult<Vec<u8>> {
        if !self.ownership.verify(principal, digest)? {
            return Err(DedupError::OwnershipNotFound {
                principal,
                digest: digest.to_hex(),
            });
        }
        self.force_flush_key_updates()?;
        self.cas.read(digest).await
    }

    /// Download into `path`, which only appears once the full payload is verified.
    pub async fn download_to(
        &self,
        principal: PrincipalId,
        digest: &ContentDigest,
        path: &Path,
    ) -> DedupResult<u64> {
        let plain = self.download(principal, digest).await?;
        atomic_write(path, &plain).await?;
        Ok(plain.len() as u64)
    }

    /// Queue a fresh key for `node`; applies the batch if a threshold is reached.
    pub fn queue_key_rotation(&self, node: KekNodeId) -> DedupResult<Option<FlushReport>> {
        let report = self.keys.queue_update(node, random_key_hash())?;
        if let Some(r) = &report {
            self.persist_rotation(r)?;
        }
        Ok(report)
    }

    /// Apply queued rotations if a threshold is reached.
    pub fn flush_key_updates(&self) -> DedupResult<Option<FlushReport>> {
        let report = self.keys.flush()?;
        if let Some(r) = &report {
            self.persist_rotation(r)?;
        }
        Ok(report)
    }

    /// Apply queued rotations now.
    pub fn force_flush_key_updates(&self) -> DedupResult<FlushReport> {
        let report = self.keys.force_flush()?;
        self.persist_rotation(&report)?;
        Ok(report)
    }

    fn persist_rotation(&self, report: &FlushReport) -> DedupResult<()> {
        if report.applied == 0 {
            return Ok(());
        }
        let nodes = self.keys.tree().records_for(&report.updated_nodes)?;
        self.records.upsert_kek_nodes(nodes)?;
        self.metrics
            .record_key_rotation(report.applied as u64, report.updated_nodes.len() as u64);
        Ok(())
    }

    /// Write the membership index to the record store.
    pub fn persist_index(&self) -> DedupResult<CompressionStats> {
        self.index.persist(self.records.as_ref())
    }

    /// Rebuild the membership index from every stored digest and persist it.
    pub fn rebuild_index(&self) -> DedupResult<u64> {
        let items = self.index.rebuild(self.records.as_ref())?;
        self.index.persist(self.records.as_ref())?;
        Ok(items)
    }

    /// Serial vs parallel encryption timing on `sample`.
    pub fn benchmark(&self, sample: &[u8]) -> DedupResult<EncryptionBenchmark> {
        self.cipher.benchmark(sample)
    }

    /// Holdings of one principal.
    pub fn principal_stats(&self, principal: PrincipalId) -> DedupResult<PrincipalStats> {
        self.ownership.principal_stats(principal)
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> DedupResult<StoreStats> {
        let objects = self.records.objects()?;
        let physical_bytes = objects.iter().map(|o| o.size_bytes).sum();
        let logical_bytes = objects
            .iter()
            .map(|o| o.size_bytes * o.reference_count)
            .sum();
        let reclaimable_objects = objects.iter().filter(|o| o.reference_count == 0).count() as u64;
        Ok(StoreStats {
            metrics: self.metrics.snapshot(),
            index: self.index.stats(),
            cache: self.cas.cache_stats(),
            pow: self.verifier.stats(),
            kek: self.keys.tree().stats(),
            lazy_updates: self.keys.stats(),
            blocks: self.cas.block_store().stats()?,
            objects: objects.len() as u64,
            ownerships: self.records.ownership_count()?,
            physical_bytes,
            logical_bytes,
            reclaimable_objects,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// How the membership index was obtained at open.
    pub fn index_load_outcome(&self) -> &IndexLoadOutcome {
        &self.index_outcome
    }

    /// The content store.
    pub fn content_store(&self) -> &ContentStore {
        &self.cas
    }

    /// The ownership registry.
    pub fn ownership(&self) -> &OwnershipRegistry {
        &self.ownership
    }

    /// The KEK tree and its rotation queue.
    pub fn key_manager(&self) -> &LazyUpdateManager {
        &self.keys
    }

    /// The active verifier.
    pub fn verifier(&self) -> &dyn OwnershipVerifier {
        self.verifier.as_ref()
    }

    /// Counters.
    pub fn metrics(&self) -> &DedupMetrics {
        &self.metrics
    }

    /// The record store.
    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }
}
