#![warn(missing_docs)]

//! Dedupstore engine: deduplicating, convergently encrypted object storage
//!
//! Upload path: Bytes → Digest (SHA-256) → Membership index (Bloom) → CAS
//!   → new: [Chunk (fixed/FastCDC) →] Encrypt (serial or parallel) → Backend
//!   → existing: reference count + ownership row
//! Access path: Ownership check → KEK force-flush → Backend → Decrypt → Re-hash

pub mod backend;
pub mod bloom;
pub mod cache;
pub mod cas;
pub mod chunker;
pub mod compression;
pub mod config;
pub mod digest;
pub mod encryption;
pub mod engine;
pub mod error;
pub mod kek_tree;
pub mod lazy_update;
pub mod metrics;
pub mod ownership;
pub mod pow;
pub mod records;

pub use backend::{build_backend, LocalDiskBackend, MemoryObjectBackend, ObjectBackend, StorageConfig, TieredBackend};
pub use bloom::{BloomFilter, BloomStats, IndexConfig, IndexLoadOutcome, MembershipIndex};
pub use cache::{HashLookupCache, LookupCacheConfig, LookupCacheStats};
pub use cas::{ContentHints, ContentStore, PutOutcome};
pub use chunker::{Block, BlockConfig, BlockStats, BlockStore, BlockStoreReport, Chunker, ChunkingStrategy};
pub use compression::{CompressionAlgorithm, CompressionStats};
pub use config::StoreConfig;
pub use digest::{digest_reader, ContentDigest, DigestHasher};
pub use encryption::{ConvergentCipher, ConvergentKey, EncryptionAlgorithm, EncryptionBenchmark, EncryptionConfig, SealedPayload};
pub use engine::{DedupEngine, DuplicateCheck, StoreStats, UploadOutcome};
pub use error::{DedupError, DedupResult};
pub use kek_tree::{KekConfig, KekNodeId, KekTree, KekTreeStats};
pub use lazy_update::{FlushReport, LazyUpdateConfig, LazyUpdateManager, LazyUpdateStats};
pub use metrics::{DedupMetric, DedupMetrics, MetricKind, MetricValue, MetricsSnapshot};
pub use ownership::{GrantOutcome, OwnershipRegistry, PrincipalStats, RevokeOutcome};
pub use pow::{
    build_verifier, solve_challenge, AdaptiveVerifier, Challenge, ChallengeState, FixedDifficultyVerifier,
    OwnershipVerifier, PowConfig, ProofReceipt, VerifierStats,
};
pub use records::{
    BlockRecord, EncryptionMethod, KekNodeRecord, MemoryRecordStore, ObjectManifest, Ownership, PrincipalId,
    RecordStore, StoredObject, VerificationMethod,
};
