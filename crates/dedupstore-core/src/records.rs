//! Durable record schema and the record store seam.
//!
//! The engine reads and writes five record families: stored objects, blocks
//! (plus per-object manifests), ownership rows, KEK tree nodes and the single
//! membership-index blob. [`RecordStore`] is the boundary; uniqueness of
//! object digests, block digests and node ids is enforced by the store, and
//! inserts report a conflict by returning `false` instead of overwriting.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::atomic_write_sync;
use crate::digest::ContentDigest;
use crate::error::{DedupError, DedupResult};

/// Numeric user identity supplied by the caller.
pub type PrincipalId = u64;

/// How a stored object was encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionMethod {
    /// Single serial pass
    Convergent,
    /// Fixed-size chunks encrypted concurrently
    ConvergentParallel,
}

impl EncryptionMethod {
    /// Wire/record tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Convergent => "convergent",
            Self::ConvergentParallel => "convergent-parallel",
        }
    }
}

/// One physical unique payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    /// Content digest, primary key
    pub digest: ContentDigest,
    /// Plaintext length
    pub size_bytes: u64,
    /// Caller-supplied content type hint
    pub media_type: String,
    /// Backend location, or the manifest key for block-stored objects
    pub location: String,
    /// Encryption framing used for the whole-object payload
    pub encryption_method: EncryptionMethod,
    /// Number of ownership rows referring to this object
    pub reference_count: u64,
    /// Payload lives in deduplicated blocks listed by a manifest
    pub has_blocks: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// One sub-file chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Digest of the raw block bytes
    pub block_digest: ContentDigest,
    /// Plaintext block length
    pub size_bytes: u64,
    /// Backend location of the encrypted block
    pub location: String,
    /// Occurrences across all manifests
    pub reference_count: u64,
    /// Object that first wrote this block
    pub owner: ContentDigest,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Ordered block list used to rebuild an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectManifest {
    /// Object being described
    pub object: ContentDigest,
    /// Block digests in file order; repeats are allowed
    pub blocks: Vec<ContentDigest>,
}

/// How a principal came to own an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMethod {
    /// Uploaded the bytes
    Upload,
    /// Received from another owner
    Shared,
    /// Solved a proof-of-ownership challenge
    Pow,
    /// Granted directly by the caller
    Simple,
}

impl VerificationMethod {
    /// Record tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Shared => "shared",
            Self::Pow => "pow",
            Self::Simple => "simple",
        }
    }
}

/// A principal's claim on an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ownership {
    /// Row id
    pub id: Uuid,
    /// Owner
    pub principal: PrincipalId,
    /// Owned object
    pub object: ContentDigest,
    /// How ownership was established
    pub method: VerificationMethod,
    /// The upload that created the stored object
    pub original: bool,
    /// Name the principal used, if any
    pub filename: Option<String>,
    /// Challenge the principal answered (pow only)
    pub challenge_hash: Option<String>,
    /// Accepted response (pow only)
    pub response_hash: Option<String>,
    /// When the row was created
    pub granted_at: DateTime<Utc>,
}

impl Ownership {
    /// New row stamped now.
    pub fn new(principal: PrincipalId, object: ContentDigest, method: VerificationMethod) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal,
            object,
            method,
            original: false,
            filename: None,
            challenge_hash: None,
            response_hash: None,
            granted_at: Utc::now(),
        }
    }
}

/// Persisted KEK tree node. Only the hash of the key is ever stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KekNodeRecord {
    /// "L{level}_N{index}"
    pub node_id: String,
    /// None for the root
    pub parent_id: Option<String>,
    /// SHA-256 hex of the current key
    pub key_hash: String,
    /// Depth, root is 0
    pub level: u32,
    /// Leaf flag
    pub is_leaf: bool,
}

/// Durable record store consumed by the engine.
pub trait RecordStore: Send + Sync {
    /// Insert a new object. Returns false if the digest already exists.
    fn insert_object(&self, object: StoredObject) -> DedupResult<bool>;
    /// Fetch an object.
    fn object(&self, digest: &ContentDigest) -> DedupResult<Option<StoredObject>>;
    /// Apply a signed delta to an object's reference count, returning the new count.
    fn adjust_object_refs(&self, digest: &ContentDigest, delta: i64) -> DedupResult<u64>;
    /// Every object digest, used to rebuild the membership index.
    fn list_object_digests(&self) -> DedupResult<Vec<ContentDigest>>;
    /// All object rows.
    fn objects(&self) -> DedupResult<Vec<StoredObject>>;

    /// Insert a new block. Returns false if the digest already exists.
    fn insert_block(&self, block: BlockRecord) -> DedupResult<bool>;
    /// Fetch a block.
    fn block(&self, digest: &ContentDigest) -> DedupResult<Option<BlockRecord>>;
    /// Apply a signed delta to a block's reference count, returning the new count.
    fn adjust_block_refs(&self, digest: &ContentDigest, delta: i64) -> DedupResult<u64>;
    /// All block rows.
    fn blocks(&self) -> DedupResult<Vec<BlockRecord>>;
    /// Store the ordered block list for an object.
    fn put_manifest(&self, manifest: ObjectManifest) -> DedupResult<()>;
    /// Fetch an object's block list.
    fn manifest(&self, object: &ContentDigest) -> DedupResult<Option<ObjectManifest>>;

    /// Append an ownership row unconditionally.
    fn insert_ownership(&self, row: Ownership) -> DedupResult<()>;
    /// Append an ownership row unless the principal already owns the object.
    fn insert_ownership_if_absent(&self, row: Ownership) -> DedupResult<bool>;
    /// Most recent row for a (principal, object) pair.
    fn ownership(&self, principal: PrincipalId, object: &ContentDigest) -> DedupResult<Option<Ownership>>;
    /// Remove the most recent row for a (principal, object) pair.
    fn remove_ownership(
        &self,
        principal: PrincipalId,
        object: &ContentDigest,
    ) -> DedupResult<Option<Ownership>>;
    /// All rows for an object.
    fn owners_of(&self, object: &ContentDigest) -> DedupResult<Vec<Ownership>>;
    /// All rows held by a principal.
    fn owned_by(&self, principal: PrincipalId) -> DedupResult<Vec<Ownership>>;
    /// Total ownership rows.
    fn ownership_count(&self) -> DedupResult<u64>;

    /// Insert or replace KEK nodes keyed by node id.
    fn upsert_kek_nodes(&self, nodes: Vec<KekNodeRecord>) -> DedupResult<()>;
    /// All persisted KEK nodes.
    fn kek_nodes(&self) -> DedupResult<Vec<KekNodeRecord>>;

    /// Replace the membership index blob.
    fn save_index_state(&self, blob: Vec<u8>) -> DedupResult<()>;
    /// Current membership index blob, if any.
    fn load_index_state(&self) -> DedupResult<Option<Vec<u8>>>;
}

fn apply_delta(
    kind: &'static str,
    digest: &ContentDigest,
    count: &mut u64,
    delta: i64,
) -> DedupResult<u64> {
    if delta < 0 {
        let dec = delta.unsigned_abs();
        if *count < dec {
            return Err(DedupError::ReferenceUnderflow {
                kind,
                id: digest.to_hex(),
            });
        }
        *count -= dec;
    } else {
        *count += delta as u64;
    }
    Ok(*count)
}

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct RecordSnapshot {
    version: u32,
    objects: Vec<StoredObject>,
    blocks: Vec<BlockRecord>,
    manifests: Vec<ObjectManifest>,
    ownerships: Vec<Ownership>,
    kek_nodes: Vec<KekNodeRecord>,
    index_state: Option<String>,
}

/// In-process record store backed by concurrent maps, with optional JSON snapshots.
#[derive(Default)]
pub struct MemoryRecordStore {
    objects: DashMap<ContentDigest, StoredObject>,
    blocks: DashMap<ContentDigest, BlockRecord>,
    manifests: DashMap<ContentDigest, ObjectManifest>,
    ownerships: DashMap<ContentDigest, Vec<Ownership>>,
    kek_nodes: RwLock<BTreeMap<String, KekNodeRecord>>,
    index_state: RwLock<Option<Vec<u8>>>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryRecordStore {
    /// Empty store with no snapshot file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot if present; later calls to [`Self::persist`] write back to `path`.
    pub fn open(path: impl Into<PathBuf>) -> DedupResult<Self> {
        let path = path.into();
        let mut store = Self {
            snapshot_path: Some(path.clone()),
            ..Self::default()
        };
        if !path.exists() {
            debug!(path = %path.display(), "no record snapshot, starting empty");
            return Ok(store);
        }
        let raw = std::fs::read(&path)?;
        let snap: RecordSnapshot = serde_json::from_slice(&raw)?;
        if snap.version != SNAPSHOT_VERSION {
            return Err(DedupError::Serialization(format!(
                "unsupported record snapshot version {}",
                snap.version
            )));
        }
        for o in snap.objects {
            store.objects.insert(o.digest, o);
        }
        for b in snap.blocks {
            store.blocks.insert(b.block_digest, b);
        }
        for m in snap.manifests {
            store.manifests.insert(m.object, m);
        }
        for row in snap.ownerships {
            store.ownerships.entry(row.object).or_default().push(row);
        }
        *store.kek_nodes.get_mut() = snap
            .kek_nodes
            .into_iter()
            .map(|n| (n.node_id.clone(), n))
            .collect();
        *store.index_state.get_mut() = match snap.index_state {
            Some(h) => Some(
                hex::decode(h).map_err(|e| DedupError::Serialization(e.to_string()))?,
            ),
            None => None,
        };
        info!(
            path = %path.display(),
            objects = store.objects.len(),
            blocks = store.blocks.len(),
            "loaded record snapshot"
        );
        Ok(store)
    }

    /// Write a snapshot to `path` atomically.
    pub fn save(&self, path: &Path) -> DedupResult<()> {
        let mut ownerships: Vec<Ownership> = self
            .ownerships
            .iter()
            .flat_map(|e| e.value().clone())
            .collect();
        ownerships.sort_by_key(|o| o.granted_at);
        let snap = RecordSnapshot {
            version: SNAPSHOT_VERSION,
            objects: self.objects.iter().map(|e| e.value().clone()).collect(),
            blocks: self.blocks.iter().map(|e| e.value().clone()).collect(),
            manifests: self.manifests.iter().map(|e| e.value().clone()).collect(),
            ownerships,
            kek_nodes: self.kek_nodes.read().values().cloned().collect(),
            index_state: self.index_state.read().as_ref().map(hex::encode),
        };
        let json = serde_json::to_vec_pretty(&snap)?;
        atomic_write_sync(path, &json)?;
        debug!(path = %path.display(), bytes = json.len(), "saved record snapshot");
        Ok(())
    }

    /// Write back to the path given to [`Self::open`]. No-op for unnamed stores.
    pub fn persist(&self) -> DedupResult<()> {
        match &self.snapshot_path {
            Some(p) => self.save(p),
            None => Ok(()),
        }
    }
}

impl RecordStore for MemoryRecordStore {
    fn insert_object(&self, object: StoredObject) -> DedupResult<bool> {
        match self.objects.entry(object.digest) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(v) => {
                v.insert(object);
                Ok(true)
            }
        }
    }

    fn object(&self, digest: &ContentDigest) -> DedupResult<Option<StoredObject>> {
        Ok(self.objects.get(digest).map(|o| o.clone()))
    }

    fn adjust_object_refs(&self, digest: &ContentDigest, delta: i64) -> DedupResult<u64> {
        let mut obj = self
            .objects
            .get_mut(digest)
            .ok_or_else(|| DedupError::not_found("object", digest.to_hex()))?;
        apply_delta("object", digest, &mut obj.reference_count, delta)
    }

    fn list_object_digests(&self) -> DedupResult<Vec<ContentDigest>> {
        Ok(self.objects.iter().map(|e| *e.key()).collect())
    }

    fn objects(&self) -> DedupResult<Vec<StoredObject>> {
        Ok(self.objects.iter().map(|e| e.value().clone()).collect())
    }

    fn insert_block(&self, block: BlockRecord) -> DedupResult<bool> {
        match self.blocks.entry(block.block_digest) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(v) => {
                v.insert(block);
                Ok(true)
            }
        }
    }

    fn block(&self, digest: &ContentDigest) -> DedupResult<Option<BlockRecord>> {
        Ok(self.blocks.get(digest).map(|b| b.clone()))
    }

    fn adjust_block_refs(&self, digest: &ContentDigest, delta: i64) -> DedupResult<u64> {
        let mut block = self
            .blocks
            .get_mut(digest)
            .ok_or_else(|| DedupError::not_found("block", digest.to_hex()))?;
        apply_delta("block", digest, &mut block.reference_count, delta)
    }

    fn blocks(&self) -> DedupResult<Vec<BlockRecord>> {
        Ok(self.blocks.iter().map(|e| e.value().clone()).collect())
    }

    fn put_manifest(&self, manifest: ObjectManifest) -> DedupResult<()> {
        self.manifests.insert(manifest.object, manifest);
        Ok(())
    }

    fn manifest(&self, object: &ContentDigest) -> DedupResult<Option<ObjectManifest>> {
        Ok(self.manifests.get(object).map(|m| m.clone()))
    }

    fn insert_ownership(&self, row: Ownership) -> DedupResult<()> {
        self.ownerships.entry(row.object).or_default().push(row);
        Ok(())
    }

    fn insert_ownership_if_absent(&self, row: Ownership) -> DedupResult<bool> {
        let mut rows = self.ownerships.entry(row.object).or_default();
        if rows.iter().any(|r| r.principal == row.principal) {
            return Ok(false);
        }
        rows.push(row);
        Ok(true)
    }

    fn ownership(
        &self,
        principal: PrincipalId,
        object: &ContentDigest,
    ) -> DedupResult<Option<Ownership>> {
        Ok(self
            .ownerships
            .get(object)
            .and_then(|rows| rows.iter().rev().find(|r| r.principal == principal).cloned()))
    }

    fn remove_ownership(
        &self,
        principal: PrincipalId,
        object: &ContentDigest,
    ) -> DedupResult<Option<Ownership>> {
        let Some(mut rows) = self.ownerships.get_mut(object) else {
            return Ok(None);
        };
        match rows.iter().rposition(|r| r.principal == principal) {
            Some(pos) => Ok(Some(rows.remove(pos))),
            None => Ok(None),
        }
    }

    fn owners_of(&self, object: &ContentDigest) -> DedupResult<Vec<Ownership>> {
        Ok(self
            .ownerships
            .get(object)
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }

    fn owned_by(&self, principal: PrincipalId) -> DedupResult<Vec<Ownership>> {
        Ok(self
            .ownerships
            .iter()
            .flat_map(|e| {
                e.value()
                    .iter()
                    .filter(|r| r.principal == principal)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    fn ownership_count(&self) -> DedupResult<u64> {
        Ok(self.ownerships.iter().map(|e| e.value().len() as u64).sum())
    }

    fn upsert_kek_nodes(&self, nodes: Vec<KekNodeRecord>) -> DedupResult<()> {
        let mut map = self.kek_nodes.write();
        for n in nodes {
            map.insert(n.node_id.clone(), n);
        }
        Ok(())
    }

    fn kek_nodes(&self) -> DedupResult<Vec<KekNodeRecord>> {
        Ok(self.kek_nodes.read().values().cloned().collect())
    }

    fn save_index_state(&self, blob: Vec<u8>) -> DedupResult<()> {
        *self.index_state.write() = Some(blob);
        Ok(())
    }

    fn load_index_state(&self) -> DedupResult<Option<Vec<u8>>> {
        Ok(self.index_state.read().clone())
    }
}
