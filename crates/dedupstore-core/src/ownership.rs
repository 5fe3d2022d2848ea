//! Ownership rows and their coupling to object reference counts.
//!
//! The registry keeps `StoredObject.reference_count` equal to the number of
//! ownership rows for that object. Uploads arrive with their reference
//! already taken by [`ContentStore::put`]; every other grant takes one here.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cas::ContentStore;
use crate::digest::ContentDigest;
use crate::error::{DedupError, DedupResult};
use crate::pow::ProofReceipt;
use crate::records::{Ownership, PrincipalId, RecordStore, VerificationMethod};

/// Result of a grant.
#[derive(Debug, Clone, PartialEq)]
pub struct GrantOutcome {
    /// The row now held by the principal
    pub ownership: Ownership,
    /// False if the principal already owned the object
    pub newly_granted: bool,
    /// Object reference count afterwards
    pub reference_count: u64,
}

/// Result of a revocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RevokeOutcome {
    /// The removed row
    pub revoked: Ownership,
    /// Object reference count afterwards
    pub reference_count: u64,
}

/// Per-principal holdings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrincipalStats {
    /// Principal id
    pub principal: PrincipalId,
    /// Distinct objects owned
    pub objects: usize,
    /// Ownership rows held
    pub rows: usize,
    /// Plaintext bytes across distinct objects
    pub logical_bytes: u64,
    /// Rows by how they were obtained
    pub by_method: BTreeMap<VerificationMethod, u64>,
}

/// Ownership bookkeeping over the record store and CAS.
pub struct OwnershipRegistry {
    records: Arc<dyn RecordStore>,
    cas: Arc<ContentStore>,
}

impl OwnershipRegistry {
    /// Registry over the given stores.
    pub fn new(records: Arc<dyn RecordStore>, cas: Arc<ContentStore>) -> Self {
        Self { records, cas }
    }

    /// Row for an upload whose reference [`ContentStore::put`] already counted.
    pub fn record_upload(
        &self,
        principal: PrincipalId,
        digest: &ContentDigest,
        filename: Option<String>,
        original: bool,
    ) -> DedupResult<Ownership> {
        let mut row = Ownership::new(principal, *digest, VerificationMethod::Upload);
        row.original = original;
        row.filename = filename;
        self.records.insert_ownership(row.clone())?;
        debug!(principal, digest = %digest.short(), original, "recorded upload ownership");
        Ok(row)
    }

    /// Give `principal` ownership unless it already has it. Takes a reference only when new.
    pub fn grant(
        &self,
        principal: PrincipalId,
        digest: &ContentDigest,
        method: VerificationMethod,
        proof: Option<&ProofReceipt>,
    ) -> DedupResult<GrantOutcome> {
        let object = self.cas.get(digest)?;
        let mut row = Ownership::new(principal, *digest, method);
        if let Some(p) = proof {
            row.challenge_hash = Some(p.challenge_hash.clone());
            row.response_hash = Some(p.response_hash.clone());
        }
        if !self.records.insert_ownership_if_absent(row.clone())? {
            let existing = self
                .records
                .ownership(principal, digest)?
                .ok_or_else(|| DedupError::OwnershipNotFound {
                    principal,
                    digest: digest.to_hex(),
                })?;
            return Ok(GrantOutcome {
                ownership: existing,
                newly_granted: false,
                reference_count: object.reference_count,
            });
        }
        let reference_count = self.cas.increment_reference(digest)?;
        info!(principal, digest = %digest.short(), method = method.as_str(), "granted ownership");
        Ok(GrantOutcome {
            ownership: row,
            newly_granted: true,
            reference_count,
        })
    }

    /// True if `principal` holds any row for the object.
    pub fn verify(&self, principal: PrincipalId, digest: &ContentDigest) -> DedupResult<bool> {
        Ok(self.records.ownership(principal, digest)?.is_some())
    }

    /// Remove the principal's most recent row and drop its reference.
    pub fn revoke(&self, principal: PrincipalId, digest: &ContentDigest) -> DedupResult<RevokeOutcome> {
        let not_owned = || DedupError::OwnershipNotFound {
            principal,
            digest: digest.to_hex(),
        };
        if self.records.ownership(principal, digest)?.is_none() {
            return Err(not_owned());
        }
        let reference_count = self.cas.decrement_reference(digest)?;
        match self.records.remove_ownership(principal, digest)? {
            Some(revoked) => {
                info!(principal, digest = %digest.short(), reference_count, "revoked ownership");
                Ok(RevokeOutcome {
                    revoked,
                    reference_count,
                })
            }
            None => {
                // lost a race with another revoke of the same row
                self.cas.increment_reference(digest)?;
                Err(not_owned())
            }
        }
    }

    /// Grant `recipient` a shared row. `owner` must already own the object.
    pub fn share(
        &self,
        owner: PrincipalId,
        recipient: PrincipalId,
        digest: &ContentDigest,
    ) -> DedupResult<GrantOutcome> {
        if !self.verify(owner, digest)? {
            return Err(DedupError::NotOwner {
                principal: owner,
                digest: digest.to_hex(),
            });
        }
        self.grant(recipient, digest, VerificationMethod::Shared, None)
    }

    /// Distinct objects a principal owns.
    pub fn objects_of(&self, principal: PrincipalId) -> DedupResult<Vec<ContentDigest>> {
        let mut out: Vec<ContentDigest> = self
            .records
            .owned_by(principal)?
            .into_iter()
            .map(|o| o.object)
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }

    /// Distinct principals owning an object.
    pub fn owners_of(&self, digest: &ContentDigest) -> DedupResult<Vec<PrincipalId>> {
        let mut out: Vec<PrincipalId> = self
            .records
            .owners_of(digest)?
            .into_iter()
            .map(|o| o.principal)
            .collect();
        out.sort_unstable();
        out.dedup();
        Ok(out)
    }

    /// Holdings summary for one principal.
    pub fn principal_stats(&self, principal: PrincipalId) -> DedupResult<PrincipalStats> {
        let rows = self.records.owned_by(principal)?;
        let mut stats = PrincipalStats {
            principal,
            rows: rows.len(),
            ..PrincipalStats::default()
        };
        for row in &rows {
            *stats.by_method.entry(row.method).or_default() += 1;
        }
        for digest in self.objects_of(principal)? {
            stats.objects += 1;
            if let Some(obj) = self.records.object(&digest)? {
                stats.logical_bytes += obj.size_bytes;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryObjectBackend;
    use crate::bloom::{IndexConfig, MembershipIndex};
    use crate::cache::LookupCacheConfig;
    use crate::cas::ContentHints;
    use crate::chunker::BlockConfig;
    use crate::encryption::{ConvergentCipher, EncryptionConfig};
    use crate::metrics::DedupMetrics;
    use crate::records::MemoryRecordStore;
    use bytes::Bytes;

    fn registry() -> (OwnershipRegistry, Arc<ContentStore>, Arc<MemoryRecordStore>) {
        let records = Arc::new(MemoryRecordStore::new());
        let cipher = Arc::new(
            ConvergentCipher::new(EncryptionConfig {
                kdf_iterations: 10,
                ..EncryptionConfig::default()
            })
            .unwrap(),
        );
        let cas = Arc::new(
            ContentStore::new(
                records.clone(),
                Arc::new(MemoryObjectBackend::new("own")),
                cipher,
                Arc::new(MembershipIndex::new(IndexConfig::default()).unwrap()),
                &LookupCacheConfig::default(),
                BlockConfig::default(),
                Arc::new(DedupMetrics::new()),
            )
            .unwrap(),
        );
        (
            OwnershipRegistry::new(records.clone(), cas.clone()),
            cas,
            records,
        )
    }

    async fn upload(
        reg: &OwnershipRegistry,
        cas: &ContentStore,
        p: PrincipalId,
        data: &'static [u8],
    ) -> ContentDigest {
        let out = cas
            .put(Bytes::from_static(data), &ContentHints::default())
            .await
            .unwrap();
        reg.record_upload(p, &out.digest, None, out.is_new).unwrap();
        out.digest
    }

    #[tokio::test]
    async fn test_grant_is_idempotent() {
        let (reg, cas, _) = registry();
        let d = upload(&reg, &cas, 1, b"doc").await;
        let first = reg.grant(2, &d, VerificationMethod::Simple, None).unwrap();
        assert!(first.newly_granted);
        assert_eq!(first.reference_count, 2);
        let again = reg.grant(2, &d, VerificationMethod::Pow, None).unwrap();
        assert!(!again.newly_granted);
        assert_eq!(again.ownership.method, VerificationMethod::Simple);
        assert_eq!(cas.get(&d).unwrap().reference_count, 2);
    }

    #[tokio::test]
    async fn test_grant_missing_object() {
        let (reg, _, _) = registry();
        let d = ContentDigest::of(b"nothing");
        assert!(matches!(
            reg.grant(1, &d, VerificationMethod::Simple, None),
            Err(DedupError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_revoke_tracks_reference_count() {
        let (reg, cas, records) = registry();
        let d = upload(&reg, &cas, 1, b"shared doc").await;
        reg.share(1, 2, &d).unwrap();
        assert_eq!(cas.get(&d).unwrap().reference_count, 2);
        assert_eq!(records.owners_of(&d).unwrap().len(), 2);

        let out = reg.revoke(2, &d).unwrap();
        assert_eq!(out.reference_count, 1);
        assert_eq!(out.revoked.method, VerificationMethod::Shared);
        assert!(!reg.verify(2, &d).unwrap());
        assert!(reg.verify(1, &d).unwrap());
    }

    #[tokio::test]
    async fn test_revoke_absent_is_rejected() {
        let (reg, cas, _) = registry();
        let d = upload(&reg, &cas, 1, b"x").await;
        assert!(matches!(
            reg.revoke(9, &d),
            Err(DedupError::OwnershipNotFound { principal: 9, .. })
        ));
        assert_eq!(cas.get(&d).unwrap().reference_count, 1);
        reg.revoke(1, &d).unwrap();
        assert!(matches!(reg.revoke(1, &d), Err(DedupError::OwnershipNotFound { .. })));
        assert_eq!(cas.get(&d).unwrap().reference_count, 0);
        assert_eq!(cas.reclaimable().unwrap(), vec![d]);
    }

    #[tokio::test]
    async fn test_share_requires_owner() {
        let (reg, cas, _) = registry();
        let d = upload(&reg, &cas, 1, b"private").await;
        assert!(matches!(reg.share(5, 6, &d), Err(DedupError::NotOwner { principal: 5, .. })));
        assert!(!reg.verify(6, &d).unwrap());
    }

    #[tokio::test]
    async fn test_principal_stats() {
        let (reg, cas, _) = registry();
        let a = upload(&reg, &cas, 1, b"alpha").await;
        upload(&reg, &cas, 1, b"alpha").await;
        let b = upload(&reg, &cas, 2, b"bravo!").await;
        reg.share(2, 1, &b).unwrap();

        let stats = reg.principal_stats(1).unwrap();
        assert_eq!(stats.rows, 3);
        assert_eq!(stats.objects, 2);
        assert_eq!(stats.logical_bytes, 11);
        assert_eq!(stats.by_method[&VerificationMethod::Upload], 2);
        assert_eq!(stats.by_method[&VerificationMethod::Shared], 1);
        assert_eq!(reg.owners_of(&b).unwrap(), vec![1, 2]);
        assert_eq!(reg.objects_of(2).unwrap(), vec![b]);
        assert!(reg.objects_of(1).unwrap().contains(&a));
    }
}
