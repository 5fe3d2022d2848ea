//! Restarts from record snapshots, and failure paths that must not leave partial output

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use bytes::Bytes;
    use dedupstore_core::cas::object_key;
    use dedupstore_core::{
        DedupEngine, DedupError, IndexLoadOutcome, LocalDiskBackend, MemoryRecordStore,
        ObjectBackend, RecordStore, StoreConfig,
    };

    use crate::harness::{fast_config, seeded_bytes, TestStore};

    fn open_snapshot(dir: &Path, config: &StoreConfig) -> (Arc<MemoryRecordStore>, DedupEngine) {
        let records = Arc::new(MemoryRecordStore::open(dir.join("records.json")).unwrap());
        let backend: Arc<dyn ObjectBackend> = Arc::new(LocalDiskBackend::new(dir.join("data")));
        let shared: Arc<dyn RecordStore> = records.clone();
        let engine = DedupEngine::open(config.clone(), shared, backend).unwrap();
        (records, engine)
    }

    #[tokio::test]
    async fn test_snapshot_restart_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = fast_config();
        let data = seeded_bytes(77, 30_000);

        let d = {
            let (records, engine) = open_snapshot(dir.path(), &config);
            let d = engine
                .upload(Bytes::from(data.clone()), "big.bin", 1)
                .await
                .unwrap()
                .object_id;
            engine.upload(Bytes::from(data.clone()), "copy.bin", 2).await.unwrap();
            engine.revoke_ownership(1, &d).unwrap();
            engine.force_flush_key_updates().unwrap();
            records.persist().unwrap();
            d
        };

        let (records, engine) = open_snapshot(dir.path(), &config);
        assert!(matches!(
            engine.index_load_outcome(),
            IndexLoadOutcome::Loaded { items: 1 }
        ));
        assert_eq!(engine.content_store().get(&d).unwrap().reference_count, 1);
        assert_eq!(records.owners_of(&d).unwrap().len(), 1);
        assert!(!engine.verify_ownership(1, &d).unwrap());
        assert_eq!(engine.download(2, &d).await.unwrap(), data);

        let again = engine.upload(Bytes::from(data), "third", 3).await.unwrap();
        assert!(again.is_duplicate);
        assert_eq!(again.reference_count, 2);
    }

    #[tokio::test]
    async fn test_missing_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (records, engine) = open_snapshot(dir.path(), &fast_config());
        assert!(records.objects().unwrap().is_empty());
        assert!(matches!(
            engine.index_load_outcome(),
            IndexLoadOutcome::Rebuilt { items: 0, .. }
        ));
    }

    #[test]
    fn test_unknown_snapshot_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        std::fs::write(
            &path,
            r#"{"version":99,"objects":[],"blocks":[],"manifests":[],"ownerships":[],"kek_nodes":[],"index_state":null}"#,
        )
        .unwrap();
        assert!(matches!(
            MemoryRecordStore::open(&path),
            Err(DedupError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_non_owner_download_leaves_no_file() {
        let store = TestStore::new().unwrap();
        let engine = store.open().unwrap();
        let d = engine
            .upload(Bytes::from_static(b"private"), "p", 1)
            .await
            .unwrap()
            .object_id;
        let out = store.dir().join("stolen.txt");
        let err = engine.download_to(9, &d, &out).await.unwrap_err();
        assert!(matches!(err, DedupError::OwnershipNotFound { principal: 9, .. }));
        assert!(!out.exists());

        let written = engine.download_to(1, &d, &out).await.unwrap();
        assert_eq!(written, 7);
        assert_eq!(std::fs::read(&out).unwrap(), b"private");
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_fails_download() {
        let store = TestStore::new().unwrap();
        let engine = store.open().unwrap();
        let data = seeded_bytes(88, 2_000);
        let d = engine
            .upload(Bytes::from(data), "t", 1)
            .await
            .unwrap()
            .object_id;

        let payload = store.dir().join(object_key(&d));
        let mut sealed = std::fs::read(&payload).unwrap();
        let mid = sealed.len() / 2;
        sealed[mid] ^= 0x01;
        std::fs::write(&payload, &sealed).unwrap();

        let out = store.dir().join("tampered.out");
        assert!(engine.download_to(1, &d, &out).await.is_err());
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_missing_payload_reports_not_found() {
        let store = TestStore::new().unwrap();
        let engine = store.open().unwrap();
        let d = engine
            .upload(Bytes::from_static(b"gone soon"), "g", 1)
            .await
            .unwrap()
            .object_id;
        std::fs::remove_file(store.dir().join(object_key(&d))).unwrap();
        assert!(matches!(
            engine.download(1, &d).await,
            Err(DedupError::NotFound { .. })
        ));
    }
}
