//! Dedup idempotence and reference counting through the engine

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use dedupstore_core::{ContentDigest, DedupError, RecordStore, VerificationMethod};

    use crate::harness::{seeded_bytes, TestStore};

    #[tokio::test]
    async fn test_hello_world_two_principals() {
        let store = TestStore::new().unwrap();
        let engine = store.open().unwrap();

        let first = engine
            .upload(Bytes::from_static(b"hello world"), "a.txt", 1)
            .await
            .unwrap();
        let second = engine
            .upload(Bytes::from_static(b"hello world"), "b.txt", 2)
            .await
            .unwrap();

        assert!(!first.is_duplicate);
        assert!(second.is_duplicate);
        assert_eq!(second.bytes_saved, 11);
        let obj = engine.content_store().get(&second.object_id).unwrap();
        assert_eq!(obj.reference_count, 2);
        assert_eq!(obj.size_bytes, 11);

        let rows = store.records().owners_of(&first.object_id).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().filter(|r| r.original).count(), 1);
        let names: Vec<_> = rows.iter().filter_map(|r| r.filename.clone()).collect();
        assert!(names.contains(&"a.txt".to_string()));
        assert!(names.contains(&"b.txt".to_string()));
    }

    #[tokio::test]
    async fn test_n_uploads_one_object() {
        let store = TestStore::new().unwrap();
        let engine = store.open().unwrap();
        let data = seeded_bytes(11, 20_000);
        for i in 0..7u64 {
            engine
                .upload(Bytes::from(data.clone()), &format!("copy-{i}"), i % 3)
                .await
                .unwrap();
        }
        let d = ContentDigest::of(&data);
        assert_eq!(store.records().objects().unwrap().len(), 1);
        assert_eq!(engine.content_store().get(&d).unwrap().reference_count, 7);
        assert_eq!(store.records().owners_of(&d).unwrap().len(), 7);
        let payloads = std::fs::read_dir(store.dir().join("objects"))
            .unwrap()
            .flat_map(|e| std::fs::read_dir(e.unwrap().path()).unwrap())
            .count();
        assert_eq!(payloads, 1);
    }

    #[tokio::test]
    async fn test_concurrent_uploads_store_once() {
        let store = TestStore::new().unwrap();
        let engine = Arc::new(store.open().unwrap());
        let data = Bytes::from(seeded_bytes(5, 50_000));

        let mut handles = Vec::new();
        for p in 0..10u64 {
            let engine = Arc::clone(&engine);
            let data = data.clone();
            handles.push(tokio::spawn(async move {
                engine.upload(data, "same", p).await.unwrap()
            }));
        }
        let mut new_count = 0;
        for h in handles {
            if !h.await.unwrap().is_duplicate {
                new_count += 1;
            }
        }
        assert_eq!(new_count, 1);
        let d = ContentDigest::of(&data);
        assert_eq!(engine.content_store().get(&d).unwrap().reference_count, 10);
        assert_eq!(store.records().owners_of(&d).unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_filename_does_not_affect_identity() {
        let store = TestStore::new().unwrap();
        let engine = store.open().unwrap();
        let a = engine.upload(Bytes::from_static(b"x"), "one.bin", 1).await.unwrap();
        let b = engine.upload(Bytes::from_static(b"y"), "one.bin", 1).await.unwrap();
        assert_ne!(a.object_id, b.object_id);
        assert!(!b.is_duplicate);
    }

    #[tokio::test]
    async fn test_refcount_matches_ownership_rows() {
        let store = TestStore::new().unwrap();
        let engine = store.open().unwrap();
        let d = engine
            .upload(Bytes::from_static(b"tracked"), "t", 1)
            .await
            .unwrap()
            .object_id;
        engine.upload(Bytes::from_static(b"tracked"), "t", 1).await.unwrap();
        engine.share(1, 2, &d).unwrap();
        engine.share(1, 2, &d).unwrap();
        engine.grant_ownership(3, &d).unwrap();
        engine.revoke_ownership(1, &d).unwrap();

        let check = |expected: u64| {
            let obj = engine.content_store().get(&d).unwrap();
            let rows = store.records().owners_of(&d).unwrap().len() as u64;
            assert_eq!(obj.reference_count, expected);
            assert_eq!(rows, expected);
        };
        check(3);
        assert!(engine.verify_ownership(1, &d).unwrap());

        engine.revoke_ownership(1, &d).unwrap();
        engine.revoke_ownership(2, &d).unwrap();
        engine.revoke_ownership(3, &d).unwrap();
        check(0);
        assert_eq!(engine.content_store().reclaimable().unwrap(), vec![d]);
    }

    #[tokio::test]
    async fn test_revoke_without_ownership_is_rejected() {
        let store = TestStore::new().unwrap();
        let engine = store.open().unwrap();
        let d = engine
            .upload(Bytes::from_static(b"owned once"), "o", 1)
            .await
            .unwrap()
            .object_id;
        engine.revoke_ownership(1, &d).unwrap();
        let err = engine.revoke_ownership(1, &d).unwrap_err();
        assert!(matches!(err, DedupError::OwnershipNotFound { .. }));
        assert_eq!(engine.content_store().get(&d).unwrap().reference_count, 0);
        assert!(matches!(
            engine.content_store().decrement_reference(&d),
            Err(DedupError::ReferenceUnderflow { .. })
        ));
        assert_eq!(engine.content_store().get(&d).unwrap().reference_count, 0);
    }

    #[tokio::test]
    async fn test_principal_stats_by_method() {
        let store = TestStore::new().unwrap();
        let engine = store.open().unwrap();
        let a = engine.upload(Bytes::from_static(b"aaaa"), "a", 1).await.unwrap().object_id;
        let b = engine.upload(Bytes::from_static(b"bb"), "b", 2).await.unwrap().object_id;
        engine.share(2, 1, &b).unwrap();
        let stats = engine.principal_stats(1).unwrap();
        assert_eq!(stats.objects, 2);
        assert_eq!(stats.logical_bytes, 6);
        assert_eq!(stats.by_method.get(&VerificationMethod::Upload), Some(&1));
        assert_eq!(stats.by_method.get(&VerificationMethod::Shared), Some(&1));
        assert_eq!(engine.ownership().objects_of(1).unwrap().len(), 2);
        assert!(engine.ownership().owners_of(&a).unwrap() == vec![1]);
    }
}
