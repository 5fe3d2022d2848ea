//! Convergent encryption properties across both framings

#[cfg(test)]
mod tests {
    use dedupstore_core::{
        ContentDigest, ConvergentCipher, DedupError, EncryptionAlgorithm, EncryptionConfig, EncryptionMethod,
    };
    use proptest::prelude::*;

    use crate::harness::seeded_bytes;

    const CHUNK: usize = 1024;

    fn cipher(algorithm: EncryptionAlgorithm) -> ConvergentCipher {
        ConvergentCipher::new(EncryptionConfig {
            algorithm,
            kdf_iterations: 10,
            parallel_chunk_size: CHUNK,
            parallel_threshold: 4 * CHUNK,
            workers: 3,
            ..EncryptionConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_boundary_sizes_roundtrip_both_modes() {
        for algorithm in [EncryptionAlgorithm::AesGcm256, EncryptionAlgorithm::ChaCha20Poly1305] {
            let c = cipher(algorithm);
            for len in [0, 1, CHUNK - 1, CHUNK, CHUNK + 1, 4 * CHUNK - 1, 4 * CHUNK, 7 * CHUNK + 3] {
                let data = seeded_bytes(len as u64, len);
                let d = ContentDigest::of(&data);
                let serial = c.encrypt_serial(&data, &d).unwrap();
                assert_eq!(c.decrypt_serial(&serial, &d).unwrap(), data, "serial len {len}");
                let parallel = c.encrypt_parallel(&data, &d).unwrap();
                assert_eq!(c.decrypt_parallel(&parallel, &d).unwrap(), data, "parallel len {len}");
                assert_eq!(c.decrypt(&parallel, &d).unwrap(), data);
                assert_eq!(c.decrypt(&serial, &d).unwrap(), data);
            }
        }
    }

    #[test]
    fn test_threshold_selects_framing() {
        let c = cipher(EncryptionAlgorithm::AesGcm256);
        let small = seeded_bytes(1, 4 * CHUNK - 1);
        let large = seeded_bytes(2, 4 * CHUNK);
        let s = c.encrypt(&small, &ContentDigest::of(&small)).unwrap();
        let l = c.encrypt(&large, &ContentDigest::of(&large)).unwrap();
        assert_eq!(s.method, EncryptionMethod::Convergent);
        assert_eq!(l.method, EncryptionMethod::ConvergentParallel);
    }

    #[test]
    fn test_framings_are_not_interchangeable() {
        let c = cipher(EncryptionAlgorithm::AesGcm256);
        let data = seeded_bytes(3, 3 * CHUNK);
        let d = ContentDigest::of(&data);
        let parallel = c.encrypt_parallel(&data, &d).unwrap();
        let serial = c.encrypt_serial(&data, &d).unwrap();
        assert!(matches!(
            c.decrypt_serial(&parallel, &d),
            Err(DedupError::FormatMismatch { .. })
        ));
        assert!(matches!(
            c.decrypt_parallel(&serial, &d),
            Err(DedupError::FormatMismatch { .. })
        ));
    }

    #[test]
    fn test_convergence_across_instances() {
        let data = seeded_bytes(4, 10 * CHUNK);
        let d = ContentDigest::of(&data);
        let a = cipher(EncryptionAlgorithm::AesGcm256).encrypt(&data, &d).unwrap();
        let b = cipher(EncryptionAlgorithm::AesGcm256).encrypt(&data, &d).unwrap();
        assert_eq!(a.bytes, b.bytes);
    }

    #[test]
    fn test_wrong_digest_fails_authentication() {
        let c = cipher(EncryptionAlgorithm::AesGcm256);
        let data = seeded_bytes(5, 2 * CHUNK);
        let sealed = c.encrypt(&data, &ContentDigest::of(&data)).unwrap();
        let other = ContentDigest::of(b"someone else's content");
        assert!(c.decrypt(&sealed.bytes, &other).is_err());
    }

    #[test]
    fn test_chunk_swap_detected() {
        let c = cipher(EncryptionAlgorithm::AesGcm256);
        let data = seeded_bytes(6, 2 * CHUNK);
        let d = ContentDigest::of(&data);
        let mut sealed = c.encrypt_parallel(&data, &d).unwrap();
        // [tag][count][len0][chunk0][len1][chunk1], equal-length chunks
        let unit = (sealed.len() - 5) / 2;
        let (head, rest) = sealed.split_at_mut(5 + unit);
        head[5..].swap_with_slice(&mut rest[..unit]);
        assert!(c.decrypt_parallel(&sealed, &d).is_err());
    }

    #[test]
    fn test_batch_encrypt_preserves_order() {
        let c = cipher(EncryptionAlgorithm::ChaCha20Poly1305);
        let blocks: Vec<Vec<u8>> = (0..32).map(|i| seeded_bytes(i, 100 + i as usize)).collect();
        let items: Vec<(ContentDigest, &[u8])> = blocks
            .iter()
            .map(|b| (ContentDigest::of(b), b.as_slice()))
            .collect();
        let sealed = c.encrypt_many(&items).unwrap();
        let back: Vec<(ContentDigest, Vec<u8>)> = items
            .iter()
            .zip(sealed)
            .map(|((d, _), s)| (*d, s))
            .collect();
        assert_eq!(c.decrypt_many(&back).unwrap(), blocks);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_roundtrip_any_payload(data in prop::collection::vec(any::<u8>(), 0..(6 * CHUNK))) {
            let c = cipher(EncryptionAlgorithm::AesGcm256);
            let d = ContentDigest::of(&data);
            let sealed = c.encrypt(&data, &d).unwrap();
            prop_assert_eq!(c.decrypt(&sealed.bytes, &d).unwrap(), data.clone());
            let parallel = c.encrypt_parallel(&data, &d).unwrap();
            prop_assert_eq!(c.decrypt_parallel(&parallel, &d).unwrap(), data);
        }
    }
}
