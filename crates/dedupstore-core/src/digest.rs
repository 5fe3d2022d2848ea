//! Content digests: SHA-256 identity of stored payloads

use std::io::Read;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::error::{DedupError, DedupResult};

/// Read size used when hashing a stream.
pub const STREAM_READ_SIZE: usize = 4096;

/// A 32-byte SHA-256 digest identifying a payload. Used as the object and block key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest(pub [u8; 32]);

impl ContentDigest {
    /// Digest of an in-memory payload.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Return the digest as a lowercase hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> DedupResult<Self> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut out)
            .map_err(|e| DedupError::Serialization(format!("bad digest {s:?}: {e}")))?;
        Ok(Self(out))
    }

    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for ContentDigest {
    type Err = DedupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ContentDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher for payloads that arrive in pieces.
#[derive(Default, Clone)]
pub struct DigestHasher {
    inner: Sha256,
    bytes: u64,
}

impl DigestHasher {
    /// Create an empty hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes += data.len() as u64;
    }

    /// Bytes consumed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Consume the hasher and return the digest.
    pub fn finalize(self) -> ContentDigest {
        ContentDigest(self.inner.finalize().into())
    }
}

/// Hash everything a reader yields, returning the digest and total length.
pub fn digest_reader<R: Read>(mut reader: R) -> DedupResult<(ContentDigest, u64)> {
    let mut hasher = DigestHasher::new();
    let mut buf = [0u8; STREAM_READ_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let len = hasher.bytes_hashed();
    Ok((hasher.finalize(), len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_vector() {
        let d = ContentDigest::of(b"hello world");
        assert_eq!(
            d.to_hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(d.short(), "b94d27b9");
    }

    #[test]
    fn test_hex_roundtrip_and_errors() {
        let d = ContentDigest::of(b"abc");
        assert_eq!(ContentDigest::from_hex(&d.to_hex()).unwrap(), d);
        assert!(ContentDigest::from_hex("zz").is_err());
        assert!(ContentDigest::from_hex("abcd").is_err());
    }

    #[test]
    fn test_serde_is_hex_string() {
        let d = ContentDigest::of(b"abc");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{}\"", d.to_hex()));
        let back: ContentDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn test_reader_matches_slice() {
        let data = vec![7u8; STREAM_READ_SIZE * 3 + 17];
        let (d, len) = digest_reader(&data[..]).unwrap();
        assert_eq!(len, data.len() as u64);
        assert_eq!(d, ContentDigest::of(&data));
    }

    proptest! {
        #[test]
        fn prop_incremental_equals_oneshot(data in prop::collection::vec(0u8..=255, 0..10_000), split in 0usize..10_000) {
            let split = split.min(data.len());
            let mut h = DigestHasher::new();
            h.update(&data[..split]);
            h.update(&data[split..]);
            prop_assert_eq!(h.finalize(), ContentDigest::of(&data));
        }
    }
}
