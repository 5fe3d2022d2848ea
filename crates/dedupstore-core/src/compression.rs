//! LZ4 and Zstd codecs for persisted index blobs

use serde::{Deserialize, Serialize};

use crate::error::{DedupError, DedupResult};

/// Compression algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    /// No compression (passthrough)
    None,
    /// LZ4 block format with prepended size
    Lz4,
    /// Zstandard
    Zstd {
        /// Compression level (1=fastest, 19=best ratio)
        level: i32,
    },
}

impl Default for CompressionAlgorithm {
    fn default() -> Self {
        Self::Zstd { level: 6 }
    }
}

/// Size accounting for one compression call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressionStats {
    /// Input length
    pub raw_bytes: u64,
    /// Output length
    pub compressed_bytes: u64,
}

impl CompressionStats {
    /// raw / compressed; 1.0 when nothing was compressed.
    pub fn ratio(&self) -> f64 {
        if self.compressed_bytes == 0 {
            1.0
        } else {
            self.raw_bytes as f64 / self.compressed_bytes as f64
        }
    }
}

/// Compress data with the given algorithm.
pub fn compress(data: &[u8], algo: CompressionAlgorithm) -> DedupResult<Vec<u8>> {
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionAlgorithm::Zstd { level } => {
            zstd::encode_all(data, level).map_err(|e| DedupError::CompressionFailed(e.to_string()))
        }
    }
}

/// Compress and report sizes.
pub fn compress_with_stats(
    data: &[u8],
    algo: CompressionAlgorithm,
) -> DedupResult<(Vec<u8>, CompressionStats)> {
    let out = compress(data, algo)?;
    let stats = CompressionStats {
        raw_bytes: data.len() as u64,
        compressed_bytes: out.len() as u64,
    };
    Ok((out, stats))
}

/// Decompress data using the algorithm that was used for compression.
pub fn decompress(data: &[u8], algo: CompressionAlgorithm) -> DedupResult<Vec<u8>> {
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| DedupError::DecompressionFailed(e.to_string())),
        CompressionAlgorithm::Zstd { .. } => {
            zstd::decode_all(data).map_err(|e| DedupError::DecompressionFailed(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_lz4_roundtrip(data in prop::collection::vec(0u8..=255, 0..50_000)) {
            let c = compress(&data, CompressionAlgorithm::Lz4).unwrap();
            prop_assert_eq!(decompress(&c, CompressionAlgorithm::Lz4).unwrap(), data);
        }

        #[test]
        fn prop_zstd_roundtrip(data in prop::collection::vec(0u8..=255, 0..50_000)) {
            let algo = CompressionAlgorithm::Zstd { level: 3 };
            let c = compress(&data, algo).unwrap();
            prop_assert_eq!(decompress(&c, algo).unwrap(), data);
        }
    }

    #[test]
    fn test_sparse_bitmap_compresses_well() {
        let mut bits = vec![0u8; 125_000];
        bits[10] = 0x80;
        bits[90_000] = 0x01;
        let (c, stats) = compress_with_stats(&bits, CompressionAlgorithm::default()).unwrap();
        assert!(stats.ratio() > 100.0);
        assert_eq!(decompress(&c, CompressionAlgorithm::default()).unwrap(), bits);
    }

    #[test]
    fn test_garbage_fails_decompression() {
        let err = decompress(b"not zstd at all", CompressionAlgorithm::Zstd { level: 6 });
        assert!(matches!(err, Err(DedupError::DecompressionFailed(_))));
    }

    #[test]
    fn test_empty_stats_ratio() {
        assert_eq!(CompressionStats::default().ratio(), 1.0);
    }
}
