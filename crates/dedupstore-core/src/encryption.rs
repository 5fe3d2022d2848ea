//! Convergent encryption: content-derived keys, serial and parallel-chunked framing.
//!
//! The key for a payload is PBKDF2-HMAC-SHA256 over the hex digest of the
//! plaintext with a fixed salt, so equal plaintexts always produce equal
//! keys. Nonces are derived from the key and the chunk position, which makes
//! the whole ciphertext deterministic.
//!
//! Framing:
//!
//! ```text
//! serial:   [0x01][sealed]
//! parallel: [0x02][count: u32 BE] ( [len: u32 BE][sealed] ) * count
//! ```
//!
//! Every sealed unit authenticates the framing tag, its index and the chunk
//! count as associated data, so chunks cannot be reordered or moved between
//! framings without failing authentication.

use std::time::{Duration, Instant};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::digest::ContentDigest;
use crate::error::{DedupError, DedupResult};
use crate::records::EncryptionMethod;

/// Serial framing tag.
pub const SERIAL_TAG: u8 = 0x01;
/// Parallel-chunked framing tag.
pub const PARALLEL_TAG: u8 = 0x02;

const NONCE_INFO: &[u8] = b"dedupstore-convergent-nonce";

/// AEAD cipher selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncryptionAlgorithm {
    /// AES-256-GCM, hardware accelerated on x86 with AES-NI
    #[default]
    AesGcm256,
    /// ChaCha20-Poly1305, fast on hardware without AES instructions
    ChaCha20Poly1305,
}

/// Encryption pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// AEAD used for every sealed unit
    pub algorithm: EncryptionAlgorithm,
    /// PBKDF2 iteration count (default 100 000)
    pub kdf_iterations: u32,
    /// Fixed PBKDF2 salt shared by every deployment of a store
    pub kdf_salt: String,
    /// Chunk size for the parallel framing (default 1 MiB)
    pub parallel_chunk_size: usize,
    /// Worker threads for chunk fan-out (default 4)
    pub workers: usize,
    /// Payloads at least this large use the parallel framing
    pub parallel_threshold: usize,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            algorithm: EncryptionAlgorithm::AesGcm256,
            kdf_iterations: 100_000,
            kdf_salt: "salt_secure_dedup_2024".to_string(),
            parallel_chunk_size: 1024 * 1024,
            workers: 4,
            parallel_threshold: 1024 * 1024,
        }
    }
}

/// 256-bit key derived from content.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ConvergentKey(pub [u8; 32]);

impl std::fmt::Debug for ConvergentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConvergentKey([REDACTED])")
    }
}

/// Ciphertext plus the framing that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    /// Framed ciphertext
    pub bytes: Vec<u8>,
    /// Which framing was used
    pub method: EncryptionMethod,
}

/// Serial vs parallel timing for one payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionBenchmark {
    /// Payload length
    pub size_bytes: usize,
    /// Serial encryption time
    pub serial: Duration,
    /// Parallel encryption time
    pub parallel: Duration,
    /// Worker threads used
    pub workers: usize,
}

impl EncryptionBenchmark {
    /// serial / parallel
    pub fn speedup(&self) -> f64 {
        let p = self.parallel.as_secs_f64();
        if p == 0.0 {
            1.0
        } else {
            self.serial.as_secs_f64() / p
        }
    }
}

/// Convergent cipher with a bounded worker pool for chunk fan-out.
pub struct ConvergentCipher {
    config: EncryptionConfig,
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for ConvergentCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvergentCipher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ConvergentCipher {
    /// Build the cipher and its worker pool.
    pub fn new(config: EncryptionConfig) -> DedupResult<Self> {
        if config.parallel_chunk_size == 0 || config.workers == 0 || config.kdf_iterations == 0 {
            return Err(DedupError::InvalidConfig(
                "chunk size, workers and kdf iterations must be non-zero".into(),
            ));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("dedup-crypt-{i}"))
            .build()
            .map_err(|e| DedupError::Worker(e.to_string()))?;
        Ok(Self { config, pool })
    }

    /// Active configuration.
    pub fn config(&self) -> &EncryptionConfig {
        &self.config
    }

    /// Derive the convergent key for a digest.
    pub fn derive_key(&self, digest: &ContentDigest) -> ConvergentKey {
        let mut out = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            digest.to_hex().as_bytes(),
            self.config.kdf_salt.as_bytes(),
            self.config.kdf_iterations,
            &mut out,
        );
        ConvergentKey(out)
    }

    /// Encrypt choosing the framing by payload size.
    pub fn encrypt(&self, plaintext: &[u8], digest: &ContentDigest) -> DedupResult<SealedPayload> {
        if plaintext.len() >= self.config.parallel_threshold {
            Ok(SealedPayload {
                bytes: self.encrypt_parallel(plaintext, digest)?,
                method: EncryptionMethod::ConvergentParallel,
            })
        } else {
            Ok(SealedPayload {
                bytes: self.encrypt_serial(plaintext, digest)?,
                method: EncryptionMethod::Convergent,
            })
        }
    }

    /// Decrypt either framing, dispatching on the tag byte.
    pub fn decrypt(&self, ciphertext: &[u8], digest: &ContentDigest) -> DedupResult<Vec<u8>> {
        match ciphertext.first() {
            Some(&SERIAL_TAG) => self.decrypt_serial(ciphertext, digest),
            Some(&PARALLEL_TAG) => self.decrypt_parallel(ciphertext, digest),
            Some(&other) => Err(DedupError::FormatMismatch {
                expected: "serial or parallel",
                found: other,
            }),
            None => Err(DedupError::MalformedFrame("empty ciphertext".into())),
        }
    }

    /// Single-pass encryption.
    pub fn encrypt_serial(&self, plaintext: &[u8], digest: &ContentDigest) -> DedupResult<Vec<u8>> {
        let key = self.derive_key(digest);
        let sealed = self.seal(&key, SERIAL_TAG, 0, 1, plaintext)?;
        let mut out = Vec::with_capacity(1 + sealed.len());
        out.push(SERIAL_TAG);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypt the serial framing only.
    pub fn decrypt_serial(&self, ciphertext: &[u8], digest: &ContentDigest) -> DedupResult<Vec<u8>> {
        match ciphertext.first() {
            Some(&SERIAL_TAG) => {}
            Some(&found) => {
                return Err(DedupError::FormatMismatch {
                    expected: "serial",
                    found,
                })
            }
            None => return Err(DedupError::MalformedFrame("empty ciphertext".into())),
        }
        let key = self.derive_key(digest);
        self.open(&key, SERIAL_TAG, 0, 1, &ciphertext[1..])
    }

    /// Split into fixed-size chunks and seal them concurrently on the worker pool.
    pub fn encrypt_parallel(&self, plaintext: &[u8], digest: &ContentDigest) -> DedupResult<Vec<u8>> {
        let key = self.derive_key(digest);
        let chunks: Vec<&[u8]> = if plaintext.is_empty() {
            vec![plaintext]
        } else {
            plaintext.chunks(self.config.parallel_chunk_size).collect()
        };
        let count = u32::try_from(chunks.len())
            .map_err(|_| DedupError::EncryptionFailed("too many chunks".into()))?;

        let sealed: Vec<Vec<u8>> = self.pool.install(|| {
            chunks
                .par_iter()
                .enumerate()
                .map(|(i, chunk)| self.seal(&key, PARALLEL_TAG, i as u32, count, chunk))
                .collect::<DedupResult<Vec<_>>>()
        })?;

        let body: usize = sealed.iter().map(|s| s.len() + 4).sum();
        let mut out = Vec::with_capacity(5 + body);
        out.push(PARALLEL_TAG);
        out.extend_from_slice(&count.to_be_bytes());
        for s in &sealed {
            out.extend_from_slice(&(s.len() as u32).to_be_bytes());
            out.extend_from_slice(s);
        }
        debug!(chunks = count, bytes = plaintext.len(), "parallel encrypt");
        Ok(out)
    }

    /// Decrypt the parallel framing only, reassembling chunks in stream order.
    pub fn decrypt_parallel(&self, ciphertext: &[u8], digest: &ContentDigest) -> DedupResult<Vec<u8>> {
        let frames = split_parallel_frames(ciphertext)?;
        let count = frames.len() as u32;
        let key = self.derive_key(digest);

        let parts: Vec<Vec<u8>> = self.pool.install(|| {
            frames
                .par_iter()
                .enumerate()
                .map(|(i, frame)| self.open(&key, PARALLEL_TAG, i as u32, count, frame))
                .collect::<DedupResult<Vec<_>>>()
        })?;

        let mut out = Vec::with_capacity(parts.iter().map(Vec::len).sum());
        for p in parts {
            out.extend_from_slice(&p);
        }
        Ok(out)
    }

    /// Serially seal many independent payloads across the pool, preserving input order.
    pub fn encrypt_many(&self, items: &[(ContentDigest, &[u8])]) -> DedupResult<Vec<Vec<u8>>> {
        self.pool.install(|| {
            items
                .par_iter()
                .map(|(d, data)| self.encrypt_serial(data, d))
                .collect()
        })
    }

    /// Inverse of [`Self::encrypt_many`].
    pub fn decrypt_many(&self, items: &[(ContentDigest, Vec<u8>)]) -> DedupResult<Vec<Vec<u8>>> {
        self.pool.install(|| {
            items
                .par_iter()
                .map(|(d, ct)| self.decrypt_serial(ct, d))
                .collect()
        })
    }

    /// Time serial against parallel encryption of the same payload.
    pub fn benchmark(&self, plaintext: &[u8]) -> DedupResult<EncryptionBenchmark> {
        let digest = ContentDigest::of(plaintext);
        let start = Instant::now();
        let serial = self.encrypt_serial(plaintext, &digest)?;
        let serial_time = start.elapsed();
        let start = Instant::now();
        let parallel = self.encrypt_parallel(plaintext, &digest)?;
        let parallel_time = start.elapsed();
        debug!(
            serial_len = serial.len(),
            parallel_len = parallel.len(),
            "benchmark complete"
        );
        Ok(EncryptionBenchmark {
            size_bytes: plaintext.len(),
            serial: serial_time,
            parallel: parallel_time,
            workers: self.config.workers,
        })
    }

    fn nonce(key: &ConvergentKey, tag: u8, index: u32) -> DedupResult<[u8; 12]> {
        let hk = Hkdf::<Sha256>::new(None, &key.0);
        let mut info = Vec::with_capacity(NONCE_INFO.len() + 5);
        info.extend_from_slice(NONCE_INFO);
        info.push(tag);
        info.extend_from_slice(&index.to_be_bytes());
        let mut nonce = [0u8; 12];
        hk.expand(&info, &mut nonce)
            .map_err(|e| DedupError::EncryptionFailed(e.to_string()))?;
        Ok(nonce)
    }

    fn aad(tag: u8, index: u32, count: u32) -> [u8; 9] {
        let mut aad = [0u8; 9];
        aad[0] = tag;
        aad[1..5].copy_from_slice(&index.to_be_bytes());
        aad[5..9].copy_from_slice(&count.to_be_bytes());
        aad
    }

    fn seal(
        &self,
        key: &ConvergentKey,
        tag: u8,
        index: u32,
        count: u32,
        plaintext: &[u8],
    ) -> DedupResult<Vec<u8>> {
        let nonce = Self::nonce(key, tag, index)?;
        let aad = Self::aad(tag, index, count);
        let payload = Payload {
            msg: plaintext,
            aad: &aad,
        };
        match self.config.algorithm {
            EncryptionAlgorithm::AesGcm256 => {
                let cipher = Aes256Gcm::new_from_slice(&key.0)
                    .map_err(|e| DedupError::EncryptionFailed(e.to_string()))?;
                cipher
                    .encrypt(aes_gcm::Nonce::from_slice(&nonce), payload)
                    .map_err(|e| DedupError::EncryptionFailed(e.to_string()))
            }
            EncryptionAlgorithm::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                    .map_err(|e| DedupError::EncryptionFailed(e.to_string()))?;
                cipher
                    .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), payload)
                    .map_err(|e| DedupError::EncryptionFailed(e.to_string()))
            }
        }
    }

    fn open(
        &self,
        key: &ConvergentKey,
        tag: u8,
        index: u32,
        count: u32,
        sealed: &[u8],
    ) -> DedupResult<Vec<u8>> {
        let nonce = Self::nonce(key, tag, index)?;
        let aad = Self::aad(tag, index, count);
        let payload = Payload {
            msg: sealed,
            aad: &aad,
        };
        match self.config.algorithm {
            EncryptionAlgorithm::AesGcm256 => {
                let cipher = Aes256Gcm::new_from_slice(&key.0)
                    .map_err(|e| DedupError::EncryptionFailed(e.to_string()))?;
                cipher
                    .decrypt(aes_gcm::Nonce::from_slice(&nonce), payload)
                    .map_err(|_| DedupError::DecryptionAuthFailed)
            }
            EncryptionAlgorithm::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                    .map_err(|e| DedupError::EncryptionFailed(e.to_string()))?;
                cipher
                    .decrypt(chacha20poly1305::Nonce::from_slice(&nonce), payload)
                    .map_err(|_| DedupError::DecryptionAuthFailed)
            }
        }
    }
}

fn read_u32(buf: &[u8], at: usize) -> DedupResult<u32> {
    buf.get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| DedupError::MalformedFrame(format!("truncated length at offset {at}")))
}

fn split_parallel_frames(ciphertext: &[u8]) -> DedupResult<Vec<&[u8]>> {
    match ciphertext.first() {
        Some(&PARALLEL_TAG) => {}
        Some(&found) => {
            return Err(DedupError::FormatMismatch {
                expected: "parallel",
                found,
            })
        }
        None => return Err(DedupError::MalformedFrame("empty ciphertext".into())),
    }
    let count = read_u32(ciphertext, 1)? as usize;
    if count == 0 {
        return Err(DedupError::MalformedFrame("zero chunk count".into()));
    }
    let mut frames = Vec::with_capacity(count.min(4096));
    let mut pos = 5;
    for i in 0..count {
        let len = read_u32(ciphertext, pos)? as usize;
        pos += 4;
        let frame = ciphertext.get(pos..pos + len).ok_or_else(|| {
            DedupError::MalformedFrame(format!("chunk {i} of {count} truncated"))
        })?;
        frames.push(frame);
        pos += len;
    }
    if pos != ciphertext.len() {
        return Err(DedupError::MalformedFrame(format!(
            "{} trailing bytes",
            ciphertext.len() - pos
        )));
    }
    Ok(frames)
}
