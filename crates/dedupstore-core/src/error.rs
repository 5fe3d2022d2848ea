//! Error types for the dedupstore engine

/// Result alias used throughout the engine.
pub type DedupResult<T> = Result<T, DedupError>;

/// All errors that can occur inside the deduplicating store.
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    /// Digest, object, block, node or ownership row does not exist
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was being looked up ("object", "block", "kek node", ...)
        kind: &'static str,
        /// Identifier that was requested
        id: String,
    },
    /// Decrypted or reconstructed bytes do not hash to the recorded digest
    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityFailure {
        /// Digest recorded at store time
        expected: String,
        /// Digest of the bytes actually produced
        actual: String,
    },
    /// Remote or local storage backend cannot be reached
    #[error("storage backend {backend} unavailable: {reason}")]
    StorageBackendUnavailable {
        /// Backend name
        backend: String,
        /// Underlying reason
        reason: String,
    },
    /// Proof-of-ownership nonce does not satisfy the challenge difficulty
    #[error("invalid proof: response {response} lacks {difficulty} leading zeros")]
    InvalidProof {
        /// Difficulty the challenge was issued with
        difficulty: u32,
        /// Response hash computed from the submitted nonce
        response: String,
    },
    /// No challenge was issued for this (principal, object) pair
    #[error("no active challenge for principal {principal} on {digest}")]
    NoActiveChallenge {
        /// Principal that submitted the proof
        principal: u64,
        /// Object the proof was for
        digest: String,
    },
    /// Challenge outlived its configured time-to-live
    #[error("challenge expired for principal {principal} on {digest}")]
    ChallengeExpired {
        /// Principal that submitted the proof
        principal: u64,
        /// Object the proof was for
        digest: String,
    },
    /// Persisted membership index could not be parsed or decompressed
    #[error("corrupt membership index state: {0}")]
    CorruptIndexState(String),
    /// Decrement requested on a reference count that is already zero
    #[error("reference count underflow for {kind} {id}")]
    ReferenceUnderflow {
        /// "object" or "block"
        kind: &'static str,
        /// Digest whose count would drop below zero
        id: String,
    },
    /// Principal holds no ownership of the object
    #[error("principal {principal} does not own {digest}")]
    OwnershipNotFound {
        /// Principal id
        principal: u64,
        /// Object digest
        digest: String,
    },
    /// Sharing principal does not own the object being shared
    #[error("principal {principal} cannot share {digest}: not an owner")]
    NotOwner {
        /// Would-be sharer
        principal: u64,
        /// Object digest
        digest: String,
    },
    /// Ciphertext framing tag does not match the decoder being used
    #[error("ciphertext format mismatch: expected {expected}, found tag {found:#04x}")]
    FormatMismatch {
        /// Framing the decoder accepts
        expected: &'static str,
        /// Tag byte actually present
        found: u8,
    },
    /// Ciphertext frame is truncated or its header is inconsistent
    #[error("malformed ciphertext frame: {0}")]
    MalformedFrame(String),
    /// Encryption operation failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    /// Decryption authentication tag mismatch
    #[error("Decryption failed: authentication tag mismatch (data may be corrupted)")]
    DecryptionAuthFailed,
    /// Compression operation failed
    #[error("Compression failed: {0}")]
    CompressionFailed(String),
    /// Decompression operation failed
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
    /// Configuration value is out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Record or blob (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Worker pool or blocking task failure
    #[error("worker failure: {0}")]
    Worker(String),
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DedupError {
    /// Shorthand for a [`DedupError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// True for conditions the caller may retry (new challenge, backend back online).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InvalidProof { .. }
                | Self::ChallengeExpired { .. }
                | Self::StorageBackendUnavailable { .. }
        )
    }
}

impl From<serde_json::Error> for DedupError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for DedupError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
