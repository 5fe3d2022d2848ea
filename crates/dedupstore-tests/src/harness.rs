//! Test harness: throwaway stores with cheap crypto settings

use std::path::Path;
use std::sync::Arc;

use dedupstore_core::{
    DedupEngine, LocalDiskBackend, MemoryRecordStore, ObjectBackend, PowConfig, RecordStore, StoreConfig,
};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tempfile::TempDir;

/// Defaults with a low KDF cost, easy proofs and a small KEK tree.
pub fn fast_config() -> StoreConfig {
    let mut config = StoreConfig::default();
    config.encryption.kdf_iterations = 10;
    config.encryption.parallel_chunk_size = 4096;
    config.encryption.parallel_threshold = 8192;
    config.pow = PowConfig {
        difficulty: 1,
        min_difficulty: 1,
        max_difficulty: 2,
        ..PowConfig::default()
    };
    config.kek.leaf_count = 16;
    config
}

/// Reproducible pseudo-random bytes.
pub fn seeded_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut out);
    out
}

/// Route engine logs to the test writer; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// An engine over a temp directory, reopenable with the same records and payloads.
pub struct TestStore {
    temp_dir: TempDir,
    config: StoreConfig,
    records: Arc<MemoryRecordStore>,
}

impl TestStore {
    /// Fresh store with [`fast_config`].
    pub fn new() -> anyhow::Result<Self> {
        Self::with_config(fast_config())
    }

    /// Fresh store with `config`; the data directory is replaced by a temp dir.
    pub fn with_config(mut config: StoreConfig) -> anyhow::Result<Self> {
        init_tracing();
        let temp_dir = tempfile::tempdir()?;
        config.storage.data_dir = temp_dir.path().to_path_buf();
        let records = Arc::new(MemoryRecordStore::new());
        Ok(Self {
            temp_dir,
            config,
            records,
        })
    }

    /// Open an engine over the store's records and payload directory.
    pub fn open(&self) -> anyhow::Result<DedupEngine> {
        let records: Arc<dyn RecordStore> = self.records.clone();
        let backend: Arc<dyn ObjectBackend> = Arc::new(LocalDiskBackend::new(self.dir()));
        Ok(DedupEngine::open(self.config.clone(), records, backend)?)
    }

    /// Temp directory holding the payloads.
    pub fn dir(&self) -> &Path {
        self.temp_dir.path()
    }

    /// The shared record store.
    pub fn records(&self) -> &Arc<MemoryRecordStore> {
        &self.records
    }

    /// Active config.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}
