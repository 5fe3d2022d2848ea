//! Object storage backends for encrypted payloads and blocks.
//!
//! Payloads are addressed by a relative key (`objects/ab/<digest>.enc`,
//! `blocks/<digest>.blk`). Each backend turns a key into a location string
//! that is recorded in the record store and handed back on reads.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DedupError, DedupResult};

/// Boxed future type for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Scheme prefix of the in-memory remote stand-in.
pub const MEMORY_SCHEME: &str = "mem://";

/// Where encrypted bytes are kept.
pub trait ObjectBackend: Send + Sync {
    /// Short name for logs and errors.
    fn name(&self) -> &str;
    /// Store bytes under `key`, returning the location to record.
    fn put(&self, key: &str, data: Vec<u8>) -> BoxFuture<'_, DedupResult<String>>;
    /// Fetch the bytes at a recorded location.
    fn get(&self, location: &str) -> BoxFuture<'_, DedupResult<Vec<u8>>>;
    /// Delete the bytes at a recorded location.
    fn delete(&self, location: &str) -> BoxFuture<'_, DedupResult<()>>;
    /// Check whether a location holds bytes.
    fn exists(&self, location: &str) -> BoxFuture<'_, DedupResult<bool>>;
    /// True if `location` was produced by this backend.
    fn owns(&self, location: &str) -> bool;
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for local payloads and the record snapshot
    pub data_dir: PathBuf,
    /// Keep payloads on local disk; when false the remote backend is primary
    pub use_local_storage: bool,
    /// Bucket name for the remote backend
    pub remote_bucket: String,
    /// Write to local disk when the remote backend is unreachable
    pub fallback_to_local: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./dedupstore-data"),
            use_local_storage: true,
            remote_bucket: "dedupstore".to_string(),
            fallback_to_local: true,
        }
    }
}

impl StorageConfig {
    /// Record snapshot location inside the data directory.
    pub fn records_path(&self) -> PathBuf {
        self.data_dir.join("records.json")
    }
}

/// Build the backend stack described by `config`.
pub fn build_backend(config: &StorageConfig) -> Arc<dyn ObjectBackend> {
    let local: Arc<dyn ObjectBackend> = Arc::new(LocalDiskBackend::new(&config.data_dir));
    if config.use_local_storage {
        return local;
    }
    warn!(
        bucket = %config.remote_bucket,
        "primary backend is in memory; payloads will not outlive this process"
    );
    let remote: Arc<dyn ObjectBackend> = Arc::new(MemoryObjectBackend::new(&config.remote_bucket));
    let fallback = config.fallback_to_local.then_some(local);
    Arc::new(TieredBackend::new(remote, fallback))
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

/// Write `data` to a temporary sibling and rename it over `path`.
pub async fn atomic_write(path: &Path, data: &[u8]) -> DedupResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = temp_sibling(path);
    if let Err(e) = tokio::fs::write(&tmp, data).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Blocking variant of [`atomic_write`].
pub fn atomic_write_sync(path: &Path, data: &[u8]) -> DedupResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(path);
    if let Err(e) = std::fs::write(&tmp, data).and_then(|_| std::fs::rename(&tmp, path)) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn map_not_found(e: std::io::Error, location: &str) -> DedupError {
    if e.kind() == std::io::ErrorKind::NotFound {
        DedupError::not_found("location", location)
    } else {
        DedupError::Io(e)
    }
}

/// Payloads as files under a root directory.
pub struct LocalDiskBackend {
    root: PathBuf,
}

impl LocalDiskBackend {
    /// Backend rooted at `root`; directories are created on first write.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ObjectBackend for LocalDiskBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn put(&self, key: &str, data: Vec<u8>) -> BoxFuture<'_, DedupResult<String>> {
        let path = self.root.join(key);
        Box::pin(async move {
            atomic_write(&path, &data).await?;
            debug!(path = %path.display(), bytes = data.len(), "local put");
            Ok(path.to_string_lossy().into_owned())
        })
    }

    fn get(&self, location: &str) -> BoxFuture<'_, DedupResult<Vec<u8>>> {
        let location = location.to_string();
        Box::pin(async move {
            tokio::fs::read(&location)
                .await
                .map_err(|e| map_not_found(e, &location))
        })
    }

    fn delete(&self, location: &str) -> BoxFuture<'_, DedupResult<()>> {
        let location = location.to_string();
        Box::pin(async move {
            tokio::fs::remove_file(&location)
                .await
                .map_err(|e| map_not_found(e, &location))
        })
    }

    fn exists(&self, location: &str) -> BoxFuture<'_, DedupResult<bool>> {
        let location = location.to_string();
        Box::pin(async move { Ok(tokio::fs::try_exists(&location).await?) })
    }

    fn owns(&self, location: &str) -> bool {
        !location.contains("://")
    }
}

/// Operation counters for [`MemoryObjectBackend`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryBackendStats {
    /// Number of put operations.
    pub puts: u64,
    /// Number of get operations.
    pub gets: u64,
    /// Number of delete operations.
    pub deletes: u64,
    /// Calls rejected while unavailable.
    pub rejected: u64,
    /// Total bytes stored.
    pub total_bytes_stored: u64,
}

/// In-memory object store standing in for a remote bucket.
pub struct MemoryObjectBackend {
    bucket: String,
    store: Mutex<HashMap<String, Vec<u8>>>,
    stats: Mutex<MemoryBackendStats>,
    available: AtomicBool,
}

impl MemoryObjectBackend {
    /// Empty bucket.
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            store: Mutex::new(HashMap::new()),
            stats: Mutex::new(MemoryBackendStats::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage or recovery.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Operation counters.
    pub fn stats(&self) -> MemoryBackendStats {
        self.stats.lock().clone()
    }

    /// Number of stored keys.
    pub fn stored_count(&self) -> usize {
        self.store.lock().len()
    }

    fn prefix(&self) -> String {
        format!("{}{}/", MEMORY_SCHEME, self.bucket)
    }

    fn check_available(&self) -> DedupResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            self.stats.lock().rejected += 1;
            Err(DedupError::StorageBackendUnavailable {
                backend: format!("{}{}", MEMORY_SCHEME, self.bucket),
                reason: "endpoint unreachable".to_string(),
            })
        }
    }
}

impl ObjectBackend for MemoryObjectBackend {
    fn name(&self) -> &str {
        &self.bucket
    }

    fn put(&self, key: &str, data: Vec<u8>) -> BoxFuture<'_, DedupResult<String>> {
        let location = format!("{}{}", self.prefix(), key);
        Box::pin(async move {
            self.check_available()?;
            let bytes = data.len() as u64;
            self.store.lock().insert(location.clone(), data);
            let mut stats = self.stats.lock();
            stats.puts += 1;
            stats.total_bytes_stored = stats.total_bytes_stored.saturating_add(bytes);
            Ok(location)
        })
    }

    fn get(&self, location: &str) -> BoxFuture<'_, DedupResult<Vec<u8>>> {
        let location = location.to_string();
        Box::pin(async move {
            self.check_available()?;
            self.stats.lock().gets += 1;
            self.store
                .lock()
                .get(&location)
                .cloned()
                .ok_or_else(|| DedupError::not_found("location", location))
        })
    }

    fn delete(&self, location: &str) -> BoxFuture<'_, DedupResult<()>> {
        let location = location.to_string();
        Box::pin(async move {
            self.check_available()?;
            self.stats.lock().deletes += 1;
            self.store
                .lock()
                .remove(&location)
                .map(|_| ())
                .ok_or_else(|| DedupError::not_found("location", location))
        })
    }

    fn exists(&self, location: &str) -> BoxFuture<'_, DedupResult<bool>> {
        let location = location.to_string();
        Box::pin(async move {
            self.check_available()?;
            Ok(self.store.lock().contains_key(&location))
        })
    }

    fn owns(&self, location: &str) -> bool {
        location.starts_with(&self.prefix())
    }
}

/// Remote primary with an optional local fallback for writes during outages.
pub struct TieredBackend {
    primary: Arc<dyn ObjectBackend>,
    fallback: Option<Arc<dyn ObjectBackend>>,
    fallback_writes: AtomicU64,
}

impl TieredBackend {
    /// Combine a primary with an optional fallback.
    pub fn new(primary: Arc<dyn ObjectBackend>, fallback: Option<Arc<dyn ObjectBackend>>) -> Self {
        Self {
            primary,
            fallback,
            fallback_writes: AtomicU64::new(0),
        }
    }

    /// Writes that landed on the fallback.
    pub fn fallback_writes(&self) -> u64 {
        self.fallback_writes.load(Ordering::Relaxed)
    }

    fn route(&self, location: &str) -> &Arc<dyn ObjectBackend> {
        match &self.fallback {
            Some(f) if !self.primary.owns(location) && f.owns(location) => f,
            _ => &self.primary,
        }
    }
}

impl ObjectBackend for TieredBackend {
    fn name(&self) -> &str {
        self.primary.name()
    }

    fn put(&self, key: &str, data: Vec<u8>) -> BoxFuture<'_, DedupResult<String>> {
        let key = key.to_string();
        Box::pin(async move {
            let Some(fallback) = &self.fallback else {
                return self.primary.put(&key, data).await;
            };
            match self.primary.put(&key, data.clone()).await {
                Err(DedupError::StorageBackendUnavailable { backend, reason }) => {
                    warn!(%backend, %reason, key = %key, "primary backend unavailable, writing locally");
                    self.fallback_writes.fetch_add(1, Ordering::Relaxed);
                    fallback.put(&key, data).await
                }
                other => other,
            }
        })
    }

    fn get(&self, location: &str) -> BoxFuture<'_, DedupResult<Vec<u8>>> {
        self.route(location).get(location)
    }

    fn delete(&self, location: &str) -> BoxFuture<'_, DedupResult<()>> {
        self.route(location).delete(location)
    }

    fn exists(&self, location: &str) -> BoxFuture<'_, DedupResult<bool>> {
        self.route(location).exists(location)
    }

    fn owns(&self, location: &str) -> bool {
        self.primary.owns(location) || self.fallback.as_ref().is_some_and(|f| f.owns(location))
    }
}
