//! Store configuration: one serde tree of per-subsystem configs.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::backend::StorageConfig;
use crate::bloom::IndexConfig;
use crate::cache::LookupCacheConfig;
use crate::chunker::{BlockConfig, Chunker};
use crate::encryption::EncryptionConfig;
use crate::error::{DedupError, DedupResult};
use crate::kek_tree::KekConfig;
use crate::lazy_update::LazyUpdateConfig;
use crate::pow::PowConfig;

/// Top-level configuration. Missing sections fall back to their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Payload storage
    pub storage: StorageConfig,
    /// Convergent encryption
    pub encryption: EncryptionConfig,
    /// Membership index
    pub index: IndexConfig,
    /// Digest lookup cache
    pub cache: LookupCacheConfig,
    /// Block-level dedup
    pub blocks: BlockConfig,
    /// Proof of ownership
    pub pow: PowConfig,
    /// KEK tree shape
    pub kek: KekConfig,
    /// Batched rotations
    pub lazy_updates: LazyUpdateConfig,
}

impl StoreConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: StoreConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values no subsystem can run with.
    pub fn validate(&self) -> DedupResult<()> {
        let invalid = |msg: String| Err(DedupError::InvalidConfig(msg));

        let p = self.index.false_positive_rate;
        if !(p > 0.0 && p < 1.0) {
            return invalid(format!("false positive rate {p} must be in (0, 1)"));
        }
        if self.index.expected_items == 0 {
            return invalid("index expected_items must be non-zero".into());
        }
        if self.cache.capacity == 0 {
            return invalid("cache capacity must be non-zero".into());
        }
        let enc = &self.encryption;
        if enc.kdf_iterations == 0 || enc.workers == 0 || enc.parallel_chunk_size == 0 {
            return invalid("kdf iterations, workers and parallel chunk size must be non-zero".into());
        }
        Chunker::new(self.blocks.strategy)?;

        let pow = &self.pow;
        if pow.min_difficulty > pow.max_difficulty {
            return invalid(format!(
                "pow min difficulty {} exceeds max {}",
                pow.min_difficulty, pow.max_difficulty
            ));
        }
        if pow.difficulty < pow.min_difficulty || pow.difficulty > pow.max_difficulty {
            return invalid(format!(
                "pow difficulty {} outside [{}, {}]",
                pow.difficulty, pow.min_difficulty, pow.max_difficulty
            ));
        }
        if pow.max_difficulty > 64 {
            return invalid("pow difficulty cannot exceed 64".into());
        }
        if pow.target_solve_min_secs > pow.target_solve_max_secs {
            return invalid("pow solve-time target min exceeds max".into());
        }
        if pow.load_low > pow.load_high {
            return invalid("pow load_low exceeds load_high".into());
        }

        if self.kek.leaf_count == 0 {
            return invalid("kek tree needs at least one leaf".into());
        }
        if self.kek.branching_factor < 2 {
            return invalid("kek branching factor must be at least 2".into());
        }
        if self.lazy_updates.batch_size == 0 {
            return invalid("lazy update batch size must be non-zero".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkingStrategy;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = StoreConfig::default();
        assert_eq!(config.encryption.kdf_iterations, 100_000);
        assert_eq!(config.encryption.kdf_salt, "salt_secure_dedup_2024");
        assert_eq!(config.encryption.parallel_chunk_size, 1024 * 1024);
        assert_eq!(config.encryption.workers, 4);
        assert_eq!(config.index.expected_items, 10_000);
        assert_eq!(config.cache.capacity, 1000);
        assert_eq!(config.cache.ttl_secs, 3600);
        assert!(!config.blocks.enabled);
        assert_eq!(config.pow.difficulty, 4);
        assert_eq!((config.pow.min_difficulty, config.pow.max_difficulty), (2, 6));
        assert!(config.pow.adaptive);
        assert_eq!(config.kek.branching_factor, 4);
        assert_eq!(config.kek.leaf_count, 64);
        assert_eq!(config.lazy_updates.batch_size, 10);
        assert_eq!(config.lazy_updates.interval_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_toml_partial() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[encryption]
kdf_iterations = 10

[pow]
difficulty = 2
min_difficulty = 1
max_difficulty = 3
adaptive = false

[blocks]
enabled = true
strategy = {{ kind = "content_defined", min_size = 2048, avg_size = 4096, max_size = 16384 }}
"#
        )
        .unwrap();

        let config = StoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.encryption.kdf_iterations, 10);
        assert_eq!(config.encryption.workers, 4);
        assert!(!config.pow.adaptive);
        assert!(config.blocks.enabled);
        assert_eq!(
            config.blocks.strategy,
            ChunkingStrategy::ContentDefined {
                min_size: 2048,
                avg_size: 4096,
                max_size: 16384
            }
        );
        assert_eq!(config.cache.capacity, 1000);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{ "cache": {{ "capacity": 5 }}, "kek": {{ "leaf_count": 8 }} }}"#
        )
        .unwrap();
        let config = StoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cache.capacity, 5);
        assert_eq!(config.cache.ttl_secs, 3600);
        assert_eq!(config.kek.leaf_count, 8);
        assert_eq!(config.kek.branching_factor, 4);
    }

    #[test]
    fn test_from_file_rejects_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(StoreConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_from_file_rejects_invalid_values() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{ "index": {{ "false_positive_rate": 1.5 }} }}"#).unwrap();
        assert!(StoreConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate_catches_bad_values() {
        let cases: Vec<Box<dyn Fn(&mut StoreConfig)>> = vec![
            Box::new(|c| c.index.false_positive_rate = 0.0),
            Box::new(|c| c.cache.capacity = 0),
            Box::new(|c| c.encryption.workers = 0),
            Box::new(|c| c.pow.min_difficulty = 7),
            Box::new(|c| c.pow.difficulty = 9),
            Box::new(|c| c.kek.branching_factor = 1),
            Box::new(|c| c.kek.leaf_count = 0),
            Box::new(|c| c.lazy_updates.batch_size = 0),
            Box::new(|c| c.blocks.strategy = ChunkingStrategy::Fixed { block_size: 0 }),
            Box::new(|c| {
                c.blocks.strategy = ChunkingStrategy::ContentDefined {
                    min_size: 8,
                    avg_size: 16,
                    max_size: 32,
                }
            }),
        ];
        for (i, mutate) in cases.iter().enumerate() {
            let mut config = StoreConfig::default();
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(DedupError::InvalidConfig(_))),
                "case {i} should be rejected"
            );
        }
    }
}
