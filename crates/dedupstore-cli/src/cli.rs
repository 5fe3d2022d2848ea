use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use dedupstore_core::{
    build_backend, digest_reader, solve_challenge, ContentDigest, DedupEngine, KekNodeId, MemoryRecordStore,
    RecordStore, StoreConfig,
};
use rand::RngCore;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "dedupstore")]
#[command(about = "Deduplicating encrypted object store", long_about = None)]
pub struct Cli {
    /// TOML or JSON config file
    #[arg(short, long, env = "DEDUPSTORE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Overrides storage.data_dir from the config
    #[arg(short, long, env = "DEDUPSTORE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Store a file and grant ownership to the principal
    Upload {
        file: PathBuf,
        #[arg(short, long, default_value = "0")]
        principal: u64,
    },
    /// Decrypt an owned object to a file
    Download {
        digest: String,
        out: PathBuf,
        #[arg(short, long, default_value = "0")]
        principal: u64,
    },
    /// Report whether a file's content is already stored
    Check {
        file: PathBuf,
    },
    /// Grant a second principal ownership of an object
    Share {
        digest: String,
        #[arg(long)]
        from: u64,
        #[arg(long)]
        to: u64,
    },
    /// Drop a principal's ownership and re-key its KEK leaf
    Revoke {
        digest: String,
        #[arg(short, long)]
        principal: u64,
    },
    /// Issue a proof-of-ownership challenge (held only for this run; see `prove`)
    Challenge {
        digest: String,
        #[arg(short, long)]
        principal: u64,
    },
    /// Issue, solve and verify a challenge in one run
    Prove {
        digest: String,
        #[arg(short, long)]
        principal: u64,
        #[arg(long, default_value = "50000000")]
        max_iterations: u64,
    },
    /// Queue a KEK rotation; queued rotations are applied before exit
    Rotate {
        /// Node id such as L2_N5
        node: String,
        /// Apply the queue now and report it
        #[arg(long)]
        force: bool,
    },
    /// Print store statistics
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Rebuild the membership index from stored objects
    RebuildIndex,
    /// Compare serial and parallel encryption throughput
    Bench {
        #[arg(default_value = "8388608")]
        size: usize,
    },
}

impl Cli {
    pub fn load_config(&self) -> Result<StoreConfig> {
        let mut config = match &self.config {
            Some(path) => StoreConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => StoreConfig::default(),
        };
        if let Some(dir) = &self.data_dir {
            config.storage.data_dir = dir.clone();
        }
        Ok(config)
    }

    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        std::fs::create_dir_all(&config.storage.data_dir)?;
        let records = Arc::new(MemoryRecordStore::open(config.storage.records_path())?);
        let backend = build_backend(&config.storage);
        let shared: Arc<dyn RecordStore> = records.clone();
        let engine = DedupEngine::open(config, shared, backend)?;

        match self.command {
            Command::Upload { ref file, principal } => upload(&engine, file, principal).await?,
            Command::Download {
                ref digest,
                ref out,
                principal,
            } => {
                let d = parse_digest(digest)?;
                let n = engine.download_to(principal, &d, out).await?;
                println!("Wrote {} to {}", format_bytes(n), out.display());
            }
            Command::Check { ref file } => {
                let (d, size) = digest_reader(std::fs::File::open(file)?)?;
                let check = engine.check_duplicate(&d)?;
                println!("Digest:    {d}");
                println!("Size:      {}", format_bytes(size));
                println!("Duplicate: {}", check.is_duplicate);
            }
            Command::Share { ref digest, from, to } => {
                let d = parse_digest(digest)?;
                let grant = engine.share(from, to, &d)?;
                println!(
                    "Shared {} with principal {} (refs {}{})",
                    d.short(),
                    to,
                    grant.reference_count,
                    if grant.newly_granted { "" } else { ", already owned" }
                );
            }
            Command::Revoke { ref digest, principal } => {
                let d = parse_digest(digest)?;
                let out = engine.revoke_ownership(principal, &d)?;
                println!("Revoked principal {principal} from {} (refs {})", d.short(), out.reference_count);
                println!("Pending key updates: {}", engine.key_manager().pending_count());
            }
            Command::Challenge { ref digest, principal } => {
                let d = parse_digest(digest)?;
                let ch = engine.generate_challenge(principal, &d)?;
                println!("Challenge:  {}", ch.challenge_hash);
                println!("Difficulty: {}", ch.difficulty);
                println!("Challenges are not kept between runs; use `prove` to answer one.");
            }
            Command::Prove {
                ref digest,
                principal,
                max_iterations,
            } => {
                let d = parse_digest(digest)?;
                let ch = engine.generate_challenge(principal, &d)?;
                let (nonce, response) = solve_challenge(&ch.challenge_hash, ch.difficulty, max_iterations)
                    .with_context(|| format!("no nonce found within {max_iterations} iterations"))?;
                let grant = engine.verify_proof(principal, &d, nonce)?;
                println!("Nonce:    {nonce}");
                println!("Response: {response}");
                println!(
                    "Ownership {} (refs {})",
                    if grant.newly_granted { "granted" } else { "already held" },
                    grant.reference_count
                );
            }
            Command::Rotate { ref node, force } => {
                let id: KekNodeId = node.parse()?;
                let queued = engine.queue_key_rotation(id)?;
                let report = if force {
                    Some(engine.force_flush_key_updates()?)
                } else {
                    queued
                };
                match report {
                    Some(r) => println!("Applied {} rotation(s), {} node(s) re-keyed", r.applied, r.updated_nodes.len()),
                    None => println!("Queued; {} update(s) pending", engine.key_manager().pending_count()),
                }
            }
            Command::Stats { json } => {
                let stats = engine.stats()?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                } else {
                    println!("Objects:          {}", stats.objects);
                    println!("Ownerships:       {}", stats.ownerships);
                    println!("Physical:         {}", format_bytes(stats.physical_bytes));
                    println!("Logical:          {}", format_bytes(stats.logical_bytes));
                    println!("Reclaimable:      {}", stats.reclaimable_objects);
                    println!("Index fill:       {:.4}", stats.index.filter.fill_ratio);
                    println!("Index est. FPR:   {:.6}", stats.index.filter.estimated_false_positive_rate);
                    println!("Unique blocks:    {}", stats.blocks.unique_blocks);
                    println!("KEK nodes:        {}", stats.kek.total_nodes);
                    println!("Pending rotations:{:>2}", stats.lazy_updates.pending);
                    println!("PoW difficulty:   {}", stats.pow.difficulty);
                }
            }
            Command::RebuildIndex => {
                let items = engine.rebuild_index()?;
                println!("Rebuilt index with {items} digest(s)");
            }
            Command::Bench { size } => {
                let mut sample = vec![0u8; size];
                rand::thread_rng().fill_bytes(&mut sample);
                let bench = engine.benchmark(&sample)?;
                println!("Size:     {}", format_bytes(bench.size_bytes as u64));
                println!("Serial:   {:?}", bench.serial);
                println!("Parallel: {:?} ({} workers)", bench.parallel, bench.workers);
                println!("Speedup:  {:.2}x", bench.speedup());
            }
        }

        // queued rotations and the in-memory index do not survive the process
        let flushed = engine.force_flush_key_updates()?;
        if flushed.applied > 0 {
            tracing::info!(applied = flushed.applied, "applied queued kek rotations before exit");
        }
        engine.persist_index()?;
        records.persist()?;
        Ok(())
    }
}

async fn upload(engine: &DedupEngine, file: &std::path::Path, principal: u64) -> Result<()> {
    let data = tokio::fs::read(file).await?;
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed")
        .to_string();
    let out = engine.upload(Bytes::from(data), &name, principal).await?;
    println!("Object:    {}", out.object_id);
    println!("Size:      {}", format_bytes(out.size_bytes));
    println!("Duplicate: {}", out.is_duplicate);
    println!("Saved:     {}", format_bytes(out.bytes_saved));
    println!("Refs:      {}", out.reference_count);
    Ok(())
}

fn parse_digest(s: &str) -> Result<ContentDigest> {
    ContentDigest::from_hex(s).with_context(|| format!("invalid digest {s:?}"))
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
