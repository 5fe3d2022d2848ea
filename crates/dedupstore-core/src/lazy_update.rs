//! Batched KEK rotation.
//!
//! Rotations are queued per node and applied together once the batch size or
//! the flush interval is reached. Queuing the same node twice before a flush
//! keeps only the last hash. Every queue call counts toward the batch size, and
//! a flush applies updates oldest first so the newest write lands last on any
//! shared ancestor.

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DedupError, DedupResult};
use crate::kek_tree::{KekNodeId, KekTree};

/// Flush thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LazyUpdateConfig {
    /// Queue calls since the last flush that trigger one (default 10)
    pub batch_size: usize,
    /// Seconds since the last flush that trigger a flush (default 300)
    pub interval_secs: u64,
}

impl Default for LazyUpdateConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            interval_secs: 300,
        }
    }
}

impl LazyUpdateConfig {
    /// Flush interval as a `Duration`.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// A queued rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingKeyUpdate {
    /// Node to rotate
    pub node: KekNodeId,
    /// Replacement key hash
    pub new_key_hash: String,
    /// When it was queued
    pub queued_at: DateTime<Utc>,
}

/// Result of applying the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Distinct rotations applied
    pub applied: usize,
    /// Number of node writes, counting each node on each path
    pub nodes_updated: usize,
    /// Queue entries superseded by a later update to the same node
    pub collapsed: usize,
    /// Distinct nodes whose hash changed, in first-touched order
    pub updated_nodes: Vec<KekNodeId>,
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LazyUpdateStats {
    /// Currently queued nodes
    pub pending: usize,
    /// Configured batch size
    pub batch_size: usize,
    /// Configured interval in seconds
    pub interval_secs: u64,
    /// Seconds since the last applied flush (or since start)
    pub secs_since_flush: u64,
    /// Total queue calls
    pub queued_total: u64,
    /// Flushes that applied something
    pub flushes: u64,
    /// Rotations applied
    pub applied_total: u64,
    /// Updates dropped by last-write-wins
    pub collapsed_total: u64,
}

struct Queued {
    seq: u64,
    update: PendingKeyUpdate,
}

struct Queue {
    pending: BTreeMap<KekNodeId, Queued>,
    next_seq: u64,
    queued_since_flush: usize,
    collapsed: usize,
    last_flush: Instant,
    stats: LazyUpdateStats,
}

/// Owns the KEK tree and defers rotations into batches.
pub struct LazyUpdateManager {
    config: LazyUpdateConfig,
    tree: RwLock<KekTree>,
    queue: Mutex<Queue>,
}

impl LazyUpdateManager {
    /// Wrap a tree.
    pub fn new(tree: KekTree, config: LazyUpdateConfig) -> Self {
        Self {
            config,
            tree: RwLock::new(tree),
            queue: Mutex::new(Queue {
                pending: BTreeMap::new(),
                next_seq: 0,
                queued_since_flush: 0,
                collapsed: 0,
                last_flush: Instant::now(),
                stats: LazyUpdateStats::default(),
            }),
        }
    }

    /// Read access to the tree.
    pub fn tree(&self) -> RwLockReadGuard<'_, KekTree> {
        self.tree.read()
    }

    /// Flush thresholds.
    pub fn config(&self) -> &LazyUpdateConfig {
        &self.config
    }

    /// Queue a rotation and flush if a threshold is now met.
    pub fn queue_update(
        &self,
        node: KekNodeId,
        new_key_hash: impl Into<String>,
    ) -> DedupResult<Option<FlushReport>> {
        if !self.tree.read().contains(&node) {
            return Err(DedupError::not_found("kek node", node.to_string()));
        }
        {
            let mut q = self.queue.lock();
            let seq = q.next_seq;
            q.next_seq += 1;
            let update = PendingKeyUpdate {
                node,
                new_key_hash: new_key_hash.into(),
                queued_at: Utc::now(),
            };
            // a superseded entry takes the position of the newer write
            if q.pending.insert(node, Queued { seq, update }).is_some() {
                q.collapsed += 1;
                q.stats.collapsed_total += 1;
            }
            q.queued_since_flush += 1;
            q.stats.queued_total += 1;
            debug!(
                node = %node,
                pending = q.pending.len(),
                queued = q.queued_since_flush,
                "queued kek update"
            );
        }
        self.flush()
    }

    /// Apply the queue if the batch size or interval has been reached.
    pub fn flush(&self) -> DedupResult<Option<FlushReport>> {
        let mut q = self.queue.lock();
        if q.pending.is_empty() {
            return Ok(None);
        }
        let due = q.queued_since_flush >= self.config.batch_size
            || q.last_flush.elapsed() >= self.config.interval();
        if !due {
            return Ok(None);
        }
        self.apply(&mut q).map(Some)
    }

    /// Apply the queue regardless of thresholds.
    pub fn force_flush(&self) -> DedupResult<FlushReport> {
        let mut q = self.queue.lock();
        if q.pending.is_empty() {
            return Ok(FlushReport::default());
        }
        self.apply(&mut q)
    }

    fn apply(&self, q: &mut Queue) -> DedupResult<FlushReport> {
        let mut queued: Vec<Queued> = std::mem::take(&mut q.pending).into_values().collect();
        queued.sort_by_key(|entry| entry.seq);
        q.queued_since_flush = 0;
        let mut tree = self.tree.write();
        let mut report = FlushReport::default();
        let mut seen = HashSet::new();
        for Queued { update, .. } in queued {
            let path = tree.rotate_key(&update.node, &update.new_key_hash)?;
            report.applied += 1;
            report.nodes_updated += path.len();
            for id in path {
                if seen.insert(id) {
                    report.updated_nodes.push(id);
                }
            }
        }
        report.collapsed = std::mem::take(&mut q.collapsed);
        q.stats.flushes += 1;
        q.stats.applied_total += report.applied as u64;
        q.last_flush = Instant::now();
        info!(
            applied = report.applied,
            nodes = report.updated_nodes.len(),
            collapsed = report.collapsed,
            "flushed kek updates"
        );
        Ok(report)
    }

    /// Number of queued nodes.
    pub fn pending_count(&self) -> usize {
        self.queue.lock().pending.len()
    }

    /// Snapshot of the queued updates in the order they will be applied.
    pub fn pending(&self) -> Vec<PendingKeyUpdate> {
        let q = self.queue.lock();
        let mut queued: Vec<&Queued> = q.pending.values().collect();
        queued.sort_by_key(|entry| entry.seq);
        queued.into_iter().map(|entry| entry.update.clone()).collect()
    }

    /// Queue statistics.
    pub fn stats(&self) -> LazyUpdateStats {
        let q = self.queue.lock();
        LazyUpdateStats {
            pending: q.pending.len(),
            batch_size: self.config.batch_size,
            interval_secs: self.config.interval_secs,
            secs_since_flush: q.last_flush.elapsed().as_secs(),
            ..q.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(batch_size: usize, interval_secs: u64) -> LazyUpdateManager {
        let tree = KekTree::build(16, 4).unwrap();
        LazyUpdateManager::new(
            tree,
            LazyUpdateConfig {
                batch_size,
                interval_secs,
            },
        )
    }

    #[test]
    fn test_below_threshold_stays_queued() {
        let mgr = manager(3, 3600);
        let before = mgr.tree().key_hash(&KekNodeId::new(0, 0)).unwrap().to_string();
        assert!(mgr.queue_update(KekNodeId::new(2, 0), "a").unwrap().is_none());
        assert!(mgr.queue_update(KekNodeId::new(2, 1), "b").unwrap().is_none());
        assert_eq!(mgr.pending_count(), 2);
        assert!(mgr.flush().unwrap().is_none());
        assert_eq!(mgr.tree().key_hash(&KekNodeId::new(0, 0)).unwrap(), before);
    }

    #[test]
    fn test_batch_size_triggers_flush() {
        let mgr = manager(2, 3600);
        mgr.queue_update(KekNodeId::new(2, 0), "a").unwrap();
        let report = mgr.queue_update(KekNodeId::new(2, 5), "b").unwrap().unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.nodes_updated, 6);
        // both paths share the root
        assert_eq!(report.updated_nodes.len(), 5);
        assert_eq!(mgr.pending_count(), 0);
    }

    #[test]
    fn test_zero_interval_flushes_immediately() {
        let mgr = manager(100, 0);
        let report = mgr.queue_update(KekNodeId::new(2, 3), "x").unwrap().unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(mgr.tree().key_hash(&KekNodeId::new(1, 0)).unwrap(), "x");
    }

    #[test]
    fn test_last_write_wins() {
        let mgr = manager(10, 3600);
        mgr.queue_update(KekNodeId::new(2, 7), "first").unwrap();
        mgr.queue_update(KekNodeId::new(2, 7), "second").unwrap();
        assert_eq!(mgr.pending_count(), 1);
        let report = mgr.force_flush().unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.collapsed, 1);
        assert_eq!(mgr.tree().key_hash(&KekNodeId::new(2, 7)).unwrap(), "second");
        assert_eq!(mgr.stats().collapsed_total, 1);
    }

    #[test]
    fn test_repeated_node_counts_toward_batch() {
        let mgr = manager(3, 3600);
        let node = KekNodeId::new(2, 7);
        assert!(mgr.queue_update(node, "k1").unwrap().is_none());
        assert!(mgr.queue_update(node, "k2").unwrap().is_none());
        let report = mgr.queue_update(node, "k3").unwrap().unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.collapsed, 2);
        assert_eq!(mgr.tree().key_hash(&node).unwrap(), "k3");

        // the counter restarts after a flush
        assert!(mgr.queue_update(node, "k4").unwrap().is_none());
        assert_eq!(mgr.pending_count(), 1);
    }

    #[test]
    fn test_newest_update_wins_at_shared_ancestors() {
        let mgr = manager(10, 3600);
        mgr.queue_update(KekNodeId::new(2, 15), "older").unwrap();
        mgr.queue_update(KekNodeId::new(2, 0), "newer").unwrap();
        let order: Vec<_> = mgr.pending().into_iter().map(|u| u.node).collect();
        assert_eq!(order, vec![KekNodeId::new(2, 15), KekNodeId::new(2, 0)]);

        mgr.force_flush().unwrap();
        let tree = mgr.tree();
        assert_eq!(tree.key_hash(&KekNodeId::new(0, 0)).unwrap(), "newer");
        assert_eq!(tree.key_hash(&KekNodeId::new(1, 3)).unwrap(), "older");
        assert_eq!(tree.key_hash(&KekNodeId::new(1, 0)).unwrap(), "newer");
    }

    #[test]
    fn test_requeued_node_moves_behind_later_entries() {
        let mgr = manager(10, 3600);
        mgr.queue_update(KekNodeId::new(2, 0), "a1").unwrap();
        mgr.queue_update(KekNodeId::new(2, 9), "b").unwrap();
        mgr.queue_update(KekNodeId::new(2, 0), "a2").unwrap();
        mgr.force_flush().unwrap();
        assert_eq!(mgr.tree().key_hash(&KekNodeId::new(0, 0)).unwrap(), "a2");
    }

    #[test]
    fn test_force_flush_empty_is_noop() {
        let mgr = manager(10, 3600);
        assert_eq!(mgr.force_flush().unwrap(), FlushReport::default());
        assert_eq!(mgr.stats().flushes, 0);
    }

    #[test]
    fn test_unknown_node_rejected() {
        let mgr = manager(10, 3600);
        assert!(matches!(
            mgr.queue_update(KekNodeId::new(5, 0), "x"),
            Err(DedupError::NotFound { .. })
        ));
        assert_eq!(mgr.pending_count(), 0);
    }
}
