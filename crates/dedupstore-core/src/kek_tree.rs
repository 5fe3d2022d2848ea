//! Hierarchical key-encryption-key tree.
//!
//! Nodes live in an arena (`Vec<KekNode>`) and refer to their parent by
//! arena index, so walking to the root is an iterative lookup. Only
//! SHA-256 hashes of node keys are kept; raw keys are generated, hashed and
//! zeroized at creation.
//!
//! A rotation writes the new key hash to the node and then to every
//! ancestor up to the root, never to siblings or descendants.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tracing::debug;
use zeroize::Zeroize;

use crate::error::{DedupError, DedupResult};
use crate::records::KekNodeRecord;

/// Position of a node: depth from the root and index within that level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KekNodeId {
    /// Depth, root is 0
    pub level: u32,
    /// Index within the level
    pub index: u64,
}

impl KekNodeId {
    /// Node at `level`, `index`.
    pub fn new(level: u32, index: u64) -> Self {
        Self { level, index }
    }
}

impl std::fmt::Display for KekNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}_N{}", self.level, self.index)
    }
}

impl std::str::FromStr for KekNodeId {
    type Err = DedupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || DedupError::Serialization(format!("bad kek node id {s:?}"));
        let rest = s.strip_prefix('L').ok_or_else(bad)?;
        let (level, index) = rest.split_once("_N").ok_or_else(bad)?;
        Ok(Self {
            level: level.parse().map_err(|_| bad())?,
            index: index.parse().map_err(|_| bad())?,
        })
    }
}

/// KEK tree shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KekConfig {
    /// Leaves to build (default 64)
    pub leaf_count: u64,
    /// Children per internal node (default 4)
    pub branching_factor: u32,
}

impl Default for KekConfig {
    fn default() -> Self {
        Self {
            leaf_count: 64,
            branching_factor: 4,
        }
    }
}

/// One tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KekNode {
    /// Node id
    pub id: KekNodeId,
    /// Arena index of the parent
    pub parent: Option<usize>,
    /// Arena indices of the children
    pub children: Vec<usize>,
    /// SHA-256 hex of the current key
    pub key_hash: String,
    /// Leaf flag
    pub is_leaf: bool,
    /// Number of rotations applied
    pub version: u64,
    /// Last rotation time
    pub updated_at: Option<DateTime<Utc>>,
}

/// Shape statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KekTreeStats {
    /// All nodes
    pub total_nodes: u64,
    /// Leaves
    pub leaf_nodes: u64,
    /// Non-leaves
    pub internal_nodes: u64,
    /// Levels
    pub height: u32,
    /// Children per internal node
    pub branching_factor: u32,
    /// Rotations applied since load
    pub rotations: u64,
}

/// Fresh random key, returned only as its hash.
pub fn random_key_hash() -> String {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    let hash = hex::encode(Sha256::digest(key));
    key.zeroize();
    hash
}

/// Arena-backed KEK tree.
#[derive(Debug, Clone)]
pub struct KekTree {
    nodes: Vec<KekNode>,
    by_id: HashMap<KekNodeId, usize>,
    root: usize,
    branching: u32,
    height: u32,
    rotations: u64,
}

impl KekTree {
    /// Build breadth-first so that level `height - 1` holds exactly `leaf_count` leaves.
    pub fn build(leaf_count: u64, branching: u32) -> DedupResult<Self> {
        if leaf_count == 0 {
            return Err(DedupError::InvalidConfig("kek tree needs at least one leaf".into()));
        }
        if branching < 2 {
            return Err(DedupError::InvalidConfig("branching factor must be at least 2".into()));
        }
        let b = branching as u64;
        let mut height = 1u32;
        let mut span = 1u64;
        while span < leaf_count {
            span = span.saturating_mul(b);
            height += 1;
        }

        // nodes on level l: ceil(leaf_count / b^(height-1-l))
        let mut level_counts = Vec::with_capacity(height as usize);
        let mut count = leaf_count;
        for _ in 0..height {
            level_counts.push(count);
            count = count.div_ceil(b);
        }
        level_counts.reverse();

        let mut tree = Self {
            nodes: Vec::new(),
            by_id: HashMap::new(),
            root: 0,
            branching,
            height,
            rotations: 0,
        };
        for (level, &n) in level_counts.iter().enumerate() {
            let level = level as u32;
            for index in 0..n {
                let parent = if level == 0 {
                    None
                } else {
                    tree.by_id.get(&KekNodeId::new(level - 1, index / b)).copied()
                };
                let slot = tree.nodes.len();
                tree.nodes.push(KekNode {
                    id: KekNodeId::new(level, index),
                    parent,
                    children: Vec::new(),
                    key_hash: random_key_hash(),
                    is_leaf: level + 1 == height,
                    version: 0,
                    updated_at: None,
                });
                tree.by_id.insert(KekNodeId::new(level, index), slot);
                if let Some(p) = parent {
                    tree.nodes[p].children.push(slot);
                }
            }
        }
        debug!(leaves = leaf_count, height, nodes = tree.nodes.len(), "built kek tree");
        Ok(tree)
    }

    fn slot(&self, id: &KekNodeId) -> DedupResult<usize> {
        self.by_id
            .get(id)
            .copied()
            .ok_or_else(|| DedupError::not_found("kek node", id.to_string()))
    }

    /// Root node id.
    pub fn root(&self) -> KekNodeId {
        self.nodes[self.root].id
    }

    /// Look up a node.
    pub fn node(&self, id: &KekNodeId) -> DedupResult<&KekNode> {
        Ok(&self.nodes[self.slot(id)?])
    }

    /// True if `id` is in the tree.
    pub fn contains(&self, id: &KekNodeId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Current key hash of a node.
    pub fn key_hash(&self, id: &KekNodeId) -> DedupResult<&str> {
        Ok(&self.node(id)?.key_hash)
    }

    /// Leaf ids in index order.
    pub fn leaves(&self) -> Vec<KekNodeId> {
        self.nodes.iter().filter(|n| n.is_leaf).map(|n| n.id).collect()
    }

    /// Leaf assigned to a principal.
    pub fn leaf_for(&self, principal: u64) -> KekNodeId {
        let leaf_level = self.height - 1;
        let leaves = self
            .nodes
            .iter()
            .filter(|n| n.id.level == leaf_level)
            .count() as u64;
        KekNodeId::new(leaf_level, principal % leaves.max(1))
    }

    /// Ids from `id` up to and including the root.
    pub fn path_to_root(&self, id: &KekNodeId) -> DedupResult<Vec<KekNodeId>> {
        let mut path = Vec::with_capacity(self.height as usize);
        let mut cur = Some(self.slot(id)?);
        while let Some(slot) = cur {
            path.push(self.nodes[slot].id);
            cur = self.nodes[slot].parent;
        }
        Ok(path)
    }

    /// `id` and all of its descendants, breadth-first.
    pub fn subtree(&self, id: &KekNodeId) -> DedupResult<Vec<KekNodeId>> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([self.slot(id)?]);
        while let Some(slot) = queue.pop_front() {
            out.push(self.nodes[slot].id);
            queue.extend(self.nodes[slot].children.iter().copied());
        }
        Ok(out)
    }

    /// Apply `new_key_hash` to a node and every ancestor. Returns the updated ids, node first.
    pub fn rotate_key(&mut self, id: &KekNodeId, new_key_hash: &str) -> DedupResult<Vec<KekNodeId>> {
        let now = Utc::now();
        let mut updated = Vec::with_capacity(self.height as usize);
        let mut cur = Some(self.slot(id)?);
        while let Some(slot) = cur {
            let node = &mut self.nodes[slot];
            node.key_hash = new_key_hash.to_string();
            node.version += 1;
            node.updated_at = Some(now);
            updated.push(node.id);
            cur = node.parent;
        }
        self.rotations += 1;
        debug!(node = %id, path = updated.len(), "rotated kek path");
        Ok(updated)
    }

    /// Shape statistics.
    pub fn stats(&self) -> KekTreeStats {
        let leaves = self.nodes.iter().filter(|n| n.is_leaf).count() as u64;
        KekTreeStats {
            total_nodes: self.nodes.len() as u64,
            leaf_nodes: leaves,
            internal_nodes: self.nodes.len() as u64 - leaves,
            height: self.height,
            branching_factor: self.branching,
            rotations: self.rotations,
        }
    }

    /// Indented text view down to `max_depth` levels.
    pub fn render(&self, max_depth: u32) -> String {
        let mut out = String::new();
        let mut stack = vec![self.root];
        while let Some(slot) = stack.pop() {
            let node = &self.nodes[slot];
            if node.id.level > max_depth {
                continue;
            }
            let _ = writeln!(
                out,
                "{}{} {}{}",
                "  ".repeat(node.id.level as usize),
                node.id,
                &node.key_hash[..node.key_hash.len().min(12)],
                if node.is_leaf { " (leaf)" } else { "" }
            );
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    /// Persistable form of the given nodes.
    pub fn records_for(&self, ids: &[KekNodeId]) -> DedupResult<Vec<KekNodeRecord>> {
        ids.iter().map(|id| Ok(self.record(self.slot(id)?))).collect()
    }

    /// Persistable form of every node.
    pub fn to_records(&self) -> Vec<KekNodeRecord> {
        (0..self.nodes.len()).map(|slot| self.record(slot)).collect()
    }

    fn record(&self, slot: usize) -> KekNodeRecord {
        let node = &self.nodes[slot];
        KekNodeRecord {
            node_id: node.id.to_string(),
            parent_id: node.parent.map(|p| self.nodes[p].id.to_string()),
            key_hash: node.key_hash.clone(),
            level: node.id.level,
            is_leaf: node.is_leaf,
        }
    }

    /// Rebuild the arena from persisted records.
    pub fn from_records(records: &[KekNodeRecord], branching: u32) -> DedupResult<Self> {
        let corrupt = |msg: String| DedupError::Serialization(format!("kek records: {msg}"));
        if records.is_empty() {
            return Err(corrupt("no nodes".into()));
        }
        let mut sorted: Vec<(KekNodeId, &KekNodeRecord)> = records
            .iter()
            .map(|r| Ok((r.node_id.parse::<KekNodeId>()?, r)))
            .collect::<DedupResult<_>>()?;
        sorted.sort_by_key(|(id, _)| *id);

        let mut tree = Self {
            nodes: Vec::with_capacity(sorted.len()),
            by_id: HashMap::with_capacity(sorted.len()),
            root: 0,
            branching,
            height: 0,
            rotations: 0,
        };
        let mut roots = 0;
        for (id, rec) in sorted {
            let parent = match &rec.parent_id {
                None => {
                    roots += 1;
                    None
                }
                Some(p) => {
                    let pid: KekNodeId = p.parse()?;
                    Some(tree.by_id.get(&pid).copied().ok_or_else(|| {
                        corrupt(format!("{id} references missing parent {pid}"))
                    })?)
                }
            };
            let slot = tree.nodes.len();
            tree.nodes.push(KekNode {
                id,
                parent,
                children: Vec::new(),
                key_hash: rec.key_hash.clone(),
                is_leaf: rec.is_leaf,
                version: 0,
                updated_at: None,
            });
            tree.by_id.insert(id, slot);
            if let Some(p) = parent {
                tree.nodes[p].children.push(slot);
            }
            tree.height = tree.height.max(id.level + 1);
        }
        if roots != 1 || tree.nodes[0].parent.is_some() {
            return Err(corrupt(format!("expected one root, found {roots}")));
        }
        Ok(tree)
    }
}
