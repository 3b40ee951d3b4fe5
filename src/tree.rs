//! Bottom-up Merkle tree construction.
//!
//! # Design
//!
//! Nodes live in an arena (`Vec<Node>`) addressed by dense indices; the
//! levels array and the root both refer to the same node identities, so
//! proof generation can walk either without ownership games. Level 0 is the
//! leaves in input order; each level above pairs neighbours left-to-right.
//!
//! An odd level duplicates its final node: the parent's left and right both
//! reference the same child and its hash is `sha256(last || last)` over the
//! hex strings. This keeps the policy stable across rebuilds, matching the
//! producer this service replaced.
//!
//! Leaf hashes and interior hashes share one hash function with no domain
//! separation; that preserves root compatibility with existing committed
//! records, at the documented cost of second-preimage cross-type collisions.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use crate::error::Result;
use crate::hasher::{hash_bytes, hash_file};

/// Index of a node in the tree arena.
pub type NodeId = usize;

/// Where a leaf's hash came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafSource {
    /// A raw data block (CLI mode).
    Data(String),
    /// A file whose contents were streamed through the hasher (service mode).
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Leaf { source: LeafSource },
    Interior { left: NodeId, right: NodeId },
}

/// A single node: leaf or interior, always carrying its hex hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub hash: String,
    pub kind: NodeKind,
}

/// A fully built Merkle tree with all intermediate levels retained.
///
/// Retaining the levels is what makes inclusion-proof generation a pure
/// index walk; see [`crate::proof`].
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    nodes: Vec<Node>,
    levels: Vec<Vec<NodeId>>,
    root: Option<NodeId>,
}

impl MerkleTree {
    /// Build from in-memory data blocks, hashing each block's UTF-8 bytes.
    /// Zero items produce an empty tree.
    pub fn from_data<S: AsRef<str>>(items: &[S]) -> Self {
        let leaves = items
            .iter()
            .map(|item| {
                let block = item.as_ref();
                Node {
                    hash: hash_bytes(block),
                    kind: NodeKind::Leaf {
                        source: LeafSource::Data(block.to_string()),
                    },
                }
            })
            .collect();
        Self::from_leaves(leaves)
    }

    /// Build from files, streaming each through the hasher in input order.
    /// Zero paths produce an empty tree; an unreadable file aborts the build.
    pub async fn from_files(paths: &[PathBuf]) -> Result<Self> {
        let mut leaves = Vec::with_capacity(paths.len());
        for path in paths {
            leaves.push(Node {
                hash: hash_file(path).await?,
                kind: NodeKind::Leaf {
                    source: LeafSource::File(path.clone()),
                },
            });
        }
        Ok(Self::from_leaves(leaves))
    }

    /// Pairwise bottom-up reduction over an already-hashed leaf level.
    fn from_leaves(leaves: Vec<Node>) -> Self {
        if leaves.is_empty() {
            return Self::default();
        }

        let mut nodes = leaves;
        let mut current: Vec<NodeId> = (0..nodes.len()).collect();
        let mut levels = vec![current.clone()];

        while current.len() > 1 {
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            let mut i = 0;
            while i < current.len() {
                let left = current[i];
                // Odd tail: the parent references the last node twice.
                let right = if i + 1 < current.len() { current[i + 1] } else { left };
                let hash = hash_bytes(&format!("{}{}", nodes[left].hash, nodes[right].hash));
                nodes.push(Node {
                    hash,
                    kind: NodeKind::Interior { left, right },
                });
                next.push(nodes.len() - 1);
                i += 2;
            }
            levels.push(next.clone());
            current = next;
        }

        let root = current.first().copied();
        Self { nodes, levels, root }
    }

    /// The root hash, or `None` for an empty tree.
    #[must_use]
    pub fn root_hash(&self) -> Option<&str> {
        self.root.map(|id| self.nodes[id].hash.as_str())
    }

    /// Number of leaves (level-0 nodes).
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// All levels, leaves first, root level last.
    #[must_use]
    pub fn levels(&self) -> &[Vec<NodeId>] {
        &self.levels
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// The full tree body as nested JSON, root outward.
    ///
    /// Interior nodes serialize as `{hash, left, right}`, data leaves as
    /// `{hash, data}`, file leaves as `{hash, file}`, the same shape the
    /// batch tool has always emitted, so stored bodies stay parseable by
    /// existing consumers.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self.root {
            Some(id) => self.node_json(id),
            None => Value::Null,
        }
    }

    /// Serialized tree body, compact.
    #[must_use]
    pub fn to_json_string(&self) -> String {
        self.to_json().to_string()
    }

    /// Serialized tree body, pretty-printed.
    #[must_use]
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(&self.to_json()).unwrap_or_else(|_| "null".to_string())
    }

    fn node_json(&self, id: NodeId) -> Value {
        let node = &self.nodes[id];
        match &node.kind {
            NodeKind::Leaf {
                source: LeafSource::Data(block),
            } => json!({ "hash": node.hash, "data": block }),
            NodeKind::Leaf {
                source: LeafSource::File(path),
            } => json!({ "hash": node.hash, "file": path_string(path) }),
            NodeKind::Interior { left, right } => json!({
                "hash": node.hash,
                "left": self.node_json(*left),
                "right": self.node_json(*right),
            }),
        }
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
