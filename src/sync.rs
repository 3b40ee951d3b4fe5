//! Change-gated commit of a built tree.
//!
//! The latest committed root is the change-detection baseline: the cache is
//! consulted first, the backend on a miss, and a matching root short-circuits
//! with no write at all. The cache is only ever updated *after* the backend
//! has accepted a commit, so it can never advertise a root the backend does
//! not hold.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use crate::cache::TreeCache;
use crate::error::{Error, Result};
use crate::metrics;
use crate::storage::{now_millis, TreeMeta, TreeStore};
use crate::tree::MerkleTree;

/// Result of one sync attempt.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SyncOutcome {
    /// True when a new root was committed to the backend.
    pub written: bool,
    pub root_hash: String,
    /// The previous latest root, when one existed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
    /// Why nothing was written ("unchanged").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    /// Backend identifier of the committed record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
}

/// Wires the cache tier and the storage backend into the change gate.
#[derive(Clone)]
pub struct TreeSync {
    cache: TreeCache,
    store: Arc<dyn TreeStore>,
}

impl TreeSync {
    pub fn new(cache: TreeCache, store: Arc<dyn TreeStore>) -> Self {
        Self { cache, store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn TreeStore> {
        &self.store
    }

    /// Commit `tree` unless its root matches the latest committed root.
    ///
    /// Invoked only from the orchestrator's single-flight critical section;
    /// concurrent *reads* of the latest root stay safe and lock-free.
    pub async fn sync_tree(&self, tree: &MerkleTree, source_path: &str) -> Result<SyncOutcome> {
        let root_hash = tree
            .root_hash()
            .ok_or_else(|| Error::Invalid("tree data has no root hash".to_string()))?
            .to_string();

        // Cache-through read of the baseline.
        let latest = match self.cache.latest_root().await {
            Some(hash) => Some(hash),
            None => {
                let hash = self.store.latest_root_hash().await?;
                if let Some(ref hash) = hash {
                    self.cache.set_latest_root(hash, None).await;
                }
                hash
            }
        };

        if latest.as_deref() == Some(root_hash.as_str()) {
            debug!(root = %root_hash, "root unchanged; skipping commit");
            metrics::record_sync(false);
            return Ok(SyncOutcome {
                written: false,
                root_hash,
                previous_hash: latest,
                reason: Some("unchanged"),
                record_id: None,
            });
        }

        let meta = TreeMeta {
            item_count: tree.leaf_count() as u64,
            source_path: source_path.to_string(),
        };
        let body = tree.to_json();

        // Backend failure propagates here and leaves the cache untouched.
        let stored = self.store.store_tree(&root_hash, &body, &meta).await?;

        let created_at = now_millis();
        let commit_meta = json!({
            "item_count": meta.item_count,
            "source_path": meta.source_path,
            "created_at": created_at,
        });
        self.cache.set_latest_root(&root_hash, Some(commit_meta.clone())).await;
        self.cache.set_tree_metadata(&root_hash, commit_meta).await;

        info!(
            root = %root_hash,
            previous = latest.as_deref().unwrap_or("none"),
            items = meta.item_count,
            "committed new merkle root"
        );
        metrics::record_sync(true);

        Ok(SyncOutcome {
            written: true,
            root_hash,
            previous_hash: latest,
            reason: None,
            record_id: Some(stored.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;

    fn sync_over_memory() -> (TreeSync, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let sync = TreeSync::new(TreeCache::disabled(), store.clone());
        (sync, store)
    }

    #[tokio::test]
    async fn test_first_sync_writes() {
        let (sync, store) = sync_over_memory();
        let tree = MerkleTree::from_data(&["a", "b"]);

        let outcome = sync.sync_tree(&tree, "/watched").await.unwrap();
        assert!(outcome.written);
        assert_eq!(outcome.root_hash, tree.root_hash().unwrap());
        assert!(outcome.previous_hash.is_none());
        assert!(outcome.record_id.is_some());
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_tree_skips_commit() {
        let (sync, store) = sync_over_memory();
        let tree = MerkleTree::from_data(&["a", "b"]);

        sync.sync_tree(&tree, "/watched").await.unwrap();
        let second = sync.sync_tree(&tree, "/watched").await.unwrap();

        assert!(!second.written);
        assert_eq!(second.reason, Some("unchanged"));
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.stats().await.unwrap().total_trees, 1);
    }

    #[tokio::test]
    async fn test_changed_tree_commits_again() {
        let (sync, store) = sync_over_memory();
        let first = MerkleTree::from_data(&["a", "b"]);
        let second = MerkleTree::from_data(&["a", "b", "c"]);

        sync.sync_tree(&first, "/watched").await.unwrap();
        let outcome = sync.sync_tree(&second, "/watched").await.unwrap();

        assert!(outcome.written);
        assert_eq!(outcome.previous_hash.as_deref(), first.root_hash());
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_empty_tree_is_invalid() {
        let (sync, _) = sync_over_memory();
        let tree = MerkleTree::from_data::<&str>(&[]);
        let err = sync.sync_tree(&tree, "/watched").await.unwrap_err();
        assert_eq!(err.kind(), "invalid");
    }

    #[tokio::test]
    async fn test_commit_records_metadata() {
        let (sync, store) = sync_over_memory();
        let tree = MerkleTree::from_data(&["x", "y", "z"]);

        sync.sync_tree(&tree, "/srv/data").await.unwrap();

        let full = store
            .tree_by_root_hash(tree.root_hash().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(full.record.item_count, 3);
        assert_eq!(full.record.source_path, "/srv/data");
        assert_eq!(full.tree["hash"].as_str(), tree.root_hash());
    }
}
