//! In-memory backend implementing the full storage contract.
//!
//! Used by the test suite and by cache-outage drills; behaviorally
//! equivalent to the durable variants, minus the durability.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;

use super::{
    validate_store_inputs, now_millis, BackendStats, ConnectionHealth, FullTree, RootRecord,
    StoredTree, TreeMeta, TreeStore,
};
use crate::error::{Error, Result};

#[derive(Default)]
struct Inner {
    records: Vec<RootRecord>,
    bodies: HashMap<String, Value>,
    next_id: u64,
    writes: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    /// Total successful `store_tree` calls; lets tests assert the change
    /// gate wrote exactly once.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.inner.lock().writes
    }
}

#[async_trait]
impl TreeStore for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn latest_root_hash(&self) -> Result<Option<String>> {
        let inner = self.inner.lock();
        // Insertion order breaks same-millisecond ties.
        Ok(inner
            .records
            .iter()
            .enumerate()
            .max_by_key(|(i, r)| (r.created_at, *i))
            .map(|(_, r)| r.root_hash.clone()))
    }

    async fn store_tree(
        &self,
        root_hash: &str,
        body: &Value,
        meta: &TreeMeta,
    ) -> Result<StoredTree> {
        validate_store_inputs(root_hash, meta)?;

        let mut inner = self.inner.lock();
        if inner.records.iter().any(|r| r.root_hash == root_hash) {
            return Err(Error::Invalid(format!("root hash {root_hash} already committed")));
        }

        inner.next_id += 1;
        let id = inner.next_id.to_string();
        inner.records.push(RootRecord {
            id: id.clone(),
            root_hash: root_hash.to_string(),
            item_count: meta.item_count,
            source_path: meta.source_path.clone(),
            created_at: now_millis(),
        });
        inner.bodies.insert(root_hash.to_string(), body.clone());
        inner.writes += 1;

        Ok(StoredTree {
            id,
            root_hash: root_hash.to_string(),
        })
    }

    async fn tree_by_root_hash(&self, root_hash: &str) -> Result<Option<FullTree>> {
        let inner = self.inner.lock();
        let record = match inner.records.iter().find(|r| r.root_hash == root_hash) {
            Some(record) => record.clone(),
            None => return Ok(None),
        };
        let tree = inner
            .bodies
            .get(root_hash)
            .cloned()
            .ok_or_else(|| Error::Io(format!("tree body missing for {root_hash}")))?;
        Ok(Some(FullTree { record, tree }))
    }

    async fn recent_roots(&self, limit: usize) -> Result<Vec<RootRecord>> {
        let inner = self.inner.lock();
        let mut records = inner.records.clone();
        records.reverse();
        // Stable sort keeps reverse-insertion order within equal timestamps.
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn test_connection(&self) -> ConnectionHealth {
        ConnectionHealth {
            connected: true,
            timestamp: now_millis(),
            error: None,
        }
    }

    async fn stats(&self) -> Result<BackendStats> {
        let inner = self.inner.lock();
        if inner.records.is_empty() {
            return Ok(BackendStats::default());
        }

        let total = inner.records.len() as u64;
        let item_sum: u64 = inner.records.iter().map(|r| r.item_count).sum();
        let size_sum: u64 = inner
            .bodies
            .values()
            .map(|b| b.to_string().len() as u64)
            .sum();

        Ok(BackendStats {
            total_trees: total,
            latest_tree: inner.records.iter().map(|r| r.created_at).max(),
            earliest_tree: inner.records.iter().map(|r| r.created_at).min(),
            avg_item_count: Some(item_sum as f64 / total as f64),
            total_size_bytes: Some(size_sum),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(count: u64) -> TreeMeta {
        TreeMeta {
            item_count: count,
            source_path: "/data".to_string(),
        }
    }

    fn hash(seed: u8) -> String {
        format!("{:02x}", seed).repeat(32)
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = MemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.latest_root_hash().await.unwrap(), None);
        assert!(store.recent_roots(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_and_fetch_roundtrip() {
        let store = MemoryStore::new();
        let body = json!({"hash": hash(1), "left": {}, "right": {}});

        let stored = store.store_tree(&hash(1), &body, &meta(4)).await.unwrap();
        assert_eq!(stored.root_hash, hash(1));

        let full = store.tree_by_root_hash(&hash(1)).await.unwrap().unwrap();
        assert_eq!(full.record.item_count, 4);
        assert_eq!(full.tree, body);
        assert_eq!(store.latest_root_hash().await.unwrap(), Some(hash(1)));
    }

    #[tokio::test]
    async fn test_unknown_root_is_none() {
        let store = MemoryStore::new();
        assert!(store.tree_by_root_hash(&hash(9)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_root_rejected() {
        let store = MemoryStore::new();
        let body = json!({});
        store.store_tree(&hash(1), &body, &meta(1)).await.unwrap();
        let err = store.store_tree(&hash(1), &body, &meta(1)).await.unwrap_err();
        assert_eq!(err.kind(), "invalid");
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_inputs_rejected_before_write() {
        let store = MemoryStore::new();
        assert!(store.store_tree("", &json!({}), &meta(1)).await.is_err());
        assert!(store.store_tree(&hash(1), &json!({}), &meta(0)).await.is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_recent_roots_newest_first() {
        let store = MemoryStore::new();
        for seed in 1..=4 {
            store
                .store_tree(&hash(seed), &json!({}), &meta(seed as u64))
                .await
                .unwrap();
        }

        let recent = store.recent_roots(3).await.unwrap();
        assert_eq!(recent.len(), 3);
        // Same-millisecond commits fall back to insertion order.
        assert_eq!(recent[0].root_hash, hash(4));
        assert_eq!(recent[2].root_hash, hash(2));
    }

    #[tokio::test]
    async fn test_stats_aggregates() {
        let store = MemoryStore::new();
        store.store_tree(&hash(1), &json!({}), &meta(2)).await.unwrap();
        store.store_tree(&hash(2), &json!({}), &meta(4)).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_trees, 2);
        assert_eq!(stats.avg_item_count, Some(3.0));
        assert!(stats.latest_tree.unwrap() >= stats.earliest_tree.unwrap());
        assert!(stats.total_size_bytes.unwrap() > 0);
    }
}
