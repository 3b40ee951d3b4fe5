//! S3-compatible object storage backend.
//!
//! Content-addressed layout, depended on by external consumers:
//!
//! - `trees/<root>.json`: the full tree body
//! - `metadata/roots/<root>.json`: the root record plus a pointer to the
//!   body object
//! - `metadata/latest-root.json`: mutable pointer to the current latest
//!   root
//!
//! A commit writes body, then record, then overwrites the pointer; the
//! pointer flip is a single PUT, so readers see either the previous latest
//! or the new one, never a torn state. A missing pointer object reads as
//! "no commits yet". All objects are `application/json`.

use async_trait::async_trait;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};
use serde_json::{json, Value};

use super::{
    validate_store_inputs, now_millis, BackendStats, ConnectionHealth, FullTree, RootRecord,
    StoredTree, TreeMeta, TreeStore,
};
use crate::config::ObjectStoreConfig;
use crate::error::{Error, Result};
use crate::backoff::{with_backoff, Pace};

const TREE_PREFIX: &str = "trees/";
const ROOT_META_PREFIX: &str = "metadata/roots/";
const LATEST_POINTER_KEY: &str = "metadata/latest-root.json";
const CONTENT_TYPE: &str = "application/json";

pub struct ObjectStore {
    bucket: Bucket,
}

impl ObjectStore {
    /// Build a client for a MinIO-style endpoint with path-style addressing.
    pub fn new(config: &ObjectStoreConfig) -> Result<Self> {
        let scheme = if config.use_ssl { "https" } else { "http" };
        let region = Region::Custom {
            region: config.region.clone(),
            endpoint: format!("{scheme}://{}:{}", config.endpoint, config.port),
        };
        let credentials = Credentials::new(
            Some(&config.access_key),
            Some(&config.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| Error::Invalid(format!("object store credentials: {e}")))?;

        let bucket = Bucket::new(&config.bucket, region, credentials)
            .map_err(|e| Error::Invalid(format!("object store bucket: {e}")))?
            .with_path_style();

        Ok(Self { bucket })
    }

    fn tree_key(root_hash: &str) -> String {
        format!("{TREE_PREFIX}{root_hash}.json")
    }

    fn record_key(root_hash: &str) -> String {
        format!("{ROOT_META_PREFIX}{root_hash}.json")
    }

    /// GET + parse; a 404 in either shape the client reports is `None`.
    async fn get_json(&self, key: &str) -> Result<Option<Value>> {
        let response = with_backoff("s3_get", Pace::Query, || async {
            self.bucket.get_object(key).await
        })
        .await;

        match response {
            Ok(data) if data.status_code() == 404 => Ok(None),
            Ok(data) if (200..300).contains(&data.status_code()) => {
                let value = serde_json::from_slice(data.bytes())
                    .map_err(|e| Error::Io(format!("object store: corrupt object {key}: {e}")))?;
                Ok(Some(value))
            }
            Ok(data) => Err(Error::Io(format!(
                "object store: GET {key} returned {}",
                data.status_code()
            ))),
            Err(S3Error::HttpFailWithBody(404, _)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_json(&self, key: &str, value: &Value) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        let response = with_backoff("s3_put", Pace::Query, || async {
            self.bucket
                .put_object_with_content_type(key, &body, CONTENT_TYPE)
                .await
        })
        .await?;

        if !(200..300).contains(&response.status_code()) {
            return Err(Error::Io(format!(
                "object store: PUT {key} returned {}",
                response.status_code()
            )));
        }
        Ok(())
    }

    fn record_from_json(value: &Value) -> Result<RootRecord> {
        let root_hash = value
            .get("root_hash")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Io("object store: record missing root_hash".to_string()))?;
        Ok(RootRecord {
            id: root_hash.to_string(),
            root_hash: root_hash.to_string(),
            item_count: value.get("item_count").and_then(Value::as_u64).unwrap_or(0),
            source_path: value
                .get("source_path")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            created_at: value.get("created_at").and_then(Value::as_i64).unwrap_or(0),
        })
    }

    /// Fetch every root record under `metadata/roots/`, unordered.
    async fn collect_records(&self) -> Result<Vec<RootRecord>> {
        let listings = with_backoff("s3_list_roots", Pace::Query, || async {
            self.bucket
                .list(ROOT_META_PREFIX.to_string(), None)
                .await
        })
        .await?;

        let mut records = Vec::new();
        for listing in &listings {
            for object in &listing.contents {
                if let Some(record) = self.get_json(&object.key).await? {
                    records.push(Self::record_from_json(&record)?);
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl TreeStore for ObjectStore {
    fn kind(&self) -> &'static str {
        "object-store"
    }

    async fn latest_root_hash(&self) -> Result<Option<String>> {
        let pointer = self.get_json(LATEST_POINTER_KEY).await?;
        Ok(pointer
            .and_then(|p| p.get("root_hash").and_then(Value::as_str).map(String::from)))
    }

    async fn store_tree(
        &self,
        root_hash: &str,
        body: &Value,
        meta: &TreeMeta,
    ) -> Result<StoredTree> {
        validate_store_inputs(root_hash, meta)?;

        let created_at = now_millis();
        let tree_key = Self::tree_key(root_hash);
        let record_key = Self::record_key(root_hash);

        // Body first, record second, pointer last: a reader following the
        // pointer always finds both objects behind it.
        self.put_json(&tree_key, body).await?;

        let record = json!({
            "root_hash": root_hash,
            "item_count": meta.item_count,
            "source_path": meta.source_path,
            "created_at": created_at,
            "tree_object": tree_key,
        });
        self.put_json(&record_key, &record).await?;

        let pointer = json!({
            "root_hash": root_hash,
            "record_object": record_key,
            "updated_at": created_at,
        });
        self.put_json(LATEST_POINTER_KEY, &pointer).await?;

        Ok(StoredTree {
            id: root_hash.to_string(),
            root_hash: root_hash.to_string(),
        })
    }

    async fn tree_by_root_hash(&self, root_hash: &str) -> Result<Option<FullTree>> {
        let Some(record_json) = self.get_json(&Self::record_key(root_hash)).await? else {
            return Ok(None);
        };
        let record = Self::record_from_json(&record_json)?;

        let tree = self
            .get_json(&Self::tree_key(root_hash))
            .await?
            .ok_or_else(|| Error::Io(format!("object store: tree body missing for {root_hash}")))?;

        Ok(Some(FullTree { record, tree }))
    }

    async fn recent_roots(&self, limit: usize) -> Result<Vec<RootRecord>> {
        let mut records = self.collect_records().await?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn test_connection(&self) -> ConnectionHealth {
        match self.bucket.list("metadata/".to_string(), None).await {
            Ok(_) => ConnectionHealth {
                connected: true,
                timestamp: now_millis(),
                error: None,
            },
            Err(e) => ConnectionHealth {
                connected: false,
                timestamp: now_millis(),
                error: Some(e.to_string()),
            },
        }
    }

    async fn stats(&self) -> Result<BackendStats> {
        let records = self.collect_records().await?;
        if records.is_empty() {
            return Ok(BackendStats::default());
        }

        // Body sizes come from the listing, no extra GETs.
        let tree_listings = with_backoff("s3_list_trees", Pace::Query, || async {
            self.bucket.list(TREE_PREFIX.to_string(), None).await
        })
        .await?;
        let total_size: u64 = tree_listings
            .iter()
            .flat_map(|l| l.contents.iter())
            .map(|o| o.size)
            .sum();

        let total = records.len() as u64;
        let item_sum: u64 = records.iter().map(|r| r.item_count).sum();

        Ok(BackendStats {
            total_trees: total,
            latest_tree: records.iter().map(|r| r.created_at).max(),
            earliest_tree: records.iter().map(|r| r.created_at).min(),
            avg_item_count: Some(item_sum as f64 / total as f64),
            total_size_bytes: Some(total_size),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout_is_stable() {
        // Consumers depend on these exact paths.
        assert_eq!(ObjectStore::tree_key("abc"), "trees/abc.json");
        assert_eq!(ObjectStore::record_key("abc"), "metadata/roots/abc.json");
        assert_eq!(LATEST_POINTER_KEY, "metadata/latest-root.json");
    }

    #[test]
    fn test_record_parsing() {
        let value = json!({
            "root_hash": "ff".repeat(32),
            "item_count": 7,
            "source_path": "/watched",
            "created_at": 1700000000000i64,
            "tree_object": "trees/ff.json",
        });
        let record = ObjectStore::record_from_json(&value).unwrap();
        assert_eq!(record.item_count, 7);
        assert_eq!(record.source_path, "/watched");
        assert_eq!(record.id, record.root_hash);
    }

    #[test]
    fn test_record_without_root_hash_is_error() {
        let err = ObjectStore::record_from_json(&json!({"item_count": 1})).unwrap_err();
        assert_eq!(err.kind(), "io");
    }
}
