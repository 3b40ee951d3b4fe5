//! Durable storage for committed root records and tree bodies.
//!
//! One contract, three implementations selected at startup:
//!
//! - [`sql::SqlStore`]: relational, two tables in one transaction
//! - [`object::ObjectStore`]: S3-compatible, content-addressed objects plus
//!   a latest-root pointer
//! - [`memory::MemoryStore`]: in-process, for tests and cache-outage drills
//!
//! Backend-specific failures never leak through the contract; they surface
//! as crate errors classified by cause.

pub mod memory;
pub mod object;
pub mod sql;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};

/// Milliseconds since the Unix epoch; the timestamp unit for every
/// persisted and cached record.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A committed root: the durable artifact of one changed build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootRecord {
    /// Backend-assigned identifier (row id or object key stem).
    pub id: String,
    pub root_hash: String,
    pub item_count: u64,
    pub source_path: String,
    /// Epoch milliseconds.
    pub created_at: i64,
}

/// Commit metadata supplied alongside a tree body.
#[derive(Debug, Clone)]
pub struct TreeMeta {
    pub item_count: u64,
    pub source_path: String,
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, Serialize)]
pub struct StoredTree {
    pub id: String,
    pub root_hash: String,
}

/// A root record together with its full tree body.
#[derive(Debug, Clone, Serialize)]
pub struct FullTree {
    pub record: RootRecord,
    pub tree: Value,
}

/// Connectivity probe result for the health surface.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionHealth {
    pub connected: bool,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate statistics over all committed roots.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendStats {
    pub total_trees: u64,
    /// Epoch millis of the newest commit.
    pub latest_tree: Option<i64>,
    /// Epoch millis of the oldest commit.
    pub earliest_tree: Option<i64>,
    pub avg_item_count: Option<f64>,
    pub total_size_bytes: Option<u64>,
}

/// The storage contract shared by every backend variant.
#[async_trait]
pub trait TreeStore: Send + Sync {
    /// Short variant name for the service descriptor ("sql", "object-store",
    /// "memory").
    fn kind(&self) -> &'static str;

    /// Root hash of the newest committed record, if any.
    async fn latest_root_hash(&self) -> Result<Option<String>>;

    /// Persist a root record and its tree body atomically.
    /// Rejects invalid inputs with `Invalid` before any write.
    async fn store_tree(&self, root_hash: &str, body: &Value, meta: &TreeMeta)
        -> Result<StoredTree>;

    /// Full tree (record + body) for a committed root, `None` when unknown.
    async fn tree_by_root_hash(&self, root_hash: &str) -> Result<Option<FullTree>>;

    /// The newest `limit` records, newest first.
    async fn recent_roots(&self, limit: usize) -> Result<Vec<RootRecord>>;

    /// Connectivity probe; never errors.
    async fn test_connection(&self) -> ConnectionHealth;

    /// Aggregate statistics.
    async fn stats(&self) -> Result<BackendStats>;
}

/// Input validation shared by every variant: runs before any write.
pub(crate) fn validate_store_inputs(root_hash: &str, meta: &TreeMeta) -> Result<()> {
    if root_hash.is_empty() {
        return Err(Error::Invalid("root hash is required".to_string()));
    }
    if root_hash.len() != 64 || !root_hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::Invalid(format!(
            "root hash must be 64 hex chars, got {root_hash:?}"
        )));
    }
    if meta.item_count == 0 {
        return Err(Error::Invalid("item count must be positive".to_string()));
    }
    Ok(())
}

/// Select and connect the backend variant from configuration.
pub async fn connect(config: &Config) -> Result<Arc<dyn TreeStore>> {
    match config.object_store {
        Some(ref object_config) => {
            info!(
                endpoint = %object_config.endpoint,
                bucket = %object_config.bucket,
                "using object-store backend"
            );
            Ok(Arc::new(object::ObjectStore::new(object_config)?))
        }
        None => {
            let url = config.backend_url();
            info!(url = %url, "using relational backend");
            Ok(Arc::new(sql::SqlStore::new(&url, config.db_pool_size).await?))
        }
    }
}
