//! Relational storage backend.
//!
//! Two tables, written in one transaction:
//!
//! ```sql
//! CREATE TABLE merkle_roots (
//!   id          INTEGER PRIMARY KEY,    -- auto-incrementing
//!   root_hash   VARCHAR(64) NOT NULL UNIQUE,
//!   item_count  BIGINT NOT NULL,        -- > 0, enforced before the write
//!   source_path TEXT NOT NULL,
//!   created_at  BIGINT NOT NULL         -- epoch millis
//! );
//! CREATE TABLE merkle_tree_data (
//!   root_id     BIGINT PRIMARY KEY REFERENCES merkle_roots(id)
//!               ON DELETE CASCADE,
//!   tree_json   LONGTEXT NOT NULL,
//!   created_at  BIGINT NOT NULL
//! );
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver lets one binary speak SQLite and MySQL, at two costs:
//! timestamps are BIGINT millis rather than native datetime types, and
//! TEXT/LONGTEXT columns come back as BLOB, so reads go through `Vec<u8>` →
//! `String::from_utf8`.

use async_trait::async_trait;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use std::sync::Once;
use std::time::Duration;

use serde_json::Value;

use super::{
    validate_store_inputs, now_millis, BackendStats, ConnectionHealth, FullTree, RootRecord,
    StoredTree, TreeMeta, TreeStore,
};
use crate::error::{Error, Result};
use crate::backoff::{with_backoff, Pace};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlStore {
    /// Connect with connect-paced backoff (fails fast if config is wrong)
    /// and create the schema if it does not exist.
    pub async fn new(connection_string: &str, pool_size: u32) -> Result<Self> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = with_backoff("sql_connect", Pace::Connect, || async {
            AnyPoolOptions::new()
                .max_connections(pool_size)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
        })
        .await?;

        let store = Self { pool, is_sqlite };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let roots_sql = if self.is_sqlite {
            r#"
            CREATE TABLE IF NOT EXISTS merkle_roots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                root_hash TEXT NOT NULL UNIQUE,
                item_count INTEGER NOT NULL,
                source_path TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#
        } else {
            r#"
            CREATE TABLE IF NOT EXISTS merkle_roots (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                root_hash VARCHAR(64) NOT NULL UNIQUE,
                item_count BIGINT NOT NULL,
                source_path TEXT NOT NULL,
                created_at BIGINT NOT NULL,
                INDEX idx_roots_created_at (created_at)
            )
            "#
        };

        let data_sql = if self.is_sqlite {
            r#"
            CREATE TABLE IF NOT EXISTS merkle_tree_data (
                root_id INTEGER PRIMARY KEY REFERENCES merkle_roots(id) ON DELETE CASCADE,
                tree_json TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#
        } else {
            r#"
            CREATE TABLE IF NOT EXISTS merkle_tree_data (
                root_id BIGINT PRIMARY KEY,
                tree_json LONGTEXT NOT NULL,
                created_at BIGINT NOT NULL,
                FOREIGN KEY (root_id) REFERENCES merkle_roots(id) ON DELETE CASCADE
            )
            "#
        };

        with_backoff("sql_init_schema", Pace::Connect, || async {
            sqlx::query(roots_sql).execute(&self.pool).await?;
            sqlx::query(data_sql).execute(&self.pool).await?;
            Ok::<_, sqlx::Error>(())
        })
        .await?;

        Ok(())
    }

    fn record_from_row(row: &sqlx::any::AnyRow) -> Result<RootRecord> {
        let id: i64 = row.try_get("id")?;
        let root_hash: String = row.try_get("root_hash")?;
        let item_count: i64 = row.try_get("item_count")?;
        // TEXT comes back as BLOB under the Any driver
        let source_path: String = match row.try_get::<String, _>("source_path") {
            Ok(s) => s,
            Err(_) => {
                let bytes: Vec<u8> = row.try_get("source_path")?;
                String::from_utf8(bytes)
                    .map_err(|e| Error::Io(format!("sql backend: non-utf8 source_path: {e}")))?
            }
        };
        let created_at: i64 = row.try_get("created_at")?;

        Ok(RootRecord {
            id: id.to_string(),
            root_hash,
            item_count: item_count.max(0) as u64,
            source_path,
            created_at,
        })
    }
}

#[async_trait]
impl TreeStore for SqlStore {
    fn kind(&self) -> &'static str {
        "sql"
    }

    async fn latest_root_hash(&self) -> Result<Option<String>> {
        let row = with_backoff("sql_latest_root", Pace::Query, || async {
            sqlx::query(
                "SELECT root_hash FROM merkle_roots ORDER BY created_at DESC, id DESC LIMIT 1",
            )
            .fetch_optional(&self.pool)
            .await
        })
        .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("root_hash")?)),
            None => Ok(None),
        }
    }

    async fn store_tree(
        &self,
        root_hash: &str,
        body: &Value,
        meta: &TreeMeta,
    ) -> Result<StoredTree> {
        validate_store_inputs(root_hash, meta)?;

        let tree_json = serde_json::to_string(body)?;
        let created_at = now_millis();

        // One transaction across both tables; dropping the transaction on
        // any error path rolls back the root row.
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO merkle_roots (root_hash, item_count, source_path, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(root_hash)
        .bind(meta.item_count as i64)
        .bind(&meta.source_path)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        // RETURNING is not portable across the Any driver's dialects; the
        // unique root_hash makes the re-select exact.
        let row = sqlx::query("SELECT id FROM merkle_roots WHERE root_hash = ?")
            .bind(root_hash)
            .fetch_one(&mut *tx)
            .await?;
        let id: i64 = row.try_get("id")?;

        sqlx::query(
            "INSERT INTO merkle_tree_data (root_id, tree_json, created_at) VALUES (?, ?, ?)",
        )
        .bind(id)
        .bind(&tree_json)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(StoredTree {
            id: id.to_string(),
            root_hash: root_hash.to_string(),
        })
    }

    async fn tree_by_root_hash(&self, root_hash: &str) -> Result<Option<FullTree>> {
        let root_hash = root_hash.to_string();
        let row = with_backoff("sql_tree_by_root", Pace::Query, || async {
            sqlx::query(
                "SELECT r.id, r.root_hash, r.item_count, r.source_path, r.created_at, d.tree_json \
                 FROM merkle_roots r \
                 JOIN merkle_tree_data d ON d.root_id = r.id \
                 WHERE r.root_hash = ?",
            )
            .bind(&root_hash)
            .fetch_optional(&self.pool)
            .await
        })
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let record = Self::record_from_row(&row)?;
        let tree_json: String = match row.try_get::<String, _>("tree_json") {
            Ok(s) => s,
            Err(_) => {
                let bytes: Vec<u8> = row.try_get("tree_json")?;
                String::from_utf8(bytes)
                    .map_err(|e| Error::Io(format!("sql backend: non-utf8 tree body: {e}")))?
            }
        };
        let tree: Value = serde_json::from_str(&tree_json)
            .map_err(|e| Error::Io(format!("sql backend: corrupt tree body: {e}")))?;

        Ok(Some(FullTree { record, tree }))
    }

    async fn recent_roots(&self, limit: usize) -> Result<Vec<RootRecord>> {
        // LIMIT placeholders are not portable under Any; the value is a
        // caller-supplied integer, not user text.
        let sql = format!(
            "SELECT id, root_hash, item_count, source_path, created_at \
             FROM merkle_roots ORDER BY created_at DESC, id DESC LIMIT {limit}"
        );

        let rows = with_backoff("sql_recent_roots", Pace::Query, || async {
            sqlx::query(&sql).fetch_all(&self.pool).await
        })
        .await?;

        rows.iter().map(Self::record_from_row).collect()
    }

    async fn test_connection(&self) -> ConnectionHealth {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
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
        let count_row = with_backoff("sql_stats", Pace::Query, || async {
            sqlx::query(
                "SELECT COUNT(*) AS total, MAX(created_at) AS latest, \
                 MIN(created_at) AS earliest, SUM(item_count) AS items \
                 FROM merkle_roots",
            )
            .fetch_one(&self.pool)
            .await
        })
        .await?;

        let total: i64 = count_row.try_get("total")?;
        if total == 0 {
            return Ok(BackendStats::default());
        }

        let latest: Option<i64> = count_row.try_get("latest").ok();
        let earliest: Option<i64> = count_row.try_get("earliest").ok();
        let items: Option<i64> = count_row.try_get("items").ok();

        // LENGTH is in both dialects; good enough for an operator figure.
        let size_row = sqlx::query("SELECT SUM(LENGTH(tree_json)) AS bytes FROM merkle_tree_data")
            .fetch_one(&self.pool)
            .await?;
        let bytes: Option<i64> = size_row.try_get("bytes").ok();

        Ok(BackendStats {
            total_trees: total as u64,
            latest_tree: latest,
            earliest_tree: earliest,
            avg_item_count: items.map(|sum| sum as f64 / total as f64),
            total_size_bytes: bytes.map(|b| b.max(0) as u64),
        })
    }
}
