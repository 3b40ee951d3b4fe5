//! TTL'd read-acceleration cache over Redis.
//!
//! The cache is a pure accelerator: it is never the source of truth, and
//! every operation is safe on outage. A disabled or unreachable cache turns
//! reads into misses and writes into no-ops; callers cannot observe a
//! cache-originated error, only a latency difference.
//!
//! # Keys
//!
//! - `merkle:latest_root_hash`: the change-detection baseline
//! - `merkle:tree_metadata:<root>`: per-root metadata (2x default TTL)
//! - `merkle:build_status`: last build snapshot (300 s TTL)
//!
//! Values are JSON envelopes carrying the payload plus a `cached_at`
//! timestamp.
//!
//! # Reconnection
//!
//! The connection manager retries failed commands with exponential backoff
//! capped at 3 s and gives the caller a miss after 10 attempts while
//! continuing to reconnect in the background. When even the initial
//! connection fails, a background task keeps retrying forever and installs
//! the connection once the server comes back.

use std::sync::Arc;

use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::AsyncCommands;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::metrics;
use crate::backoff::{with_backoff, Pace};
use crate::storage::now_millis;

/// Key for the most recently committed root hash.
pub const LATEST_ROOT_KEY: &str = "merkle:latest_root_hash";
/// Key prefix for per-root metadata.
pub const TREE_METADATA_PREFIX: &str = "merkle:tree_metadata:";
/// Key for the last build status snapshot.
pub const BUILD_STATUS_KEY: &str = "merkle:build_status";

/// Everything the cache owns lives under this namespace.
const NAMESPACE: &str = "merkle:";
const BUILD_STATUS_TTL_SECS: u64 = 300;
const RECONNECT_MAX_DELAY_MS: u64 = 3000;
const RECONNECT_ATTEMPTS: usize = 10;
const SCAN_BATCH: usize = 100;

/// Point-in-time cache statistics for the operator surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub connected: bool,
    pub key_count: usize,
    pub keys: Vec<String>,
}

/// Shared handle to the cache tier; cheap to clone, safe to use
/// concurrently.
#[derive(Clone)]
pub struct TreeCache {
    conn: Arc<RwLock<Option<ConnectionManager>>>,
    enabled: bool,
    default_ttl: u64,
}

impl TreeCache {
    /// A cache that is off by configuration: every read misses, every write
    /// returns false.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            conn: Arc::new(RwLock::new(None)),
            enabled: false,
            default_ttl: 0,
        }
    }

    /// Connect to Redis. Never fails: if the server is unreachable the
    /// handle starts in degraded mode and a background task keeps retrying.
    pub async fn connect(config: &CacheConfig) -> Self {
        if !config.enabled {
            info!("cache tier disabled by configuration");
            return Self::disabled();
        }

        let cache = Self {
            conn: Arc::new(RwLock::new(None)),
            enabled: true,
            default_ttl: config.default_ttl_seconds,
        };

        let url = config.url();
        match Self::open(&url).await {
            Ok(manager) => {
                *cache.conn.write().await = Some(manager);
                metrics::set_cache_connected(true);
                info!(host = %config.host, port = config.port, "cache connected");
            }
            Err(e) => {
                warn!(error = %e, "cache unreachable at startup; continuing without it");
                metrics::set_cache_connected(false);
                cache.spawn_reconnect(url);
            }
        }

        cache
    }

    async fn open(url: &str) -> Result<ConnectionManager, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let manager_config = ConnectionManagerConfig::new()
            .set_number_of_retries(RECONNECT_ATTEMPTS)
            .set_max_delay(RECONNECT_MAX_DELAY_MS);
        ConnectionManager::new_with_config(client, manager_config).await
    }

    /// Background reconnection after a failed initial connect.
    fn spawn_reconnect(&self, url: String) {
        let conn = self.conn.clone();
        tokio::spawn(async move {
            let manager = with_backoff("cache_reconnect", Pace::Reconnect, || async {
                Self::open(&url).await
            })
            .await;
            // unbounded pace only ever resolves with Ok
            if let Ok(manager) = manager {
                *conn.write().await = Some(manager);
                metrics::set_cache_connected(true);
                info!("cache connection established in background");
            }
        });
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.read().await.is_some()
    }

    async fn manager(&self) -> Option<ConnectionManager> {
        if !self.enabled {
            return None;
        }
        self.conn.read().await.clone()
    }

    // =========================================================================
    // Generic operations
    // =========================================================================

    /// Read a key; `None` on miss, outage, or malformed envelope.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut conn = self.manager().await?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(raw)) => match unwrap_envelope(&raw) {
                Some(payload) => {
                    metrics::record_cache_operation("get", "hit");
                    Some(payload)
                }
                None => {
                    warn!(key, "dropping malformed cache envelope");
                    metrics::record_cache_operation("get", "error");
                    None
                }
            },
            Ok(None) => {
                metrics::record_cache_operation("get", "miss");
                None
            }
            Err(e) => {
                warn!(key, error = %e, "cache get failed; treating as miss");
                metrics::record_cache_operation("get", "error");
                None
            }
        }
    }

    /// Write a key with a TTL (default TTL when `ttl_secs` is `None`).
    /// Returns false when the cache is down or disabled.
    pub async fn set(&self, key: &str, payload: Value, ttl_secs: Option<u64>) -> bool {
        let Some(mut conn) = self.manager().await else {
            return false;
        };
        let ttl = ttl_secs.unwrap_or(self.default_ttl).max(1);
        let raw = wrap_envelope(payload).to_string();
        match conn.set_ex::<_, _, ()>(key, raw, ttl).await {
            Ok(()) => {
                metrics::record_cache_operation("set", "ok");
                true
            }
            Err(e) => {
                warn!(key, error = %e, "cache set failed; skipping");
                metrics::record_cache_operation("set", "error");
                false
            }
        }
    }

    /// Delete a key. Returns false when nothing was deleted or the cache is
    /// down.
    pub async fn del(&self, key: &str) -> bool {
        let Some(mut conn) = self.manager().await else {
            return false;
        };
        match conn.del::<_, i64>(key).await {
            Ok(n) => n > 0,
            Err(e) => {
                warn!(key, error = %e, "cache del failed; skipping");
                false
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        let Some(mut conn) = self.manager().await else {
            return false;
        };
        match conn.exists::<_, bool>(key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(key, error = %e, "cache exists failed; treating as absent");
                false
            }
        }
    }

    /// Delete every key matching a glob within the `merkle:` namespace.
    /// Returns the number of keys removed.
    pub async fn invalidate(&self, pattern: &str) -> u64 {
        if !pattern.starts_with(NAMESPACE) {
            warn!(pattern, "refusing to invalidate outside the merkle: namespace");
            return 0;
        }
        let Some(mut conn) = self.manager().await else {
            return 0;
        };

        let keys = match scan_keys(&mut conn, pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(pattern, error = %e, "cache scan failed; nothing invalidated");
                return 0;
            }
        };
        if keys.is_empty() {
            return 0;
        }

        match conn.del::<_, i64>(keys).await {
            Ok(n) => {
                debug!(pattern, deleted = n, "cache invalidated");
                n.max(0) as u64
            }
            Err(e) => {
                warn!(pattern, error = %e, "cache del failed during invalidation");
                0
            }
        }
    }

    /// Liveness probe; false when disabled or down.
    pub async fn ping(&self) -> bool {
        let Some(mut conn) = self.manager().await else {
            return false;
        };
        match redis::cmd("PING").query_async::<String>(&mut conn).await {
            Ok(pong) => pong == "PONG",
            Err(e) => {
                warn!(error = %e, "cache ping failed");
                false
            }
        }
    }

    /// Key count and key list for the operator surface.
    pub async fn stats(&self) -> CacheStats {
        let connected = self.is_connected().await;
        let keys = match self.manager().await {
            Some(mut conn) => scan_keys(&mut conn, &format!("{NAMESPACE}*"))
                .await
                .unwrap_or_default(),
            None => Vec::new(),
        };
        CacheStats {
            enabled: self.enabled,
            connected,
            key_count: keys.len(),
            keys,
        }
    }

    // =========================================================================
    // Typed helpers for the well-known keys
    // =========================================================================

    /// The cached latest root hash, if present.
    pub async fn latest_root(&self) -> Option<String> {
        let payload = self.get(LATEST_ROOT_KEY).await?;
        payload
            .get("root_hash")
            .and_then(Value::as_str)
            .map(String::from)
    }

    /// Cache the latest root hash together with optional commit metadata.
    pub async fn set_latest_root(&self, root_hash: &str, metadata: Option<Value>) -> bool {
        let payload = json!({
            "root_hash": root_hash,
            "metadata": metadata,
        });
        self.set(LATEST_ROOT_KEY, payload, None).await
    }

    #[must_use]
    pub fn metadata_key(root_hash: &str) -> String {
        format!("{TREE_METADATA_PREFIX}{root_hash}")
    }

    pub async fn tree_metadata(&self, root_hash: &str) -> Option<Value> {
        self.get(&Self::metadata_key(root_hash)).await
    }

    /// Per-root metadata is kept twice as long as the default TTL.
    pub async fn set_tree_metadata(&self, root_hash: &str, metadata: Value) -> bool {
        self.set(
            &Self::metadata_key(root_hash),
            metadata,
            Some(self.default_ttl.saturating_mul(2)),
        )
        .await
    }

    pub async fn build_status(&self) -> Option<Value> {
        self.get(BUILD_STATUS_KEY).await
    }

    pub async fn set_build_status(&self, status: Value) -> bool {
        self.set(BUILD_STATUS_KEY, status, Some(BUILD_STATUS_TTL_SECS)).await
    }
}

/// SCAN the keyspace for `pattern` without blocking the server.
async fn scan_keys(
    conn: &mut ConnectionManager,
    pattern: &str,
) -> Result<Vec<String>, redis::RedisError> {
    let mut keys = Vec::new();
    let mut cursor: u64 = 0;
    loop {
        let (next, mut batch): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_BATCH)
            .query_async(conn)
            .await?;
        keys.append(&mut batch);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    Ok(keys)
}

fn wrap_envelope(payload: Value) -> Value {
    json!({
        "payload": payload,
        "cached_at": now_millis(),
    })
}

fn unwrap_envelope(raw: &str) -> Option<Value> {
    let envelope: Value = serde_json::from_str(raw).ok()?;
    envelope.get("payload").cloned()
}
