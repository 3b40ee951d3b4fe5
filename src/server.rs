//! Operator HTTP surface.
//!
//! A deliberately small HTTP/1.1 responder over `tokio::net::TcpListener`:
//! accept loop, one task per connection, request-line parsing, JSON bodies,
//! `Connection: close`. The routes are few, the payloads are small, and the
//! audience is operators and health probes.
//!
//! Handlers only read status snapshots and issue cache/backend reads; the
//! manual-trigger route is the single path that can start a build, and it
//! goes through the scheduler's single-flight guard like every other build.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::TreeCache;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics;
use crate::orchestrator::Orchestrator;
use crate::scheduler::Scheduler;
use crate::storage::TreeStore;

const MAX_REQUEST_BYTES: usize = 8192;

/// Everything a handler can reach.
pub struct AppState {
    pub config: Config,
    pub cache: TreeCache,
    pub store: Arc<dyn TreeStore>,
    pub scheduler: Arc<Scheduler>,
    pub orchestrator: Arc<Orchestrator>,
    pub started_at: Instant,
}

/// Bind and serve until the stop signal flips.
pub async fn serve(state: Arc<AppState>, mut stop_rx: watch::Receiver<bool>) -> Result<()> {
    let addr = ("0.0.0.0", state.config.port);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Io(format!("cannot bind port {}: {e}", state.config.port)))?;
    info!(port = state.config.port, "operator API listening");

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    info!("operator API shutting down");
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, state).await {
                                debug!(error = %e, "connection closed with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<AppState>) -> std::io::Result<()> {
    let started = Instant::now();
    let request = match read_request(&mut stream).await? {
        Some(request) => request,
        None => return Ok(()), // client went away before sending anything
    };

    let (status, body) = dispatch(&state, &request.method, &request.path).await;
    write_response(&mut stream, status, &body).await?;

    metrics::record_http_request(&request.path, status, started.elapsed());
    info!(method = %request.method, path = %request.path, status, "request handled");
    Ok(())
}

struct Request {
    method: String,
    path: String,
}

/// Read until the header terminator and parse the request line. The bodies
/// of the POST routes carry nothing we use, so the remainder is ignored.
async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<Request>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() >= MAX_REQUEST_BYTES {
            break;
        }
    }

    if buf.is_empty() {
        return Ok(None);
    }

    let text = String::from_utf8_lossy(&buf);
    let request_line = text.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default();
    // Query strings are accepted and ignored.
    let path = target.split('?').next().unwrap_or_default().to_string();

    Ok(Some(Request { method, path }))
}

async fn write_response(stream: &mut TcpStream, status: u16, body: &Value) -> std::io::Result<()> {
    let payload = body.to_string();
    let response = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
        reason_phrase(status),
        payload.len(),
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

const fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        409 => "Conflict",
        422 => "Unprocessable Entity",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

async fn dispatch(state: &AppState, method: &str, path: &str) -> (u16, Value) {
    let result = match (method, path) {
        ("GET", "/") => Ok(descriptor(state).await),
        ("GET", "/health") => Ok(health(state).await),
        ("GET", "/health/status") => detailed_status(state).await,
        ("GET", "/health/cache") => Ok(cache_health(state).await),
        ("POST", "/health/cache/clear") => Ok(cache_clear(state).await),
        ("POST", "/health/cache/warmup") => cache_warmup(state).await,
        ("POST", "/health/build") => manual_build(state).await,
        _ => {
            return (
                404,
                json!({
                    "error": "not_found",
                    "message": format!("no route for {method} {path}"),
                }),
            )
        }
    };

    match result {
        Ok((status, body)) => (status, body),
        Err(e) => {
            warn!(method, path, kind = e.kind(), error = %e, "handler failed");
            // Outside development, internal details stay internal.
            let message = if state.config.is_development() {
                e.to_string()
            } else {
                "internal error".to_string()
            };
            (e.http_status(), json!({ "error": e.kind(), "message": message }))
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn descriptor(state: &AppState) -> (u16, Value) {
    let body = json!({
        "name": "merkle-watch",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "ok",
        "features": {
            "cache_enabled": state.cache.is_enabled(),
            "cache_connected": state.cache.is_connected().await,
            "backend": state.store.kind(),
        },
        "endpoints": {
            "health": "GET /health",
            "status": "GET /health/status",
            "cache": "GET /health/cache",
            "cache_clear": "POST /health/cache/clear",
            "cache_warmup": "POST /health/cache/warmup",
            "build": "POST /health/build",
        },
    });
    (200, body)
}

async fn health(state: &AppState) -> (u16, Value) {
    let started = Instant::now();

    let backend = state.store.test_connection().await;
    metrics::set_backend_healthy(backend.connected);
    let backend_stats = state.store.stats().await.ok();

    let cache_connected = state.cache.ping().await;
    let scheduler_healthy = state.scheduler.is_healthy();
    let filesystem_ok = tokio::fs::metadata(state.orchestrator.source_dir())
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);

    let last_build = state.orchestrator.last_build();
    let builder_status = match &last_build {
        None => "pending",
        Some(build) if build.success => "healthy",
        Some(_) => "warning",
    };

    // Cache being down is a warning, not a failure.
    let healthy = backend.connected && scheduler_healthy && filesystem_ok;

    let body = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "checks": {
            "backend": if backend.connected { "healthy" } else { "unhealthy" },
            "cache": if !state.cache.is_enabled() {
                "disabled"
            } else if cache_connected {
                "healthy"
            } else {
                "warning"
            },
            "scheduler": if scheduler_healthy { "healthy" } else { "unhealthy" },
            "tree_builder": builder_status,
            "file_system": if filesystem_ok { "healthy" } else { "unhealthy" },
        },
        "backend": {
            "kind": state.store.kind(),
            "connection": backend,
            "stats": backend_stats,
        },
        "last_build": last_build,
        "telemetry": {
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "response_time_ms": started.elapsed().as_millis() as u64,
            "memory_rss_kb": memory_rss_kb(),
        },
    });

    (if healthy { 200 } else { 503 }, body)
}

async fn detailed_status(state: &AppState) -> Result<(u16, Value)> {
    let recent = state.store.recent_roots(5).await?;
    let backend = state.store.test_connection().await;
    let stats = state.store.stats().await.ok();

    let body = json!({
        "scheduler": state.scheduler.status(),
        "builder": {
            "last_build": state.orchestrator.last_build(),
            "build_status": state.orchestrator.build_status().await,
            "source_directory": state.orchestrator.source_dir(),
        },
        "backend": {
            "kind": state.store.kind(),
            "connection": backend,
            "stats": stats,
        },
        "cache": state.cache.stats().await,
        "recent_roots": recent,
    });
    Ok((200, body))
}

async fn cache_health(state: &AppState) -> (u16, Value) {
    let stats = state.cache.stats().await;
    let body = json!({
        "healthy": stats.connected || !stats.enabled,
        "ping": state.cache.ping().await,
        "stats": stats,
    });
    (200, body)
}

async fn cache_clear(state: &AppState) -> (u16, Value) {
    let cleared = state.cache.invalidate("merkle:*").await;
    info!(cleared, "cache cleared by operator");
    (200, json!({ "cleared": cleared }))
}

async fn cache_warmup(state: &AppState) -> Result<(u16, Value)> {
    let warmed = state.orchestrator.warm_cache().await?;
    info!(warmed, "cache warmed by operator");
    Ok((200, json!({ "warmed": warmed })))
}

async fn manual_build(state: &AppState) -> Result<(u16, Value)> {
    let outcome = state.scheduler.trigger_now().await?;
    Ok((200, serde_json::to_value(&outcome)?))
}

/// Resident set size from /proc, where available.
fn memory_rss_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}
