//! merkle-watchd: the long-running scan-and-commit service.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use merkle_watch::cache::TreeCache;
use merkle_watch::config::Config;
use merkle_watch::error::Result;
use merkle_watch::orchestrator::Orchestrator;
use merkle_watch::scheduler::Scheduler;
use merkle_watch::server::{self, AppState};
use merkle_watch::storage;
use merkle_watch::sync::TreeSync;

/// Bounded wait for an in-flight build during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("merkle-watchd: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        source = %config.source_directory.display(),
        interval_minutes = config.scan_interval_minutes,
        "starting merkle-watchd"
    );

    let cache = TreeCache::connect(&config.cache).await;
    let store = storage::connect(&config).await?;
    let sync = TreeSync::new(cache.clone(), store.clone());

    let orchestrator = Arc::new(Orchestrator::new(
        config.source_directory.clone(),
        config.batch_size,
        sync,
        cache.clone(),
    ));

    let scheduler = Scheduler::new(config.scan_interval_minutes, orchestrator.clone());
    scheduler.start();

    let (stop_tx, stop_rx) = watch::channel(false);
    let state = Arc::new(AppState {
        config,
        cache,
        store,
        scheduler: scheduler.clone(),
        orchestrator,
        started_at: Instant::now(),
    });

    let server_task = tokio::spawn(server::serve(state, stop_rx));

    wait_for_shutdown_signal().await;

    // Re-entry guard: a second signal while we drain is ignored.
    if SHUTTING_DOWN.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    info!("shutdown signal received");

    // No new ticks; an in-flight build may finish within the grace period.
    scheduler.stop();
    let _ = stop_tx.send(true);

    let deadline = Instant::now() + SHUTDOWN_GRACE;
    while scheduler.is_build_in_progress() {
        if Instant::now() >= deadline {
            warn!("in-flight build exceeded shutdown grace period; exiting anyway");
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "operator API exited with error"),
        Err(e) => error!(error = %e, "operator API task panicked"),
    }

    info!("shutdown complete");
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// SIGINT and SIGTERM both enter the same graceful path.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "cannot install SIGTERM handler; relying on ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
