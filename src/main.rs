//! Torview entry point
//!
//! Loads the run configuration, wires the rotation channel, verifier,
//! visitor and scheduler together, runs every view, and persists the
//! collected identity set — including when the run aborted early.
//!
//! Environment variables:
//! - `TORVIEW_CONFIG` - Config file path (default: platform config dir)
//! - `TORVIEW_CONTROL_PASSWORD` - Tor control password override

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use url::Url;

use torview::control::{CircuitChannel, TorController};
use torview::identity::{HttpProbe, IdentityRegistry, IdentityVerifier};
use torview::journal::Journal;
use torview::scheduler::TrafficScheduler;
use torview::session::RetryingSession;
use torview::stats::RunStats;
use torview::visit::BrowserVisitor;
use torview::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = torview::init_logging();

    info!("Starting torview");
    if let Some(dir) = torview::log_dir() {
        info!("Log files saved to: {}", dir.display());
    }

    let mut config = match std::env::var("TORVIEW_CONFIG") {
        Ok(path) => AppConfig::load_from(Path::new(&path)),
        Err(_) => AppConfig::load(),
    };

    if let Ok(password) = std::env::var("TORVIEW_CONTROL_PASSWORD") {
        config.control.password = password;
    }

    // First positional argument overrides the configured target
    if let Some(target) = std::env::args().nth(1) {
        config.target_url = target;
    }

    let url = Url::parse(&config.target_url)
        .with_context(|| format!("invalid target URL: {:?}", config.target_url))?;

    info!(
        "Run: {} views of {} ({:?} admission, bound {}, {} retries per view)",
        config.views, url, config.policy, config.max_concurrent_views, config.max_retries
    );

    let transport = Arc::new(TorController::new(config.control.clone()));
    let channel = Arc::new(CircuitChannel::new(
        transport,
        Duration::from_millis(config.circuit_settle_ms),
    ));

    let probe = Arc::new(HttpProbe::new(&config.probe).context("failed to build identity probe client")?);
    let verifier = Arc::new(IdentityVerifier::new(
        probe,
        Duration::from_millis(config.probe_timeout_ms),
    ));

    let journal = Arc::new(
        Journal::open(&config.journal_file)
            .await
            .with_context(|| format!("failed to open journal {:?}", config.journal_file))?,
    );

    let visitor = Arc::new(BrowserVisitor::new(
        Some(config.probe.socks_proxy.clone()),
        config.headless,
        config.chrome_path.clone(),
        journal.clone(),
    ));

    let stats = Arc::new(RunStats::new());
    let cancelled = Arc::new(AtomicBool::new(false));
    let registry = Arc::new(tokio::sync::Mutex::new(IdentityRegistry::new()));

    let session = Arc::new(RetryingSession::new(
        channel,
        verifier,
        visitor,
        journal.clone(),
        config.retry_config(),
        cancelled.clone(),
        stats.clone(),
    ));

    let scheduler = TrafficScheduler::new(
        session,
        config.visit_config(),
        config.policy,
        config.max_concurrent_views,
        cancelled.clone(),
        registry.clone(),
        stats.clone(),
    );

    let outcomes = scheduler.run_all(&url, config.views).await;

    // Persist whatever was collected, even after an abort
    {
        let registry = registry.lock().await;
        registry
            .flush(&config.identity_file)
            .await
            .with_context(|| format!("failed to persist identity set to {:?}", config.identity_file))?;
    }

    let snapshot = stats.snapshot();
    info!(
        "Simulation completed in {}s: {} succeeded, {} failed, {} rotations ({} failed), peak concurrency {}",
        snapshot.elapsed_secs,
        snapshot.views_succeeded,
        snapshot.views_failed,
        snapshot.rotations_requested,
        snapshot.rotations_failed,
        snapshot.peak_views,
    );

    if cancelled.load(std::sync::atomic::Ordering::SeqCst) {
        warn!("Run was aborted early; identity set persisted up to the abort");
    }

    journal
        .log(format!(
            "Run complete: {}/{} views succeeded, {} unique identities",
            snapshot.views_succeeded,
            outcomes.len(),
            registry.lock().await.len()
        ))
        .await;

    Ok(())
}
