// packages/uplink/src/main.rs
//! Replay Uplink
//!
//! Offline sweep over a storage root: finalizes a session orphaned by a
//! crash, ships leftover event logs and persisted retry uploads, then exits.

use anyhow::{Context, Result};
use replay_uplink::observability::{init_metrics, init_tracing};
use replay_uplink::session::recovery::RecoveryOutcome;
use replay_uplink::session::CheckpointStore;
use replay_uplink::utils::config::StorageConfig;
use replay_uplink::{BuildInfo, HyperTransport, PipelineConfig, SessionContext, TelemetryPipeline};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Time allowed for pending uploads before the sweep gives up
const SHIP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize observability (tracing, metrics, logging)
    init_tracing()?;
    let metrics = init_metrics()?;

    let build = BuildInfo::current();
    info!(
        "Starting Replay Uplink v{} ({}, built {})",
        build.version, build.git_hash, build.build_timestamp
    );

    // Load configuration
    let config = PipelineConfig::load().context("loading configuration")?;
    info!("Configuration loaded: {:?}", config);

    let transport = Arc::new(HyperTransport::new(Duration::from_millis(
        config.ingest.request_timeout_ms,
    )));
    let ingest = config.ingest.clone();
    let storage = config.storage.clone();
    let pipeline = TelemetryPipeline::new(config, transport).context("building pipeline")?;

    match pipeline.recover_orphans().await? {
        RecoveryOutcome::NoOrphan => info!("No orphaned session found"),
        RecoveryOutcome::Recovered {
            session_id,
            events_shipped,
            finalized,
            ..
        } => info!(
            "Recovered session {} ({} events, finalized={})",
            session_id, events_shipped, finalized
        ),
    }

    // Sweep runs under its own session id so leftover logs are signed with
    // the configured credentials
    let mut sweep = SessionContext::new(
        format!("sweep-{}", ulid::Ulid::new()),
        ingest.endpoint.as_str(),
        chrono::Utc::now().timestamp_millis(),
    );
    sweep.project_key = ingest.project_key;
    sweep.upload_token = ingest.upload_token;

    let sweep_id = sweep.session_id.clone();
    pipeline.activate(sweep).await?;
    let swept = pipeline.sweep_orphaned_logs().await?;
    let report = pipeline.dispatcher().ship_pending(SHIP_TIMEOUT).await;

    info!(
        "Sweep complete: {} leftover logs, {}/{} pending uploads delivered",
        swept, report.delivered, report.attempted
    );
    if report.remaining > 0 {
        warn!("{} uploads remain queued for the next run", report.remaining);
    }

    pipeline.halt().await;
    remove_sweep_session(&storage, &sweep_id);

    let snapshot = pipeline.telemetry().snapshot();
    info!(
        "Uploads: {} ok, {} failed, {} dropped ({:.1}% success)",
        snapshot.upload_success,
        snapshot.upload_failure,
        snapshot.upload_dropped,
        snapshot.upload_success_rate()
    );
    info!("Metrics:\n{}", metrics.render());

    Ok(())
}

/// The sweep session never records events; drop its checkpoint and log directory.
fn remove_sweep_session(storage: &StorageConfig, session_id: &str) {
    if let Err(e) = CheckpointStore::new(storage.checkpoint_path()).clear() {
        warn!("Could not clear sweep checkpoint: {}", e);
    }
    let dir = storage.session_dir(session_id);
    if let Err(e) = std::fs::remove_dir_all(&dir) {
        warn!("Could not remove sweep session directory {:?}: {}", dir, e);
    }
}
