// packages/uplink/src/session/recovery.rs
//! Orphaned session recovery
//!
//! A checkpoint left on disk means the previous process died before its
//! session was concluded. Recovery ships the events that session left in
//! its on-disk log past the upload watermark, sends the session-end signal
//! with the persisted credentials and deletes the checkpoint whether or
//! not that worked.

use crate::buffering::compressor::Compressor;
use crate::buffering::envelope::{encode_event_batch, SerializedEvent};
use crate::buffering::event_buffer::EventBuffer;
use crate::buffering::frame_queue::{FrameBundleQueue, DEFAULT_FRAME_QUEUE_CAPACITY};
use crate::session::checkpoint::CheckpointStore;
use crate::session::{validate_session_id, SessionContext};
use crate::upload::dispatcher::SegmentDispatcher;
use crate::upload::protocol::PendingUpload;
use crate::utils::errors::{PipelineError, Result};
use std::path::Path;
use tracing::{info, warn};

/// Batch number used for a recovered log; live batches start at 1
pub const RECOVERY_BATCH_NUMBER: u32 = 0;

/// Spilled frame bundles live in this subdirectory of the session directory
pub const FRAMES_DIR: &str = "frames";

/// What recovery found and did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No checkpoint, or it belongs to the running session
    NoOrphan,

    Recovered {
        session_id: String,
        events_shipped: usize,
        ended_at_ms: i64,
        finalized: bool,
    },
}

/// Finalize the session a leftover checkpoint points at, if any.
pub async fn recover_orphaned_session(
    store: &CheckpointStore,
    events: &EventBuffer,
    dispatcher: &SegmentDispatcher,
    compressor: &Compressor,
    current_session_id: Option<&str>,
) -> Result<RecoveryOutcome> {
    let Some(checkpoint) = store.load()? else {
        return Ok(RecoveryOutcome::NoOrphan);
    };
    if Some(checkpoint.session_id.as_str()) == current_session_id {
        return Ok(RecoveryOutcome::NoOrphan);
    }

    info!("Recovering orphaned session {}", checkpoint.session_id);
    let ctx = checkpoint.to_context();

    // An id that is unsafe as a path never had anything written for it
    let on_disk = match validate_session_id(&checkpoint.session_id) {
        Ok(()) => true,
        Err(e) => {
            warn!("Not reading local state of orphaned session: {}", e);
            false
        }
    };

    let pending = if on_disk {
        events.read_undelivered_for(&checkpoint.session_id).unwrap_or_else(|e| {
            warn!("Could not read events of orphaned session: {}", e);
            Vec::new()
        })
    } else {
        Vec::new()
    };

    // a fully delivered log is empty but its sidecar keeps the last timestamp
    let logged_last_ms = if on_disk {
        events
            .pending_summary(&checkpoint.session_id)
            .ok()
            .flatten()
            .map(|meta| meta.last_event_timestamp)
            .filter(|ts| *ts > 0)
    } else {
        None
    };
    let last_event_ms = pending.iter().map(|e| e.timestamp_ms).max().max(logged_last_ms);

    let mut events_shipped = 0;
    if !pending.is_empty() {
        let serialized: Vec<SerializedEvent> = pending.iter().filter_map(|e| e.serialize().ok()).collect();
        match ship_event_log(dispatcher, compressor, Some(&ctx), &checkpoint.session_id, &serialized).await {
            Ok(count) => {
                events_shipped = count;
                if let Err(e) = events.clear_session(&checkpoint.session_id) {
                    warn!("Failed to clear recovered event log: {}", e);
                }
            }
            Err(e) => warn!("Failed to ship events of orphaned session: {}", e),
        }
    }

    if on_disk {
        let frames_dir = events.session_dir(&checkpoint.session_id).join(FRAMES_DIR);
        if let Err(e) = ship_spilled_frames(dispatcher, Some(&ctx), &checkpoint.session_id, &frames_dir).await {
            warn!("Failed to ship spilled frames of orphaned session: {}", e);
        }
    }

    let ended_at_ms = last_event_ms
        .or(checkpoint.last_active_ms)
        .unwrap_or(checkpoint.start_ms);

    let finalized = match dispatcher.conclude_with(&ctx, ended_at_ms, None).await {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to finalize orphaned session {}: {}", checkpoint.session_id, e);
            false
        }
    };

    if let Err(e) = store.clear() {
        warn!("Failed to delete checkpoint after recovery: {}", e);
    }

    info!(
        "Orphaned session {} recovered ({} events, endedAt {}, finalized={})",
        checkpoint.session_id, events_shipped, ended_at_ms, finalized
    );

    Ok(RecoveryOutcome::Recovered {
        session_id: checkpoint.session_id,
        events_shipped,
        ended_at_ms,
        finalized,
    })
}

/// Ship a session's logged events as one gzip batch with a single inline
/// attempt. `ctx` overrides the dispatcher's current credentials.
pub async fn ship_event_log(
    dispatcher: &SegmentDispatcher,
    compressor: &Compressor,
    ctx: Option<&SessionContext>,
    session_id: &str,
    events: &[SerializedEvent],
) -> Result<usize> {
    if events.is_empty() {
        return Ok(0);
    }

    let batch = encode_event_batch(session_id, RECOVERY_BATCH_NUMBER, events)?;
    let payload = compressor.compress(&batch)?;

    let first = events.iter().map(|e| e.timestamp_ms).min().unwrap_or(0).max(0) as u64;
    let last = events.iter().map(|e| e.timestamp_ms).max().unwrap_or(0).max(0) as u64;
    let count = u32::try_from(events.len())
        .map_err(|_| PipelineError::SerializationFailed("event log too large".to_string()))?;

    let upload = PendingUpload::events(session_id, RECOVERY_BATCH_NUMBER, payload, first, last, count);
    match ctx {
        Some(ctx) => dispatcher.deliver_with(ctx, &upload).await?,
        None => dispatcher.deliver_now(&upload).await?,
    };

    Ok(events.len())
}

/// Deliver frame bundles spilled to `dir`, one inline attempt each.
///
/// Stops at the first failure and spills what is left back to `dir`.
/// Returns how many bundles were delivered.
pub async fn ship_spilled_frames(
    dispatcher: &SegmentDispatcher,
    ctx: Option<&SessionContext>,
    session_id: &str,
    dir: &Path,
) -> Result<usize> {
    let queue = FrameBundleQueue::new(DEFAULT_FRAME_QUEUE_CAPACITY);
    if queue.reload_from(dir)? == 0 {
        return Ok(0);
    }

    let mut delivered = 0;
    while let Some(bundle) = queue.dequeue() {
        let upload = PendingUpload::segment(session_id, &bundle);
        let outcome = match ctx {
            Some(ctx) => dispatcher.deliver_with(ctx, &upload).await,
            None => dispatcher.deliver_now(&upload).await,
        };
        if let Err(e) = outcome {
            warn!("Spilled segment delivery failed: {}", e);
            queue.requeue(bundle);
            break;
        }
        delivered += 1;
    }

    if !queue.is_empty() {
        queue.spill_to(dir)?;
    }
    Ok(delivered)
}
