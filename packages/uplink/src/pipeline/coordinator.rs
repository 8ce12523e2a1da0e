// packages/uplink/src/pipeline/coordinator.rs
//! Pipeline coordinator
//!
//! Owns the in-memory queues and wires capture collaborators to the
//! dispatcher. A heartbeat task drains the ring and the frame queue every
//! few seconds; all drain cycles (heartbeat, explicit flush, suspension)
//! are serialized by one async drain lock.
//!
//! # Data flow
//!
//! ```text
//! enqueue_event ─┬─> EventBuffer (disk, append-only)
//!                └─> EventRingBuffer ──┐
//! enqueue_frames ──> FrameArchiver ──> FrameBundleQueue ──┤
//!                                                        v
//!                                   drain cycle ──> SegmentDispatcher
//! ```
//!
//! Each persisted event carries its event log position through the ring.
//! A [`DeliveryLedger`] remembers batches until the dispatcher settles them,
//! and the event log's upload watermark is advanced to the oldest position
//! still owed, so delivered events are never shipped again from disk.
//!
//! Nothing here is global: build one [`TelemetryPipeline`] with
//! [`TelemetryPipeline::new`] and hand the `Arc` to whoever captures data.

use crate::buffering::archiver::{CapturedFrame, FrameArchiver};
use crate::buffering::compressor::Compressor;
use crate::buffering::envelope::{encode_event_batch, EventEnvelope, SerializedEvent};
use crate::buffering::event_buffer::EventBuffer;
use crate::buffering::frame_queue::{FrameBundle, FrameBundleQueue, DEFAULT_FRAME_QUEUE_CAPACITY};
use crate::buffering::ring_buffer::{EventRingBuffer, RingStats, DEFAULT_RING_CAPACITY};
use crate::observability::telemetry::{Telemetry, TelemetryEvent};
use crate::pipeline::watermark::DeliveryLedger;
use crate::session::checkpoint::{CheckpointStore, SessionCheckpoint};
use crate::session::recovery::{self, RecoveryOutcome};
use crate::session::SessionContext;
use crate::upload::dispatcher::{SegmentDispatcher, ShipReport};
use crate::upload::protocol::{PendingUpload, SessionMetrics};
use crate::upload::transport::IngestTransport;
use crate::utils::clock::{Clock, SystemClock};
use crate::utils::config::PipelineConfig;
use crate::utils::errors::{PipelineError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Queue sizes and batch limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Event ring capacity (default: 5,000)
    pub ring_capacity: usize,

    /// Frame bundle queue capacity (default: 200)
    pub frame_queue_capacity: usize,

    /// Upper bound on one event batch before compression (default: 500,000 bytes)
    pub max_batch_bytes: usize,

    /// Uploads held while deferred; oldest dropped beyond it (default: 50)
    pub max_deferred_uploads: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            frame_queue_capacity: DEFAULT_FRAME_QUEUE_CAPACITY,
            max_batch_bytes: 500_000,
            max_deferred_uploads: 50,
        }
    }
}

/// Heartbeat timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Drain interval in milliseconds (default: 5,000)
    pub interval_ms: u64,

    /// Time allowed for uploads when the host is suspending (default: 5,000)
    pub suspend_grace_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            suspend_grace_ms: 5_000,
        }
    }
}

/// Whether an accepted event reached disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Appended to the session's event log
    Persisted,

    /// Held in memory only; lost if the process dies before upload
    MemoryOnly,
}

/// Summary of one drain cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Event batches handed to the dispatcher (or the deferred backlog)
    pub event_batches: usize,

    /// Events in those batches
    pub events: usize,

    /// Frame bundles handed on
    pub segments: usize,

    /// Of the above, held back because uploads are deferred
    pub deferred: usize,

    /// Batches returned to their queue because the dispatcher refused them
    pub rejected: usize,
}

/// Outcome of [`TelemetryPipeline::on_suspend`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuspendReport {
    pub frames_spilled: usize,
    pub event_batches_delivered: usize,
    pub ship: ShipReport,
    pub uploads_persisted: usize,
    pub timed_out: bool,
}

/// Host resource that keeps the process alive while suspending
/// (a background task assertion, a wake lock, ...). Released exactly once.
pub trait SuspensionExtension: Send {
    fn release(self: Box<Self>);
}

impl<F: FnOnce() + Send> SuspensionExtension for F {
    fn release(self: Box<Self>) {
        (*self)()
    }
}

enum Dispatched {
    Submitted,
    Deferred,
}

/// Session-scoped upload pipeline
pub struct TelemetryPipeline {
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    telemetry: Arc<Telemetry>,

    ring: EventRingBuffer,
    frames: FrameBundleQueue,
    events: EventBuffer,
    archiver: FrameArchiver,
    compressor: Compressor,
    dispatcher: Arc<SegmentDispatcher>,
    ledger: Arc<DeliveryLedger>,
    checkpoints: CheckpointStore,

    session: RwLock<Option<SessionContext>>,
    deferred: AtomicBool,
    deferred_backlog: Mutex<VecDeque<PendingUpload>>,
    drain_lock: tokio::sync::Mutex<()>,
    /// Keeps log appends and ring pushes in one order
    enqueue_lock: Mutex<()>,
    heartbeat: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    halted: AtomicBool,
}

impl TelemetryPipeline {
    /// Build a pipeline on the system clock
    pub fn new(config: PipelineConfig, transport: Arc<dyn IngestTransport>) -> Result<Arc<Self>> {
        Self::with_clock(config, transport, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: PipelineConfig,
        transport: Arc<dyn IngestTransport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        info!("Initializing telemetry pipeline at {:?}", config.storage.root_dir);

        let telemetry = Arc::new(Telemetry::new());
        let compressor = Compressor::default();

        let dispatcher = SegmentDispatcher::new(
            config.dispatcher.clone(),
            transport,
            Arc::clone(&clock),
            Arc::clone(&telemetry),
        );
        let ledger = Arc::new(DeliveryLedger::new());
        dispatcher.set_observer(ledger.clone());

        Ok(Arc::new(Self {
            ring: EventRingBuffer::new(config.buffers.ring_capacity).with_telemetry(Arc::clone(&telemetry)),
            frames: FrameBundleQueue::new(config.buffers.frame_queue_capacity)
                .with_telemetry(Arc::clone(&telemetry)),
            events: EventBuffer::new(config.storage.sessions_root(), Arc::clone(&clock)),
            archiver: FrameArchiver::new(compressor),
            checkpoints: CheckpointStore::new(config.storage.checkpoint_path()),
            compressor,
            dispatcher,
            ledger,
            telemetry,
            clock,
            config,
            session: RwLock::new(None),
            deferred: AtomicBool::new(false),
            deferred_backlog: Mutex::new(VecDeque::new()),
            drain_lock: tokio::sync::Mutex::new(()),
            enqueue_lock: Mutex::new(()),
            heartbeat: Mutex::new(None),
            halted: AtomicBool::new(false),
        }))
    }

    /// Start (or switch to) a session.
    ///
    /// Recovers any orphaned previous session first, then configures the
    /// event log, checkpoint and dispatcher, reloads spilled frames and
    /// persisted retries, and starts the heartbeat.
    pub async fn activate(self: &Arc<Self>, ctx: SessionContext) -> Result<()> {
        self.ensure_running()?;
        ctx.validate()?;

        if let Some(previous) = self.session_id() {
            if previous != ctx.session_id {
                info!("Switching from session {} to {}", previous, ctx.session_id);
                if let Err(e) = self.flush_now().await {
                    warn!("Final flush of session {} failed: {}", previous, e);
                }
                self.advance_upload_watermark().await;
            }
        }
        self.stop_heartbeat().await;

        if let Err(e) = self.recover_orphans_excluding(Some(ctx.session_id.as_str())).await {
            warn!("Orphan recovery failed: {}", e);
        }

        let existing = self.events.configure(&ctx.session_id)?;
        if let Err(e) = self.checkpoints.write(&SessionCheckpoint::from_context(&ctx)) {
            warn!("Failed to write session checkpoint: {}", e);
            self.telemetry.record(TelemetryEvent::DiskWriteFailure);
        }

        self.dispatcher.configure_session(ctx.clone());
        let session_id = ctx.session_id.clone();
        *self.session.write() = Some(ctx);

        self.reload_persisted(&session_id);
        self.start_heartbeat();

        info!(
            "Session {} active ({} events already on disk)",
            session_id, existing
        );
        Ok(())
    }

    /// Accept one event. Never blocks on the network.
    pub fn enqueue_event(&self, event: EventEnvelope) -> Result<Durability> {
        self.ensure_running()?;

        let serialized = match event.serialize() {
            Ok(serialized) => serialized,
            Err(e) => {
                error!("Dropping unserializable '{}' event: {}", event.kind, e);
                self.telemetry.record(TelemetryEvent::SerializationDrop);
                return Err(e);
            }
        };

        let _order = self.enqueue_lock.lock();
        let (serialized, durability) = match self.events.append_serialized(std::slice::from_ref(&serialized)) {
            Ok(position) => (serialized.at_log_position(position), Durability::Persisted),
            Err(e) => {
                debug!("Event not persisted: {}", e);
                if matches!(e, PipelineError::StorageFailed(_)) {
                    self.telemetry.record(TelemetryEvent::DiskWriteFailure);
                }
                (serialized, Durability::MemoryOnly)
            }
        };

        self.ring.push(serialized);
        Ok(durability)
    }

    /// Package captured frames and queue the bundle
    pub fn enqueue_frames(&self, frames: &[CapturedFrame]) -> Result<()> {
        self.ensure_running()?;
        let epoch = self.require_session()?.started_at_ms.max(0) as u64;
        let bundle = self.archiver.package(frames, epoch)?;
        self.enqueue_bundle(bundle)
    }

    /// Queue an already packaged bundle
    pub fn enqueue_bundle(&self, bundle: FrameBundle) -> Result<()> {
        self.ensure_running()?;
        if self.frames.enqueue(bundle).is_some() {
            debug!("Frame queue full, oldest bundle evicted");
        }
        Ok(())
    }

    /// Compress a view-hierarchy snapshot and submit it directly
    pub fn submit_hierarchy(&self, snapshot: &[u8], timestamp_ms: u64) -> Result<()> {
        self.ensure_running()?;
        let ctx = self.require_session()?;
        let payload = self.compressor.compress(snapshot)?;
        let upload = PendingUpload::hierarchy(&ctx.session_id, payload, timestamp_ms);
        self.dispatch(upload).map(|_| ())
    }

    /// Drain the ring and the frame queue now
    pub async fn flush_now(&self) -> Result<FlushReport> {
        let _guard = self.drain_lock.lock().await;
        self.drain_cycle()
    }

    /// Hold drained data instead of uploading it
    pub fn set_deferred(&self, deferred: bool) {
        self.deferred.store(deferred, Ordering::SeqCst);
        info!("Upload deferral {}", if deferred { "enabled" } else { "disabled" });
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred.load(Ordering::SeqCst)
    }

    /// Lift deferral and submit everything held back plus everything queued
    pub async fn commit_deferred_data(&self) -> Result<FlushReport> {
        self.set_deferred(false);

        let backlog: Vec<PendingUpload> = self.deferred_backlog.lock().drain(..).collect();
        let count = backlog.len();
        for upload in backlog {
            if let Err(e) = self.dispatcher.submit(upload.clone()) {
                debug!("Deferred upload {} parked for retry: {}", upload.id, e);
                self.dispatcher.requeue(upload);
            }
        }
        if count > 0 {
            info!("Committed {} deferred uploads", count);
        }

        self.flush_now().await
    }

    /// Host is about to suspend.
    ///
    /// Frames go to disk first. Then, within `grace`, pending events are
    /// delivered inline and the retry queue is shipped; whatever is still
    /// queued afterwards is persisted. While uploads are deferred nothing is
    /// sent: events stay in the ring and on disk. `extension` is released
    /// last.
    pub async fn on_suspend(
        &self,
        grace: Duration,
        extension: Option<Box<dyn SuspensionExtension>>,
    ) -> SuspendReport {
        let now = Instant::now();
        let deadline = now.checked_add(grace).unwrap_or(now + Duration::from_secs(86_400));
        let mut report = SuspendReport::default();

        if let Err(e) = self.events.flush() {
            warn!("Event log flush on suspend failed: {}", e);
        }

        if let Some(session_id) = self.session_id() {
            match self.frames.spill_to(&self.config.storage.frames_dir(&session_id)) {
                Ok(spilled) => report.frames_spilled = spilled,
                Err(e) => {
                    warn!("Failed to spill frames on suspend: {}", e);
                    self.telemetry.record(TelemetryEvent::DiskWriteFailure);
                }
            }

            if self.is_deferred() {
                debug!("Uploads deferred, nothing sent on suspend");
            } else {
                let (delivered, timed_out) = self.deliver_ring_inline(deadline).await;
                report.event_batches_delivered = delivered;
                report.timed_out = timed_out;

                let remaining = deadline.saturating_duration_since(Instant::now());
                if !report.timed_out && !remaining.is_zero() {
                    report.ship = self.dispatcher.ship_pending(remaining).await;
                    report.timed_out = report.ship.timed_out;
                }
            }

            match self.dispatcher.persist_pending(&self.config.storage.pending_uploads_dir()) {
                Ok(count) => report.uploads_persisted = count,
                Err(e) => warn!("Failed to persist retry queue on suspend: {}", e),
            }
            self.advance_upload_watermark().await;
        }

        if let Some(extension) = extension {
            extension.release();
        }

        info!(
            "Suspended: {} bundles spilled, {} event batches delivered, {} uploads persisted",
            report.frames_spilled, report.event_batches_delivered, report.uploads_persisted
        );
        report
    }

    /// Host came back to the foreground
    pub fn on_resume(self: &Arc<Self>) -> Result<()> {
        self.ensure_running()?;
        let session_id = self.require_session()?.session_id;

        self.reload_persisted(&session_id);
        self.start_heartbeat();
        info!("Resumed session {}", session_id);
        Ok(())
    }

    /// Finalize a session left behind by a previous process
    pub async fn recover_orphans(&self) -> Result<RecoveryOutcome> {
        let current = self.session_id();
        self.recover_orphans_excluding(current.as_deref()).await
    }

    /// Ship and clear event logs of sessions other than the active one.
    /// Returns how many sessions were cleared.
    pub async fn sweep_orphaned_logs(&self) -> Result<usize> {
        let ctx = self.require_session()?;
        let mut swept = 0;

        for session_id in self.events.list_sessions()? {
            if session_id == ctx.session_id {
                continue;
            }

            let pending: Vec<SerializedEvent> = self
                .events
                .read_undelivered_for(&session_id)?
                .iter()
                .filter_map(|event| event.serialize().ok())
                .collect();

            if let Err(e) = recovery::ship_event_log(&self.dispatcher, &self.compressor, None, &session_id, &pending).await {
                warn!("Could not ship leftover log of session {}: {}", session_id, e);
                continue;
            }

            let frames_dir = self.config.storage.frames_dir(&session_id);
            if let Err(e) = recovery::ship_spilled_frames(&self.dispatcher, None, &session_id, &frames_dir).await {
                warn!("Could not ship spilled frames of session {}: {}", session_id, e);
            }

            self.events.clear_session(&session_id)?;
            swept += 1;
        }

        if swept > 0 {
            info!("Swept {} leftover session logs", swept);
        }
        Ok(swept)
    }

    /// End the active session.
    ///
    /// Flushes, ships pending work within `timeout`, asks for a retention
    /// decision and sends the session-end signal. On success the checkpoint
    /// and the session's event log are deleted. Returns `Ok(false)` if the
    /// session was already ended.
    pub async fn end_session(&self, metrics: Option<SessionMetrics>, timeout: Duration) -> Result<bool> {
        self.ensure_running()?;
        let ctx = self.require_session()?;
        info!("Ending session {}", ctx.session_id);

        self.stop_heartbeat().await;

        if self.is_deferred() {
            self.commit_deferred_data().await?;
        } else if let Err(e) = self.flush_now().await {
            warn!("Final flush failed: {}", e);
        }

        let report = self.dispatcher.ship_pending(timeout).await;
        if report.remaining > 0 {
            warn!("{} uploads still pending at session end", report.remaining);
        }

        if let Some(metrics) = metrics.as_ref() {
            if let Err(e) = self.dispatcher.evaluate_replay_retention(metrics).await {
                warn!("Replay retention evaluation failed: {}", e);
            }
        }

        let ended_at_ms = self.clock.now_ms().max(self.events.last_event_timestamp());
        let concluded = self.dispatcher.conclude_replay(ended_at_ms, metrics.as_ref()).await?;

        if concluded {
            if let Err(e) = self.checkpoints.clear() {
                warn!("Failed to delete checkpoint: {}", e);
            }
            if let Err(e) = self.events.clear_events() {
                warn!("Failed to clear event log: {}", e);
            }
        }
        Ok(concluded)
    }

    /// Stop everything. Queued work is written to disk where possible.
    pub async fn halt(&self) {
        if self.halted.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Halting telemetry pipeline");

        self.stop_heartbeat().await;
        self.dispatcher.halt().await;
        self.advance_upload_watermark().await;

        if let Some(session_id) = self.session_id() {
            if let Err(e) = self.frames.spill_to(&self.config.storage.frames_dir(&session_id)) {
                warn!("Failed to spill frames on halt: {}", e);
            }
        }
        {
            let backlog: Vec<PendingUpload> = self.deferred_backlog.lock().drain(..).collect();
            for upload in backlog {
                self.dispatcher.requeue(upload);
            }
        }
        if let Err(e) = self.dispatcher.persist_pending(&self.config.storage.pending_uploads_dir()) {
            warn!("Failed to persist retry queue on halt: {}", e);
        }
        if let Err(e) = self.events.shutdown() {
            warn!("Event buffer shutdown failed: {}", e);
        }

        info!("Telemetry pipeline halted");
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Configured grace window for [`on_suspend`](Self::on_suspend)
    pub fn suspend_grace(&self) -> Duration {
        Duration::from_millis(self.config.heartbeat.suspend_grace_ms)
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        Arc::clone(&self.telemetry)
    }

    pub fn dispatcher(&self) -> &Arc<SegmentDispatcher> {
        &self.dispatcher
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.read().as_ref().map(|ctx| ctx.session_id.clone())
    }

    pub fn ring_stats(&self) -> RingStats {
        self.ring.stats()
    }

    pub fn frame_queue_len(&self) -> usize {
        self.frames.len()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred_backlog.lock().len()
    }

    /// One drain of the ring and the frame queue. Caller holds the drain lock.
    fn drain_cycle(&self) -> Result<FlushReport> {
        let ctx = self.require_session()?;
        let mut report = FlushReport::default();

        if !self.is_deferred() {
            self.dispatcher.drain_retry_queue();
        }

        loop {
            let batch = self.ring.drain(self.config.buffers.max_batch_bytes);
            if batch.is_empty() {
                break;
            }

            let upload = match self.package_events(&ctx, &batch) {
                Ok(upload) => upload,
                Err(e) => {
                    error!("Dropping event batch of {}: {}", batch.len(), e);
                    self.telemetry.record_n(TelemetryEvent::SerializationDrop, batch.len() as u64);
                    continue;
                }
            };

            let upload_id = upload.id;
            match self.dispatch(upload) {
                Ok(dispatched) => {
                    report.event_batches += 1;
                    report.events += batch.len();
                    if matches!(dispatched, Dispatched::Deferred) {
                        report.deferred += 1;
                    }
                }
                Err(e) => {
                    debug!("Event batch returned to the ring: {}", e);
                    self.ledger.release(&upload_id);
                    self.ring.restore(batch);
                    report.rejected += 1;
                    break;
                }
            }
        }

        while let Some(bundle) = self.frames.dequeue() {
            let upload = PendingUpload::segment(&ctx.session_id, &bundle);
            match self.dispatch(upload) {
                Ok(dispatched) => {
                    report.segments += 1;
                    if matches!(dispatched, Dispatched::Deferred) {
                        report.deferred += 1;
                    }
                }
                Err(e) => {
                    debug!("Frame bundle requeued: {}", e);
                    self.frames.requeue(bundle);
                    report.rejected += 1;
                    break;
                }
            }
        }

        if report.event_batches + report.segments > 0 {
            debug!(
                "Drained {} event batches ({} events) and {} segments",
                report.event_batches, report.events, report.segments
            );
        }
        Ok(report)
    }

    fn package_events(&self, ctx: &SessionContext, batch: &[SerializedEvent]) -> Result<PendingUpload> {
        let batch_number = self.dispatcher.next_batch_number();
        let encoded = encode_event_batch(&ctx.session_id, batch_number, batch)?;
        let payload = self.compressor.compress(&encoded)?;

        let first = batch.first().map(|e| e.timestamp_ms).unwrap_or(0).max(0) as u64;
        let last = batch.last().map(|e| e.timestamp_ms).unwrap_or(0).max(0) as u64;
        let count = u32::try_from(batch.len())
            .map_err(|_| PipelineError::SerializationFailed("event batch too large".to_string()))?;

        let upload = PendingUpload::events(&ctx.session_id, batch_number, payload, first, last, count);
        self.ledger.track(&upload, batch);
        Ok(upload)
    }

    fn dispatch(&self, upload: PendingUpload) -> Result<Dispatched> {
        if self.is_deferred() {
            self.hold_deferred(upload);
            return Ok(Dispatched::Deferred);
        }
        self.dispatcher.submit(upload)?;
        Ok(Dispatched::Submitted)
    }

    fn hold_deferred(&self, upload: PendingUpload) {
        let mut backlog = self.deferred_backlog.lock();
        if backlog.len() >= self.config.buffers.max_deferred_uploads.max(1) {
            if let Some(dropped) = backlog.pop_front() {
                warn!("Deferred backlog full, dropping {:?} upload {}", dropped.content, dropped.id);
                self.telemetry.record(TelemetryEvent::DeferredDrop);
                self.ledger.release(&dropped.id);
            }
        }
        backlog.push_back(upload);
    }

    /// Deliver ring contents with inline attempts until `deadline`.
    ///
    /// Returns batches delivered and whether the deadline cut delivery
    /// short. A batch whose attempt is cut short goes to the retry queue,
    /// so it is persisted with the rest.
    async fn deliver_ring_inline(&self, deadline: Instant) -> (usize, bool) {
        let Ok(_guard) = tokio::time::timeout_at(deadline.into(), self.drain_lock.lock()).await else {
            return (0, true);
        };
        let Some(ctx) = self.session.read().clone() else {
            return (0, false);
        };

        let mut delivered = 0;
        loop {
            if Instant::now() >= deadline {
                return (delivered, !self.ring.is_empty());
            }
            let batch = self.ring.drain(self.config.buffers.max_batch_bytes);
            if batch.is_empty() {
                break;
            }
            let upload = match self.package_events(&ctx, &batch) {
                Ok(upload) => upload,
                Err(e) => {
                    error!("Dropping event batch of {}: {}", batch.len(), e);
                    self.telemetry.record_n(TelemetryEvent::SerializationDrop, batch.len() as u64);
                    continue;
                }
            };

            let attempt = tokio::time::timeout_at(deadline.into(), self.dispatcher.deliver_now(&upload)).await;
            match attempt {
                Ok(Ok(_)) => {
                    self.ledger.release(&upload.id);
                    delivered += 1;
                }
                Ok(Err(e)) => {
                    debug!("Inline delivery failed, keeping events: {}", e);
                    self.ledger.release(&upload.id);
                    self.ring.restore(batch);
                    break;
                }
                Err(_) => {
                    debug!("Inline delivery of {} cut short, queued for retry", upload.id);
                    self.dispatcher.requeue(upload);
                    return (delivered, true);
                }
            }
        }
        (delivered, false)
    }

    /// Move the event log's upload watermark up to the oldest event still
    /// in the ring or in an unsettled batch.
    async fn advance_upload_watermark(&self) {
        let _drain = self.drain_lock.lock().await;
        let Some(session_id) = self.events.session_id() else {
            return;
        };

        let _order = self.enqueue_lock.lock();
        let floor = [self.ring.oldest_log_position(), self.ledger.floor(&session_id)]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or_else(|| self.events.event_count());

        if let Err(e) = self.events.mark_uploaded(floor) {
            warn!("Failed to record delivered events for session {}: {}", session_id, e);
        }
    }

    async fn recover_orphans_excluding(&self, current: Option<&str>) -> Result<RecoveryOutcome> {
        recovery::recover_orphaned_session(
            &self.checkpoints,
            &self.events,
            &self.dispatcher,
            &self.compressor,
            current,
        )
        .await
    }

    fn reload_persisted(&self, session_id: &str) {
        match self.frames.reload_from(&self.config.storage.frames_dir(session_id)) {
            Ok(0) => {}
            Ok(count) => info!("Reloaded {} spilled frame bundles", count),
            Err(e) => warn!("Failed to reload spilled frames: {}", e),
        }
        if let Err(e) = self.dispatcher.restore_pending(&self.config.storage.pending_uploads_dir()) {
            warn!("Failed to restore persisted uploads: {}", e);
        }
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let mut slot = self.heartbeat.lock();
        if slot.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let pipeline: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.heartbeat.interval_ms);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(this) = pipeline.upgrade() else {
                            break;
                        };
                        this.heartbeat_tick().await;
                    }
                }
            }
            debug!("Heartbeat stopped");
        });

        debug!("Heartbeat started ({:?})", period);
        *slot = Some((token, handle));
    }

    async fn stop_heartbeat(&self) {
        let running = self.heartbeat.lock().take();
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Heartbeat task ended abnormally: {}", e);
            }
        }
    }

    async fn heartbeat_tick(&self) {
        match self.flush_now().await {
            Ok(_) => {}
            Err(PipelineError::NotConfigured(_)) => {}
            Err(e) => warn!("Heartbeat drain failed: {}", e),
        }

        if let Err(e) = self.events.flush() {
            debug!("Heartbeat event log flush failed: {}", e);
        }
        self.advance_upload_watermark().await;

        let last_success = self.dispatcher.last_success_ms();
        if last_success > 0 {
            if let Some(session_id) = self.session_id() {
                if let Err(e) = self.checkpoints.touch(&session_id, last_success) {
                    debug!("Checkpoint refresh failed: {}", e);
                }
            }
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.halted.load(Ordering::SeqCst) {
            Err(PipelineError::Halted)
        } else {
            Ok(())
        }
    }

    fn require_session(&self) -> Result<SessionContext> {
        self.session
            .read()
            .clone()
            .ok_or_else(|| PipelineError::NotConfigured("no active session".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::transport::{HttpRequest, HttpResponse};
    use crate::utils::clock::ManualClock;
    use crate::utils::config::StorageConfig;
    use bytes::Bytes;
    use futures::future::BoxFuture;
    use hyper::Method;
    use std::io::Read;
    use tempfile::{tempdir, TempDir};

    /// Always-successful backend that keeps every request it answers
    #[derive(Default)]
    struct FakeBackend {
        requests: Mutex<Vec<HttpRequest>>,
        reject_presign: AtomicBool,
        delay: Duration,
    }

    impl FakeBackend {
        fn puts(&self) -> Vec<HttpRequest> {
            self.requests
                .lock()
                .iter()
                .filter(|r| r.method == Method::PUT)
                .cloned()
                .collect()
        }
    }

    impl IngestTransport for FakeBackend {
        fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
            Box::pin(async move {
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                let presign = request.url.ends_with("/presign");
                self.requests.lock().push(request);
                if presign && self.reject_presign.load(Ordering::SeqCst) {
                    return Ok(HttpResponse {
                        status: 503,
                        body: Bytes::new(),
                    });
                }
                let body: &'static str = if presign {
                    r#"{"presignedUrl":"http://storage.local/put","batchId":"b","segmentId":"s"}"#
                } else {
                    "{}"
                };
                Ok(HttpResponse {
                    status: 200,
                    body: Bytes::from_static(body.as_bytes()),
                })
            })
        }
    }

    fn config(root: &TempDir) -> PipelineConfig {
        PipelineConfig {
            storage: StorageConfig {
                root_dir: root.path().to_path_buf(),
            },
            heartbeat: HeartbeatConfig {
                interval_ms: 3_600_000,
                suspend_grace_ms: 1_000,
            },
            ..Default::default()
        }
    }

    fn pipeline(root: &TempDir, backend: Arc<FakeBackend>) -> Arc<TelemetryPipeline> {
        TelemetryPipeline::with_clock(config(root), backend, Arc::new(ManualClock::new(1_700_000_000_000)))
            .unwrap()
    }

    fn context(id: &str) -> SessionContext {
        SessionContext::new(id, "http://ingest.local", 1_700_000_000_000).with_project_key("pk")
    }

    fn gunzip(bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(bytes).read_to_end(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_event_flush_uploads_batch() {
        let root = tempdir().unwrap();
        let backend = Arc::new(FakeBackend::default());
        let p = pipeline(&root, Arc::clone(&backend));
        p.activate(context("s1")).await.unwrap();

        for i in 0..3 {
            let durability = p
                .enqueue_event(EventEnvelope::new("tap", 1_700_000_000_000 + i).with_field("i", i))
                .unwrap();
            assert_eq!(durability, Durability::Persisted);
        }

        let report = p.flush_now().await.unwrap();
        assert_eq!(report.event_batches, 1);
        assert_eq!(report.events, 3);
        assert!(p.dispatcher().wait_idle(Duration::from_secs(5)).await);

        let puts = backend.puts();
        assert_eq!(puts.len(), 1);
        let batch: serde_json::Value = serde_json::from_slice(&gunzip(&puts[0].body)).unwrap();
        assert_eq!(batch["sessionId"], "s1");
        assert_eq!(batch["batchNumber"], 1);
        assert_eq!(batch["events"].as_array().unwrap().len(), 3);
        assert_eq!(batch["events"][2]["i"], 2);

        p.halt().await;
    }

    #[tokio::test]
    async fn test_batches_respect_byte_limit() {
        let root = tempdir().unwrap();
        let backend = Arc::new(FakeBackend::default());
        let mut cfg = config(&root);
        cfg.buffers.max_batch_bytes = 200;
        let p = TelemetryPipeline::with_clock(cfg, backend, Arc::new(ManualClock::new(0))).unwrap();
        p.activate(context("s1")).await.unwrap();

        for i in 0..10 {
            p.enqueue_event(EventEnvelope::new("tap", i).with_field("pad", "x".repeat(40)))
                .unwrap();
        }

        let report = p.flush_now().await.unwrap();
        assert!(report.event_batches > 1);
        assert_eq!(report.events, 10);
        assert!(p.ring_stats().current_size == 0);
        p.halt().await;
    }

    #[tokio::test]
    async fn test_frames_flow_as_segments() {
        let root = tempdir().unwrap();
        let backend = Arc::new(FakeBackend::default());
        let p = pipeline(&root, Arc::clone(&backend));
        p.activate(context("s1")).await.unwrap();

        p.enqueue_frames(&[
            CapturedFrame::new(vec![0xFFu8, 0xD8], 1_700_000_000_100),
            CapturedFrame::new(vec![0xFFu8, 0xD9], 1_700_000_000_200),
        ])
        .unwrap();
        assert_eq!(p.frame_queue_len(), 1);

        let report = p.flush_now().await.unwrap();
        assert_eq!(report.segments, 1);
        assert!(p.dispatcher().wait_idle(Duration::from_secs(5)).await);

        let presign = backend
            .requests
            .lock()
            .iter()
            .find(|r| r.url.ends_with("/segment/presign"))
            .cloned()
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&presign.body).unwrap();
        assert_eq!(body["kind"], "screenshots");
        assert_eq!(body["frameCount"], 2);
        assert_eq!(body["startTime"], 1_700_000_000_100u64);
        p.halt().await;
    }

    #[tokio::test]
    async fn test_deferred_mode_holds_uploads() {
        let root = tempdir().unwrap();
        let backend = Arc::new(FakeBackend::default());
        let p = pipeline(&root, Arc::clone(&backend));
        p.activate(context("s1")).await.unwrap();
        p.set_deferred(true);

        p.enqueue_event(EventEnvelope::new("tap", 1)).unwrap();
        let report = p.flush_now().await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(p.deferred_len(), 1);
        assert!(p.dispatcher().wait_idle(Duration::from_secs(5)).await);
        assert!(backend.puts().is_empty());

        p.commit_deferred_data().await.unwrap();
        assert!(p.dispatcher().wait_idle(Duration::from_secs(5)).await);
        assert_eq!(backend.puts().len(), 1);
        assert_eq!(p.deferred_len(), 0);
        p.halt().await;
    }

    #[tokio::test]
    async fn test_deferred_backlog_is_bounded() {
        let root = tempdir().unwrap();
        let backend = Arc::new(FakeBackend::default());
        let mut cfg = config(&root);
        cfg.buffers.max_deferred_uploads = 2;
        let p = TelemetryPipeline::with_clock(cfg, backend, Arc::new(ManualClock::new(0))).unwrap();
        p.activate(context("s1")).await.unwrap();
        p.set_deferred(true);

        for ts in 0..3 {
            p.submit_hierarchy(b"{\"root\":{}}", ts).unwrap();
        }

        assert_eq!(p.deferred_len(), 2);
        assert_eq!(p.telemetry().snapshot().deferred_drops, 1);
        p.halt().await;
    }

    #[tokio::test]
    async fn test_rejected_batch_returns_to_ring() {
        let root = tempdir().unwrap();
        let backend = Arc::new(FakeBackend::default());
        backend.reject_presign.store(true, Ordering::SeqCst);
        let p = pipeline(&root, Arc::clone(&backend));
        p.activate(context("s1")).await.unwrap();

        // failures (including resubmitted retries) eventually open the breaker
        for i in 0..10 {
            if p.dispatcher().is_circuit_open() {
                break;
            }
            p.enqueue_event(EventEnvelope::new("tap", i)).unwrap();
            p.flush_now().await.unwrap();
            assert!(p.dispatcher().wait_idle(Duration::from_secs(5)).await);
        }
        assert!(p.dispatcher().is_circuit_open());
        assert_eq!(p.ring_stats().current_size, 0);

        p.enqueue_event(EventEnvelope::new("tap", 99)).unwrap();
        let report = p.flush_now().await.unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(p.ring_stats().current_size, 1);
        p.halt().await;
    }

    #[tokio::test]
    async fn test_end_session_concludes_and_cleans_up() {
        let root = tempdir().unwrap();
        let backend = Arc::new(FakeBackend::default());
        let p = pipeline(&root, Arc::clone(&backend));
        p.activate(context("s1")).await.unwrap();
        p.enqueue_event(EventEnvelope::new("tap", 1_700_000_000_500)).unwrap();

        let checkpoint_path = root.path().join("session_checkpoint.json");
        assert!(checkpoint_path.exists());

        let concluded = p
            .end_session(Some(SessionMetrics::default()), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(concluded);
        assert!(!checkpoint_path.exists());
        assert!(p.events.read_pending_events().unwrap().is_empty());

        let urls: Vec<String> = backend.requests.lock().iter().map(|r| r.url.clone()).collect();
        assert!(urls.iter().any(|u| u.ends_with("/api/ingest/replay/evaluate")));
        assert!(urls.iter().any(|u| u.ends_with("/api/ingest/session/end")));

        assert!(!p.end_session(None, Duration::from_secs(1)).await.unwrap());
        p.halt().await;
    }

    #[tokio::test]
    async fn test_activate_recovers_orphaned_session() {
        let root = tempdir().unwrap();
        let backend = Arc::new(FakeBackend::default());

        {
            let crashed = pipeline(&root, Arc::new(FakeBackend::default()));
            crashed.activate(context("old")).await.unwrap();
            crashed.enqueue_event(EventEnvelope::new("tap", 1_700_000_000_900)).unwrap();
            crashed.events.flush().unwrap();
            crashed.stop_heartbeat().await;
            // process dies here: no end_session, no halt
        }

        let p = pipeline(&root, Arc::clone(&backend));
        p.activate(context("new")).await.unwrap();

        let requests = backend.requests.lock().clone();
        let end = requests
            .iter()
            .find(|r| r.url.ends_with("/api/ingest/session/end"))
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&end.body).unwrap();
        assert_eq!(body["sessionId"], "old");
        assert_eq!(body["endedAt"], 1_700_000_000_900i64);

        let checkpoint: serde_json::Value =
            serde_json::from_slice(&std::fs::read(root.path().join("session_checkpoint.json")).unwrap()).unwrap();
        assert_eq!(checkpoint["sessionId"], "new");
        p.halt().await;
    }

    #[tokio::test]
    async fn test_suspend_spills_and_resume_reloads() {
        let root = tempdir().unwrap();
        let backend = Arc::new(FakeBackend::default());
        backend.reject_presign.store(true, Ordering::SeqCst);
        let p = pipeline(&root, Arc::clone(&backend));
        p.activate(context("s1")).await.unwrap();

        p.enqueue_frames(&[CapturedFrame::new(vec![1u8, 2, 3], 1_700_000_000_100)])
            .unwrap();

        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let extension: Box<dyn SuspensionExtension> = Box::new(move || flag.store(true, Ordering::SeqCst));
        let report = p.on_suspend(p.suspend_grace(), Some(extension)).await;

        assert_eq!(report.frames_spilled, 1);
        assert_eq!(p.frame_queue_len(), 0);
        assert!(released.load(Ordering::SeqCst));

        p.on_resume().unwrap();
        assert_eq!(p.frame_queue_len(), 1);
        p.halt().await;
    }

    #[tokio::test]
    async fn test_suspend_while_deferred_sends_nothing() {
        let root = tempdir().unwrap();
        let backend = Arc::new(FakeBackend::default());
        let p = pipeline(&root, Arc::clone(&backend));
        p.activate(context("s1")).await.unwrap();
        p.set_deferred(true);

        p.enqueue_event(EventEnvelope::new("tap", 1_700_000_000_001)).unwrap();
        let report = p.on_suspend(Duration::from_secs(2), None).await;

        assert_eq!(report.event_batches_delivered, 0);
        assert_eq!(report.ship, ShipReport::default());
        assert!(backend.requests.lock().is_empty());
        assert_eq!(p.ring_stats().current_size, 1);

        p.commit_deferred_data().await.unwrap();
        assert!(p.dispatcher().wait_idle(Duration::from_secs(5)).await);
        assert_eq!(backend.puts().len(), 1);
        p.halt().await;
    }

    #[tokio::test]
    async fn test_suspend_deadline_keeps_batch_for_retry() {
        let root = tempdir().unwrap();
        let backend = Arc::new(FakeBackend {
            delay: Duration::from_millis(500),
            ..Default::default()
        });
        let p = pipeline(&root, Arc::clone(&backend));
        p.activate(context("s1")).await.unwrap();

        for i in 0..3 {
            p.enqueue_event(EventEnvelope::new("tap", 1_700_000_000_000 + i)).unwrap();
        }
        let report = p.on_suspend(Duration::from_millis(100), None).await;

        assert!(report.timed_out);
        assert_eq!(report.event_batches_delivered, 0);
        assert_eq!(report.uploads_persisted, 1);
        assert!(backend.puts().is_empty());
        assert_eq!(p.events.read_pending_events().unwrap().len(), 3);

        p.on_resume().unwrap();
        assert_eq!(p.dispatcher().retry_queue_len(), 1);
        p.halt().await;
    }

    #[tokio::test]
    async fn test_switch_after_confirmed_flush_does_not_reship() {
        let root = tempdir().unwrap();
        let backend = Arc::new(FakeBackend::default());
        let p = pipeline(&root, Arc::clone(&backend));
        p.activate(context("s1")).await.unwrap();

        for i in 0..3 {
            p.enqueue_event(EventEnvelope::new("tap", 1_700_000_000_000 + i)).unwrap();
        }
        p.flush_now().await.unwrap();
        assert!(p.dispatcher().wait_idle(Duration::from_secs(5)).await);
        assert_eq!(backend.puts().len(), 1);

        p.activate(context("s2")).await.unwrap();

        let puts = backend.puts();
        assert_eq!(puts.len(), 1);
        let batch: serde_json::Value = serde_json::from_slice(&gunzip(&puts[0].body)).unwrap();
        assert_eq!(batch["batchNumber"], 1);
        assert!(p.events.read_events_for("s1").unwrap().is_empty());

        let ends = backend
            .requests
            .lock()
            .iter()
            .filter(|r| r.url.ends_with("/api/ingest/session/end"))
            .count();
        assert_eq!(ends, 1);
        p.halt().await;
    }

    #[tokio::test]
    async fn test_watermark_waits_for_unsettled_batches() {
        let root = tempdir().unwrap();
        let backend = Arc::new(FakeBackend::default());
        backend.reject_presign.store(true, Ordering::SeqCst);
        let p = pipeline(&root, Arc::clone(&backend));
        p.activate(context("s1")).await.unwrap();

        for i in 0..3 {
            p.enqueue_event(EventEnvelope::new("tap", 1_700_000_000_000 + i)).unwrap();
        }
        p.flush_now().await.unwrap();
        assert!(p.dispatcher().wait_idle(Duration::from_secs(5)).await);
        assert_eq!(p.dispatcher().retry_queue_len(), 1);

        p.advance_upload_watermark().await;
        assert_eq!(p.events.uploaded_count(), 0);
        assert_eq!(p.events.read_pending_events().unwrap().len(), 3);

        // the retry goes through on the next drain
        backend.reject_presign.store(false, Ordering::SeqCst);
        p.enqueue_event(EventEnvelope::new("tap", 1_700_000_000_010)).unwrap();
        p.flush_now().await.unwrap();
        assert!(p.dispatcher().wait_idle(Duration::from_secs(5)).await);
        assert_eq!(backend.puts().len(), 2);

        p.advance_upload_watermark().await;
        assert!(p.events.read_pending_events().unwrap().is_empty());
        assert_eq!(p.events.event_count(), 0);
        p.halt().await;
    }

    #[tokio::test]
    async fn test_activate_rejects_unsafe_session_id() {
        let root = tempdir().unwrap();
        let p = pipeline(&root, Arc::new(FakeBackend::default()));

        assert!(matches!(
            p.activate(context("../evil")).await,
            Err(PipelineError::ConfigError(_))
        ));
        assert!(p.session_id().is_none());
        assert!(!root.path().join("evil").exists());
        assert!(!root.path().join("session_checkpoint.json").exists());
    }

    #[tokio::test]
    async fn test_sweep_orphaned_logs() {
        let root = tempdir().unwrap();
        let backend = Arc::new(FakeBackend::default());
        {
            // a log with no checkpoint pointing at it
            let stale = EventBuffer::new(root.path().join("sessions"), Arc::new(ManualClock::new(0)));
            stale.configure("leftover").unwrap();
            stale.append_event(&EventEnvelope::new("tap", 5)).unwrap();
            stale.flush().unwrap();
        }

        let p = pipeline(&root, Arc::clone(&backend));
        p.activate(context("current")).await.unwrap();
        assert_eq!(p.events.read_events_for("leftover").unwrap().len(), 1);

        assert_eq!(p.sweep_orphaned_logs().await.unwrap(), 1);
        assert!(p.events.read_events_for("leftover").unwrap().is_empty());
        assert_eq!(backend.puts().len(), 1);
        assert!(p.events.list_sessions().unwrap().contains(&"current".to_string()));
        p.halt().await;
    }

    #[tokio::test]
    async fn test_halt_rejects_new_work() {
        let root = tempdir().unwrap();
        let p = pipeline(&root, Arc::new(FakeBackend::default()));
        p.activate(context("s1")).await.unwrap();
        p.halt().await;

        assert!(p.is_halted());
        assert!(matches!(
            p.enqueue_event(EventEnvelope::new("tap", 1)),
            Err(PipelineError::Halted)
        ));
        assert!(matches!(
            p.activate(context("s2")).await,
            Err(PipelineError::Halted)
        ));
    }

    #[tokio::test]
    async fn test_enqueue_without_session_is_memory_only() {
        let root = tempdir().unwrap();
        let p = pipeline(&root, Arc::new(FakeBackend::default()));

        assert_eq!(
            p.enqueue_event(EventEnvelope::new("tap", 1)).unwrap(),
            Durability::MemoryOnly
        );
        assert_eq!(p.ring_stats().current_size, 1);
    }
}
