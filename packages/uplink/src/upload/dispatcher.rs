// packages/uplink/src/upload/dispatcher.rs
//! Upload dispatcher
//!
//! Runs the presign → PUT → confirm exchange for every [`PendingUpload`] on
//! a small worker pool, and owns everything that decides whether an upload
//! may run at all: the circuit breaker, the sticky billing block and the
//! retry queue.
//!
//! # Architecture
//!
//! ```text
//! SegmentDispatcher
//! ├─ Permits: Semaphore(2)      (concurrent network transfers)
//! ├─ Breaker: 5 failures → open, 60s cooldown
//! ├─ Billing: sticky until configure_session()
//! └─ Retry queue: bounded FIFO  (attempt < 3 → requeue, else drop)
//! ```
//!
//! Rejections (circuit open, billing block, halted) are cheap and never
//! count as failures. Uploads cancelled by [`SegmentDispatcher::halt`] are
//! parked in the retry queue unchanged so they can be persisted.
//!
//! An upload is *settled* once it is delivered or given up on. Settling
//! deletes its persisted copy, if any, and notifies the
//! [`DeliveryObserver`].

use crate::observability::telemetry::{Telemetry, TelemetryEvent};
use crate::session::SessionContext;
use crate::upload::circuit_breaker::CircuitBreaker;
use crate::upload::protocol::{
    EvaluateRequest, PendingUpload, PresignResponse, RetentionDecision, SessionEndRequest,
    SessionMetrics, HEADER_PROJECT_KEY, HEADER_SESSION_ID, HEADER_UPLOAD_TOKEN, PAYLOAD_CONTENT_TYPE,
    REPLAY_EVALUATE_PATH, SESSION_END_PATH,
};
use crate::upload::retry_store;
use crate::upload::transport::{HttpRequest, HttpResponse, IngestTransport};
use crate::utils::clock::Clock;
use crate::utils::errors::{PipelineError, Result};
use hyper::Method;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

/// How long `halt()` waits for cancelled tasks to park their uploads
const HALT_GRACE: Duration = Duration::from_secs(2);

/// Dispatcher tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Concurrent network transfers (default: 2)
    pub max_concurrent_uploads: usize,

    /// Retries before an upload is dropped (default: 3)
    pub max_retries: u32,

    /// Retry queue bound; oldest dropped beyond it (default: 100)
    pub max_retry_queue: usize,

    /// Consecutive failures that open the breaker (default: 5)
    pub circuit_failure_threshold: u32,

    /// Breaker cooldown in milliseconds (default: 60,000)
    pub circuit_cooldown_ms: i64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 2,
            max_retries: 3,
            max_retry_queue: 100,
            circuit_failure_threshold: 5,
            circuit_cooldown_ms: 60_000,
        }
    }
}

/// Result of one completed exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Presigned, stored and confirmed
    Uploaded,

    /// Backend answered `skipUpload`; nothing was sent
    Skipped,
}

/// Told when an upload leaves the dispatcher for good
pub trait DeliveryObserver: Send + Sync {
    /// `delivered` is false when the upload was dropped
    fn upload_settled(&self, upload: &PendingUpload, delivered: bool);
}

/// Summary of a [`SegmentDispatcher::ship_pending`] run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShipReport {
    /// Queued uploads that reached the network in this run. Uploads parked
    /// again by a closed breaker or billing block are not counted.
    pub attempted: usize,

    /// Of those, uploaded or skipped by the backend
    pub delivered: usize,

    /// Retry queue length afterwards
    pub remaining: usize,

    /// In-flight work was still running at the deadline
    pub timed_out: bool,
}

/// Upload worker pool with breaker, billing gate and retry queue
pub struct SegmentDispatcher {
    config: DispatcherConfig,
    transport: Arc<dyn IngestTransport>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<Telemetry>,

    permits: Semaphore,
    tracker: TaskTracker,
    cancel: CancellationToken,
    halted: AtomicBool,

    retry_queue: Mutex<VecDeque<PendingUpload>>,
    in_flight: Mutex<HashSet<Ulid>>,
    store_dir: Mutex<Option<PathBuf>>,
    observer: RwLock<Option<Arc<dyn DeliveryObserver>>>,
    breaker: Mutex<CircuitBreaker>,
    billing_blocked: AtomicBool,

    session: RwLock<Option<SessionContext>>,
    batch_counter: AtomicU32,
    finalize_lock: tokio::sync::Mutex<()>,
    finalized: AtomicBool,
    replay_promoted: AtomicBool,
    last_success_ms: AtomicI64,
}

impl SegmentDispatcher {
    pub fn new(
        config: DispatcherConfig,
        transport: Arc<dyn IngestTransport>,
        clock: Arc<dyn Clock>,
        telemetry: Arc<Telemetry>,
    ) -> Arc<Self> {
        info!(
            "Initializing upload dispatcher ({} workers, {} retries)",
            config.max_concurrent_uploads, config.max_retries
        );

        Arc::new(Self {
            permits: Semaphore::new(config.max_concurrent_uploads.max(1)),
            breaker: Mutex::new(CircuitBreaker::new(
                config.circuit_failure_threshold,
                config.circuit_cooldown_ms,
            )),
            config,
            transport,
            clock,
            telemetry,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            halted: AtomicBool::new(false),
            retry_queue: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(HashSet::new()),
            store_dir: Mutex::new(None),
            observer: RwLock::new(None),
            billing_blocked: AtomicBool::new(false),
            session: RwLock::new(None),
            batch_counter: AtomicU32::new(0),
            finalize_lock: tokio::sync::Mutex::new(()),
            finalized: AtomicBool::new(false),
            replay_promoted: AtomicBool::new(false),
            last_success_ms: AtomicI64::new(0),
        })
    }

    /// Install the session's credentials.
    ///
    /// Clears the billing block and resets per-session state. This is the
    /// only way a billing block is lifted.
    pub fn configure_session(&self, ctx: SessionContext) {
        info!("Dispatcher configured for session {}", ctx.session_id);

        *self.session.write() = Some(ctx);
        if self.billing_blocked.swap(false, Ordering::SeqCst) {
            info!("Billing block cleared by session reconfiguration");
        }
        self.batch_counter.store(0, Ordering::SeqCst);
        self.finalized.store(false, Ordering::SeqCst);
        self.replay_promoted.store(false, Ordering::SeqCst);
    }

    pub fn session(&self) -> Option<SessionContext> {
        self.session.read().clone()
    }

    /// Install the observer told about settled uploads
    pub fn set_observer(&self, observer: Arc<dyn DeliveryObserver>) {
        *self.observer.write() = Some(observer);
    }

    /// Next event batch number for the current session (starts at 1)
    pub fn next_batch_number(&self) -> u32 {
        self.batch_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Whether an upload started now would be allowed to run.
    ///
    /// Closes the breaker if its cooldown has elapsed.
    pub fn can_upload_now(&self) -> bool {
        self.admission().is_ok()
    }

    fn admission(&self) -> Result<()> {
        if self.halted.load(Ordering::SeqCst) {
            return Err(PipelineError::Halted);
        }
        if self.billing_blocked.load(Ordering::SeqCst) {
            return Err(PipelineError::BillingBlocked);
        }

        let (allowed, closed_now) = self.breaker.lock().allow(self.clock.now_ms());
        if closed_now {
            info!("Circuit breaker cooldown elapsed, closing");
            self.telemetry.record(TelemetryEvent::CircuitClosed);
        }
        if !allowed {
            return Err(PipelineError::CircuitOpen);
        }
        Ok(())
    }

    /// Schedule an upload on the worker pool.
    ///
    /// Rejected immediately while halted, billing-blocked or with the
    /// circuit open.
    pub fn submit(self: &Arc<Self>, upload: PendingUpload) -> Result<()> {
        self.admission()?;
        if self.session.read().is_none() {
            return Err(PipelineError::NotConfigured("dispatcher has no session".to_string()));
        }

        debug!(
            "Submitting {:?} upload {} ({} bytes, attempt {})",
            upload.content,
            upload.id,
            upload.size(),
            upload.attempt
        );

        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            this.run_upload(upload, None).await;
        });
        Ok(())
    }

    /// Resubmit everything in the retry queue. Returns how many were submitted.
    pub fn drain_retry_queue(self: &Arc<Self>) -> usize {
        if !self.can_upload_now() {
            return 0;
        }

        let queued: Vec<PendingUpload> = self.retry_queue.lock().drain(..).collect();
        let mut submitted = 0;
        let mut rejected = Vec::new();

        for upload in queued {
            if !rejected.is_empty() {
                rejected.push(upload);
                continue;
            }
            match self.submit(upload.clone()) {
                Ok(()) => submitted += 1,
                Err(e) => {
                    debug!("Retry drain stopped: {}", e);
                    rejected.push(upload);
                }
            }
        }

        if !rejected.is_empty() {
            let mut queue = self.retry_queue.lock();
            for upload in rejected.into_iter().rev() {
                queue.push_front(upload);
            }
        }

        if submitted > 0 {
            debug!("Resubmitted {} uploads from the retry queue", submitted);
        }
        self.telemetry.record_queue_depth(self.retry_queue_len());
        submitted
    }

    /// Attempt every queued retry item once and wait for all in-flight
    /// work, bounded by `timeout`.
    pub async fn ship_pending(self: &Arc<Self>, timeout: Duration) -> ShipReport {
        let queued: Vec<PendingUpload> = self.retry_queue.lock().drain(..).collect();
        let attempted = Arc::new(AtomicUsize::new(0));
        let delivered = Arc::new(AtomicUsize::new(0));

        info!("Shipping {} pending uploads (timeout {:?})", queued.len(), timeout);

        for upload in queued {
            let this = Arc::clone(self);
            let attempted = Arc::clone(&attempted);
            let delivered = Arc::clone(&delivered);
            self.tracker.spawn(async move {
                if this.run_upload(upload, Some(&*attempted)).await {
                    delivered.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        let timed_out = !self.wait_idle(timeout).await;
        if timed_out {
            warn!("Pending uploads still in flight after {:?}", timeout);
        }

        ShipReport {
            attempted: attempted.load(Ordering::SeqCst),
            delivered: delivered.load(Ordering::SeqCst),
            remaining: self.retry_queue_len(),
            timed_out,
        }
    }

    /// Wait until no upload task is running. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let idle = tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok();
        if !self.halted.load(Ordering::SeqCst) {
            self.tracker.reopen();
        }
        idle
    }

    /// One inline attempt with the current session's credentials.
    ///
    /// Updates breaker and billing state but never touches the retry queue.
    pub async fn deliver_now(&self, upload: &PendingUpload) -> Result<UploadOutcome> {
        self.admission()?;
        let ctx = self
            .session()
            .ok_or_else(|| PipelineError::NotConfigured("dispatcher has no session".to_string()))?;

        let outcome = self.transfer_with_permit(&ctx, upload).await;
        self.record_outcome(upload, &outcome, true);
        outcome
    }

    /// One inline attempt with explicit credentials (orphaned sessions).
    ///
    /// A 402 here does not block the current session.
    pub async fn deliver_with(&self, ctx: &SessionContext, upload: &PendingUpload) -> Result<UploadOutcome> {
        if self.halted.load(Ordering::SeqCst) {
            return Err(PipelineError::Halted);
        }

        let outcome = self.transfer_with_permit(ctx, upload).await;
        self.record_outcome(upload, &outcome, false);
        outcome
    }

    /// Cancel queued and in-flight work. Terminal.
    pub async fn halt(&self) {
        if self.halted.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Halting upload dispatcher");
        self.cancel.cancel();
        self.tracker.close();

        if tokio::time::timeout(HALT_GRACE, self.tracker.wait()).await.is_err() {
            warn!("Upload tasks did not stop within {:?}", HALT_GRACE);
        }
        info!(
            "Upload dispatcher halted ({} uploads parked)",
            self.retry_queue_len()
        );
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Signal the end of the current session. One-shot.
    ///
    /// Returns `Ok(false)` if the session was already concluded. A failed
    /// attempt may be retried.
    pub async fn conclude_replay(&self, ended_at_ms: i64, metrics: Option<&SessionMetrics>) -> Result<bool> {
        let _guard = self.finalize_lock.lock().await;

        if self.finalized.load(Ordering::SeqCst) {
            debug!("Session already concluded");
            return Ok(false);
        }
        if self.halted.load(Ordering::SeqCst) {
            return Err(PipelineError::Halted);
        }

        let ctx = self
            .session()
            .ok_or_else(|| PipelineError::NotConfigured("dispatcher has no session".to_string()))?;

        self.conclude_with(&ctx, ended_at_ms, metrics).await?;
        self.finalized.store(true, Ordering::SeqCst);

        info!("Session {} concluded (endedAt {})", ctx.session_id, ended_at_ms);
        Ok(true)
    }

    /// `POST /session/end` for any session, without the one-shot guard
    pub async fn conclude_with(
        &self,
        ctx: &SessionContext,
        ended_at_ms: i64,
        metrics: Option<&SessionMetrics>,
    ) -> Result<()> {
        let body = serde_json::to_vec(&SessionEndRequest {
            session_id: &ctx.session_id,
            ended_at: ended_at_ms,
            metrics,
        })?;

        let _permit = self.acquire_permit().await?;
        let request = signed(ctx, &ctx.session_id, HttpRequest::post_json(ctx.url(SESSION_END_PATH), body));
        let response = self.send_cancellable(request).await?;
        expect_success(&response, SESSION_END_PATH)
    }

    /// Ask the backend whether to keep the replay. Advisory only.
    pub async fn evaluate_replay_retention(&self, metrics: &SessionMetrics) -> Result<RetentionDecision> {
        let ctx = self
            .session()
            .ok_or_else(|| PipelineError::NotConfigured("dispatcher has no session".to_string()))?;

        let body = serde_json::to_vec(&EvaluateRequest {
            session_id: &ctx.session_id,
            metrics,
        })?;

        let _permit = self.acquire_permit().await?;
        let request = signed(&ctx, &ctx.session_id, HttpRequest::post_json(ctx.url(REPLAY_EVALUATE_PATH), body));
        let response = self.send_cancellable(request).await?;
        expect_success(&response, REPLAY_EVALUATE_PATH)?;

        let decision: RetentionDecision = serde_json::from_slice(&response.body)?;
        self.replay_promoted.store(decision.promoted, Ordering::SeqCst);

        info!(
            "Replay retention for session {}: promoted={} reason={}",
            ctx.session_id,
            decision.promoted,
            decision.reason.as_deref().unwrap_or("-")
        );
        Ok(decision)
    }

    pub fn is_replay_promoted(&self) -> bool {
        self.replay_promoted.load(Ordering::SeqCst)
    }

    pub fn is_billing_blocked(&self) -> bool {
        self.billing_blocked.load(Ordering::SeqCst)
    }

    pub fn is_circuit_open(&self) -> bool {
        self.breaker.lock().is_open()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.breaker.lock().consecutive_failures()
    }

    pub fn retry_queue_len(&self) -> usize {
        self.retry_queue.lock().len()
    }

    /// Timestamp of the last confirmed upload (0 if none)
    pub fn last_success_ms(&self) -> i64 {
        self.last_success_ms.load(Ordering::SeqCst)
    }

    /// Move the retry queue to disk. Returns how many were written.
    ///
    /// Files are keyed by upload id, so writing an upload that is already
    /// on disk replaces it. On failure the queue is left untouched.
    pub fn persist_pending(&self, dir: &Path) -> Result<usize> {
        *self.store_dir.lock() = Some(dir.to_path_buf());

        let uploads: Vec<PendingUpload> = self.retry_queue.lock().drain(..).collect();
        match retry_store::persist(dir, &uploads) {
            Ok(count) => {
                self.telemetry.record_queue_depth(0);
                Ok(count)
            }
            Err(e) => {
                error!("Failed to persist retry queue: {}", e);
                self.telemetry.record(TelemetryEvent::DiskWriteFailure);
                let mut queue = self.retry_queue.lock();
                for upload in uploads.into_iter().rev() {
                    queue.push_front(upload);
                }
                Err(e)
            }
        }
    }

    /// Load uploads persisted by [`persist_pending`](Self::persist_pending)
    /// into the retry queue.
    ///
    /// The files stay on disk until each upload settles. Uploads this
    /// dispatcher already holds are skipped. Returns how many were added.
    pub fn restore_pending(&self, dir: &Path) -> Result<usize> {
        *self.store_dir.lock() = Some(dir.to_path_buf());

        let held: HashSet<Ulid> = {
            let queue = self.retry_queue.lock();
            let in_flight = self.in_flight.lock();
            queue.iter().map(|u| u.id).chain(in_flight.iter().copied()).collect()
        };

        let mut count = 0;
        for upload in retry_store::restore(dir)? {
            if held.contains(&upload.id) {
                continue;
            }
            self.enqueue_retry(upload);
            count += 1;
        }
        Ok(count)
    }

    /// Worker body. Returns true if the upload was delivered or skipped.
    ///
    /// `started` is bumped once the upload actually goes on the wire.
    async fn run_upload(&self, upload: PendingUpload, started: Option<&AtomicUsize>) -> bool {
        let id = upload.id;
        self.in_flight.lock().insert(id);
        let delivered = self.attempt_upload(upload, started).await;
        self.in_flight.lock().remove(&id);
        delivered
    }

    async fn attempt_upload(&self, upload: PendingUpload, started: Option<&AtomicUsize>) -> bool {
        let _permit = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.park(upload);
                return false;
            }
            permit = self.permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.park(upload);
                    return false;
                }
            },
        };

        // State may have changed while waiting for a permit
        if let Err(e) = self.admission() {
            debug!("Upload {} deferred: {}", upload.id, e);
            self.park(upload);
            return false;
        }
        let Some(ctx) = self.session() else {
            self.park(upload);
            return false;
        };

        if let Some(started) = started {
            started.fetch_add(1, Ordering::SeqCst);
        }
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!("Upload {} cancelled in flight", upload.id);
                self.park(upload);
                return false;
            }
            outcome = self.transfer(&ctx, &upload) => outcome,
        };

        self.settle(upload, outcome)
    }

    /// Record the outcome of a pooled upload and make the retry decision
    fn settle(&self, mut upload: PendingUpload, outcome: Result<UploadOutcome>) -> bool {
        self.record_outcome(&upload, &outcome, true);

        match outcome {
            Ok(_) => {
                self.retire(&upload, true);
                true
            }
            Err(PipelineError::BillingBlocked) => {
                self.telemetry.record(TelemetryEvent::UploadDropped);
                self.retire(&upload, false);
                false
            }
            Err(_) if upload.attempt < self.config.max_retries => {
                upload.attempt += 1;
                debug!("Scheduling retry {} for upload {}", upload.attempt, upload.id);
                self.telemetry.record(TelemetryEvent::RetryScheduled);
                self.enqueue_retry(upload);
                false
            }
            Err(e) => {
                warn!(
                    "Dropping {:?} upload {} after {} attempts: {}",
                    upload.content,
                    upload.id,
                    upload.attempt + 1,
                    e
                );
                self.telemetry.record(TelemetryEvent::UploadDropped);
                self.retire(&upload, false);
                false
            }
        }
    }

    /// Forget a settled upload: drop its persisted copy and tell the observer
    fn retire(&self, upload: &PendingUpload, delivered: bool) {
        let store_dir = self.store_dir.lock().clone();
        if let Some(dir) = store_dir {
            if let Err(e) = retry_store::remove(&dir, &upload.id) {
                warn!("Failed to delete persisted upload {}: {}", upload.id, e);
            }
        }

        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.upload_settled(upload, delivered);
        }
    }

    /// Breaker, billing and counters for one attempt
    fn record_outcome(&self, upload: &PendingUpload, outcome: &Result<UploadOutcome>, own_session: bool) {
        match outcome {
            Ok(UploadOutcome::Uploaded) => {
                self.breaker.lock().record_success();
                self.last_success_ms.store(self.clock.now_ms(), Ordering::SeqCst);
                self.telemetry.record(TelemetryEvent::UploadSuccess);
                self.telemetry.record_bytes_uploaded(upload.size() as u64);
                debug!("Uploaded {:?} {} ({} bytes)", upload.content, upload.id, upload.size());
            }
            Ok(UploadOutcome::Skipped) => {
                self.telemetry.record(TelemetryEvent::UploadSkipped);
                debug!("Backend skipped {:?} upload {}", upload.content, upload.id);
            }
            Err(PipelineError::BillingBlocked) => {
                if own_session && !self.billing_blocked.swap(true, Ordering::SeqCst) {
                    warn!("Uploads blocked by billing for this session");
                }
                self.telemetry.record(TelemetryEvent::BillingBlocked);
            }
            Err(PipelineError::Halted) => {}
            Err(e) => {
                warn!("Upload {} failed: {}", upload.id, e);
                self.telemetry.record(TelemetryEvent::UploadFailure);
                self.register_failure();
            }
        }
    }

    fn register_failure(&self) {
        let mut breaker = self.breaker.lock();
        if breaker.record_failure(self.clock.now_ms()) {
            warn!(
                "Circuit breaker opened after {} consecutive failures",
                breaker.consecutive_failures()
            );
            self.telemetry.record(TelemetryEvent::CircuitOpened);
        }
    }

    /// Hand an upload to the retry queue without running it
    pub fn requeue(&self, upload: PendingUpload) {
        self.enqueue_retry(upload);
    }

    fn enqueue_retry(&self, upload: PendingUpload) {
        let (depth, dropped) = {
            let mut queue = self.retry_queue.lock();
            let dropped = if queue.len() >= self.config.max_retry_queue.max(1) {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(upload);
            (queue.len(), dropped)
        };

        if let Some(dropped) = dropped {
            warn!("Retry queue full, dropping upload {}", dropped.id);
            self.telemetry.record(TelemetryEvent::UploadDropped);
            self.retire(&dropped, false);
        }
        self.telemetry.record_queue_depth(depth);
    }

    /// Put an upload back without counting an attempt
    fn park(&self, upload: PendingUpload) {
        self.enqueue_retry(upload);
    }

    async fn transfer_with_permit(&self, ctx: &SessionContext, upload: &PendingUpload) -> Result<UploadOutcome> {
        let _permit = self.acquire_permit().await?;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(PipelineError::Halted),
            outcome = self.transfer(ctx, upload) => outcome,
        }
    }

    /// presign → PUT → confirm
    async fn transfer(&self, ctx: &SessionContext, upload: &PendingUpload) -> Result<UploadOutcome> {
        let presign_path = upload.content.presign_path();
        let presign = signed(
            ctx,
            &upload.session_id,
            HttpRequest::post_json(ctx.url(presign_path), upload.presign_body()?),
        );

        let response = self.transport.send(presign).await?;
        if response.status == 402 {
            return Err(PipelineError::BillingBlocked);
        }
        expect_success(&response, presign_path)?;

        let presigned: PresignResponse = serde_json::from_slice(&response.body)?;
        if presigned.skip_upload {
            return Ok(UploadOutcome::Skipped);
        }

        let url = presigned.presigned_url.as_deref().ok_or_else(|| {
            PipelineError::NetworkFailed("presign response missing presignedUrl".to_string())
        })?;
        let upload_id = presigned
            .upload_id()
            .ok_or_else(|| PipelineError::NetworkFailed("presign response missing upload id".to_string()))?
            .to_string();

        let put = HttpRequest::new(Method::PUT, url)
            .with_header("content-type", PAYLOAD_CONTENT_TYPE)
            .with_body(upload.payload.clone());
        let response = self.transport.send(put).await?;
        expect_success(&response, "presigned URL")?;

        let complete_path = upload.content.complete_path();
        let complete = signed(
            ctx,
            &upload.session_id,
            HttpRequest::post_json(ctx.url(complete_path), upload.complete_body(&upload_id)?),
        );
        let response = self.transport.send(complete).await?;
        expect_success(&response, complete_path)?;

        Ok(UploadOutcome::Uploaded)
    }

    async fn acquire_permit(&self) -> Result<SemaphorePermit<'_>> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(PipelineError::Halted),
            permit = self.permits.acquire() => permit.map_err(|_| PipelineError::Halted),
        }
    }

    async fn send_cancellable(&self, request: HttpRequest) -> Result<HttpResponse> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(PipelineError::Halted),
            response = self.transport.send(request) => response,
        }
    }
}

/// Attach the credential headers
fn signed(ctx: &SessionContext, session_id: &str, mut request: HttpRequest) -> HttpRequest {
    if let Some(key) = &ctx.project_key {
        request = request.with_header(HEADER_PROJECT_KEY, key.as_str());
    }
    if let Some(token) = &ctx.upload_token {
        request = request.with_header(HEADER_UPLOAD_TOKEN, token.as_str());
    }
    request.with_header(HEADER_SESSION_ID, session_id)
}

fn expect_success(response: &HttpResponse, endpoint: &str) -> Result<()> {
    if response.is_success() {
        Ok(())
    } else {
        Err(PipelineError::HttpStatus {
            status: response.status,
            endpoint: endpoint.to_string(),
        })
    }
}
