// packages/uplink/src/observability/telemetry.rs
//! Pipeline health counters
//!
//! Tracks upload outcomes, retries, circuit breaker transitions and
//! backpressure drops. Every event bumps a local atomic (readable through
//! [`Telemetry::snapshot`]) and the matching `metrics` counter.

use std::sync::atomic::{AtomicU64, Ordering};

/// Countable pipeline events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryEvent {
    UploadSuccess,
    UploadFailure,
    UploadSkipped,
    RetryScheduled,
    UploadDropped,
    CircuitOpened,
    CircuitClosed,
    BillingBlocked,
    RingEviction,
    OversizedDrop,
    FrameEviction,
    DeferredDrop,
    DiskWriteFailure,
    SerializationDrop,
}

impl TelemetryEvent {
    fn metric_name(&self) -> &'static str {
        match self {
            TelemetryEvent::UploadSuccess => "uplink_upload_success_total",
            TelemetryEvent::UploadFailure => "uplink_upload_failure_total",
            TelemetryEvent::UploadSkipped => "uplink_upload_skipped_total",
            TelemetryEvent::RetryScheduled => "uplink_retry_scheduled_total",
            TelemetryEvent::UploadDropped => "uplink_upload_dropped_total",
            TelemetryEvent::CircuitOpened => "uplink_circuit_opened_total",
            TelemetryEvent::CircuitClosed => "uplink_circuit_closed_total",
            TelemetryEvent::BillingBlocked => "uplink_billing_blocked_total",
            TelemetryEvent::RingEviction => "uplink_ring_eviction_total",
            TelemetryEvent::OversizedDrop => "uplink_oversized_drop_total",
            TelemetryEvent::FrameEviction => "uplink_frame_eviction_total",
            TelemetryEvent::DeferredDrop => "uplink_deferred_drop_total",
            TelemetryEvent::DiskWriteFailure => "uplink_disk_write_failure_total",
            TelemetryEvent::SerializationDrop => "uplink_serialization_drop_total",
        }
    }
}

/// Shared counter set
#[derive(Debug, Default)]
pub struct Telemetry {
    upload_success: AtomicU64,
    upload_failure: AtomicU64,
    upload_skipped: AtomicU64,
    retry_scheduled: AtomicU64,
    upload_dropped: AtomicU64,
    circuit_opened: AtomicU64,
    circuit_closed: AtomicU64,
    billing_blocked: AtomicU64,
    ring_evictions: AtomicU64,
    oversized_drops: AtomicU64,
    frame_evictions: AtomicU64,
    deferred_drops: AtomicU64,
    disk_write_failures: AtomicU64,
    serialization_drops: AtomicU64,
    bytes_uploaded: AtomicU64,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence of `event`
    pub fn record(&self, event: TelemetryEvent) {
        self.record_n(event, 1);
    }

    /// Record `count` occurrences of `event`
    pub fn record_n(&self, event: TelemetryEvent, count: u64) {
        if count == 0 {
            return;
        }
        self.counter(event).fetch_add(count, Ordering::Relaxed);
        metrics::counter!(event.metric_name()).increment(count);
    }

    /// Record payload bytes that reached object storage
    pub fn record_bytes_uploaded(&self, bytes: u64) {
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
        metrics::counter!("uplink_bytes_uploaded_total").increment(bytes);
    }

    /// Record the current retry queue depth
    pub fn record_queue_depth(&self, depth: usize) {
        metrics::gauge!("uplink_retry_queue_depth").set(depth as f64);
    }

    fn counter(&self, event: TelemetryEvent) -> &AtomicU64 {
        match event {
            TelemetryEvent::UploadSuccess => &self.upload_success,
            TelemetryEvent::UploadFailure => &self.upload_failure,
            TelemetryEvent::UploadSkipped => &self.upload_skipped,
            TelemetryEvent::RetryScheduled => &self.retry_scheduled,
            TelemetryEvent::UploadDropped => &self.upload_dropped,
            TelemetryEvent::CircuitOpened => &self.circuit_opened,
            TelemetryEvent::CircuitClosed => &self.circuit_closed,
            TelemetryEvent::BillingBlocked => &self.billing_blocked,
            TelemetryEvent::RingEviction => &self.ring_evictions,
            TelemetryEvent::OversizedDrop => &self.oversized_drops,
            TelemetryEvent::FrameEviction => &self.frame_evictions,
            TelemetryEvent::DeferredDrop => &self.deferred_drops,
            TelemetryEvent::DiskWriteFailure => &self.disk_write_failures,
            TelemetryEvent::SerializationDrop => &self.serialization_drops,
        }
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        TelemetrySnapshot {
            upload_success: load(&self.upload_success),
            upload_failure: load(&self.upload_failure),
            upload_skipped: load(&self.upload_skipped),
            retry_scheduled: load(&self.retry_scheduled),
            upload_dropped: load(&self.upload_dropped),
            circuit_opened: load(&self.circuit_opened),
            circuit_closed: load(&self.circuit_closed),
            billing_blocked: load(&self.billing_blocked),
            ring_evictions: load(&self.ring_evictions),
            oversized_drops: load(&self.oversized_drops),
            frame_evictions: load(&self.frame_evictions),
            deferred_drops: load(&self.deferred_drops),
            disk_write_failures: load(&self.disk_write_failures),
            serialization_drops: load(&self.serialization_drops),
            bytes_uploaded: load(&self.bytes_uploaded),
        }
    }
}

/// Counter values at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub upload_success: u64,
    pub upload_failure: u64,
    pub upload_skipped: u64,
    pub retry_scheduled: u64,
    pub upload_dropped: u64,
    pub circuit_opened: u64,
    pub circuit_closed: u64,
    pub billing_blocked: u64,
    pub ring_evictions: u64,
    pub oversized_drops: u64,
    pub frame_evictions: u64,
    pub deferred_drops: u64,
    pub disk_write_failures: u64,
    pub serialization_drops: u64,
    pub bytes_uploaded: u64,
}

impl TelemetrySnapshot {
    /// Percentage of attempted uploads that succeeded
    pub fn upload_success_rate(&self) -> f64 {
        let attempts = self.upload_success + self.upload_failure;
        if attempts == 0 {
            100.0
        } else {
            (self.upload_success as f64 / attempts as f64) * 100.0
        }
    }
}
