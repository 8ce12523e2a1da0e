// packages/uplink/src/buffering/ring_buffer.rs
//! Bounded, size-aware event ring
//!
//! Holds serialized events awaiting batching. Pushing into a full ring
//! evicts the oldest entry; producers are never blocked and never see an
//! error. All operations run under a single lock so any number of producer
//! threads can push while one consumer drains.

use crate::buffering::envelope::SerializedEvent;
use crate::observability::telemetry::{Telemetry, TelemetryEvent};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{trace, warn};

/// Default ring capacity (events)
pub const DEFAULT_RING_CAPACITY: usize = 5_000;

struct RingState {
    entries: VecDeque<SerializedEvent>,
    buffered_bytes: usize,
    push_count: u64,
    drain_count: u64,
    eviction_count: u64,
    oversized_count: u64,
}

/// Bounded FIFO of serialized events
pub struct EventRingBuffer {
    state: Mutex<RingState>,
    capacity: usize,
    telemetry: Option<Arc<Telemetry>>,
}

impl EventRingBuffer {
    /// Create a ring holding at most `capacity` events (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(RingState {
                entries: VecDeque::with_capacity(capacity.min(1_024)),
                buffered_bytes: 0,
                push_count: 0,
                drain_count: 0,
                eviction_count: 0,
                oversized_count: 0,
            }),
            capacity,
            telemetry: None,
        }
    }

    /// Report evictions and oversized drops to `telemetry`
    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Append an event, evicting the oldest one if the ring is full.
    ///
    /// Returns the evicted event, if any.
    pub fn push(&self, event: SerializedEvent) -> Option<SerializedEvent> {
        let evicted = {
            let mut state = self.state.lock();
            let evicted = if state.entries.len() >= self.capacity {
                let old = state.entries.pop_front();
                if let Some(old) = &old {
                    state.buffered_bytes -= old.size();
                    state.eviction_count += 1;
                }
                old
            } else {
                None
            };

            state.buffered_bytes += event.size();
            state.entries.push_back(event);
            state.push_count += 1;
            evicted
        };

        if evicted.is_some() {
            trace!("Ring buffer full, evicted oldest event");
            self.record(TelemetryEvent::RingEviction, 1);
        }

        evicted
    }

    /// Remove the longest insertion-ordered prefix whose total size is at
    /// most `max_bytes`.
    ///
    /// A head entry larger than `max_bytes` on its own can never be shipped;
    /// it is discarded and counted as an oversized drop.
    pub fn drain(&self, max_bytes: usize) -> Vec<SerializedEvent> {
        let mut drained = Vec::new();
        let mut oversized = 0_u64;

        {
            let mut state = self.state.lock();
            let mut total = 0_usize;

            while let Some(front) = state.entries.front() {
                let size = front.size();

                if size > max_bytes {
                    if drained.is_empty() {
                        if let Some(dropped) = state.entries.pop_front() {
                            state.buffered_bytes -= dropped.size();
                            state.oversized_count += 1;
                            oversized += 1;
                        }
                        continue;
                    }
                    break;
                }

                if total + size > max_bytes {
                    break;
                }

                if let Some(event) = state.entries.pop_front() {
                    total += size;
                    state.buffered_bytes -= size;
                    drained.push(event);
                }
            }

            state.drain_count += drained.len() as u64;
        }

        if oversized > 0 {
            warn!("Dropped {} event(s) larger than the {} byte batch limit", oversized, max_bytes);
            self.record(TelemetryEvent::OversizedDrop, oversized);
        }

        drained
    }

    /// Return a drained batch whose upload could not be started.
    ///
    /// Entries are re-pushed at the tail in their original order and obey
    /// the normal eviction policy.
    pub fn restore(&self, events: Vec<SerializedEvent>) {
        for event in events {
            self.push(event);
        }
    }

    /// Remove everything
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.entries.len();
        state.entries.clear();
        state.buffered_bytes = 0;
        count
    }

    /// Current statistics
    pub fn stats(&self) -> RingStats {
        let state = self.state.lock();
        RingStats {
            push_count: state.push_count,
            drain_count: state.drain_count,
            eviction_count: state.eviction_count,
            oversized_count: state.oversized_count,
            current_size: state.entries.len(),
            buffered_bytes: state.buffered_bytes,
            capacity: self.capacity,
        }
    }

    /// Lowest event log position still buffered
    pub fn oldest_log_position(&self) -> Option<u64> {
        self.state.lock().entries.iter().filter_map(|e| e.log_position).min()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn record(&self, event: TelemetryEvent, count: u64) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_n(event, count);
        }
    }
}

impl Default for EventRingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

/// Ring statistics
#[derive(Debug, Clone)]
pub struct RingStats {
    /// Total events pushed
    pub push_count: u64,

    /// Total events handed out by `drain`
    pub drain_count: u64,

    /// Events evicted because the ring was full
    pub eviction_count: u64,

    /// Events discarded for exceeding the batch byte limit
    pub oversized_count: u64,

    /// Current number of events
    pub current_size: usize,

    /// Sum of buffered event sizes
    pub buffered_bytes: usize,

    /// Ring capacity
    pub capacity: usize,
}

impl RingStats {
    /// Calculate fill percentage
    pub fn fill_percentage(&self) -> f64 {
        (self.current_size as f64 / self.capacity as f64) * 100.0
    }

    /// Percentage of pushed events lost to eviction
    pub fn eviction_rate(&self) -> f64 {
        if self.push_count == 0 {
            0.0
        } else {
            (self.eviction_count as f64 / self.push_count as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;

    fn event(ts: i64, size: usize) -> SerializedEvent {
        SerializedEvent {
            timestamp_ms: ts,
            json: Bytes::from(vec![b'x'; size]),
            log_position: None,
        }
    }

    fn timestamps(events: &[SerializedEvent]) -> Vec<i64> {
        events.iter().map(|e| e.timestamp_ms).collect()
    }

    #[test]
    fn test_ring_creation() {
        let ring = EventRingBuffer::new(100);
        assert_eq!(ring.capacity(), 100);
        assert_eq!(ring.len(), 0);
        assert!(ring.is_empty());
        assert_eq!(EventRingBuffer::default().capacity(), DEFAULT_RING_CAPACITY);
    }

    #[test]
    fn test_push_evicts_oldest() {
        let ring = EventRingBuffer::new(2);
        assert!(ring.push(event(1, 10)).is_none());
        assert!(ring.push(event(2, 10)).is_none());

        let evicted = ring.push(event(3, 10)).unwrap();
        assert_eq!(evicted.timestamp_ms, 1);

        let stats = ring.stats();
        assert_eq!(stats.eviction_count, 1);
        assert_eq!(stats.current_size, 2);
        assert_eq!(stats.buffered_bytes, 20);
        assert_eq!(timestamps(&ring.drain(usize::MAX)), vec![2, 3]);
    }

    #[test]
    fn test_drain_respects_byte_limit() {
        let ring = EventRingBuffer::new(10);
        for ts in 0..5 {
            ring.push(event(ts, 100));
        }

        let first = ring.drain(250);
        assert_eq!(timestamps(&first), vec![0, 1]);

        let rest = ring.drain(1_000);
        assert_eq!(timestamps(&rest), vec![2, 3, 4]);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_drain_stops_at_first_entry_that_does_not_fit() {
        let ring = EventRingBuffer::new(10);
        ring.push(event(1, 50));
        ring.push(event(2, 80));
        ring.push(event(3, 10));

        // 50 + 80 exceeds the limit; the smaller third entry must not jump ahead
        let drained = ring.drain(100);
        assert_eq!(timestamps(&drained), vec![1]);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn test_oversized_head_is_dropped() {
        let telemetry = Arc::new(Telemetry::new());
        let ring = EventRingBuffer::new(10).with_telemetry(Arc::clone(&telemetry));
        ring.push(event(1, 500));
        ring.push(event(2, 10));

        let drained = ring.drain(100);
        assert_eq!(timestamps(&drained), vec![2]);
        assert_eq!(ring.stats().oversized_count, 1);
        assert_eq!(telemetry.snapshot().oversized_drops, 1);
    }

    #[test]
    fn test_restore_requeues_batch() {
        let ring = EventRingBuffer::new(10);
        ring.push(event(1, 10));
        ring.push(event(2, 10));

        let batch = ring.drain(usize::MAX);
        ring.push(event(3, 10));
        ring.restore(batch);

        assert_eq!(timestamps(&ring.drain(usize::MAX)), vec![3, 1, 2]);
    }

    #[test]
    fn test_oldest_log_position() {
        let ring = EventRingBuffer::new(10);
        assert_eq!(ring.oldest_log_position(), None);

        ring.push(event(1, 10));
        ring.push(event(2, 10).at_log_position(7));
        ring.push(event(3, 10).at_log_position(8));
        assert_eq!(ring.oldest_log_position(), Some(7));

        let batch = ring.drain(25);
        assert_eq!(timestamps(&batch), vec![1, 2]);
        assert_eq!(ring.oldest_log_position(), Some(8));

        // a restored batch sits at the tail but still holds the floor
        ring.restore(batch);
        assert_eq!(ring.oldest_log_position(), Some(7));
    }

    #[test]
    fn test_stats() {
        let ring = EventRingBuffer::new(4);
        for ts in 0..6 {
            ring.push(event(ts, 1));
        }
        ring.drain(2);

        let stats = ring.stats();
        assert_eq!(stats.push_count, 6);
        assert_eq!(stats.eviction_count, 2);
        assert_eq!(stats.drain_count, 2);
        assert_eq!(stats.current_size, 2);
        assert!((stats.fill_percentage() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_concurrent_producers() {
        use std::thread;

        let ring = Arc::new(EventRingBuffer::new(500));
        let mut handles = vec![];

        for i in 0..10 {
            let r = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                for j in 0..100 {
                    r.push(event(i * 1_000 + j, 8));
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = ring.stats();
        assert_eq!(stats.push_count, 1_000);
        assert_eq!(stats.current_size, 500);
        assert_eq!(stats.eviction_count, 500);
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_capacity(capacity in 1usize..64, pushes in 0usize..256) {
            let ring = EventRingBuffer::new(capacity);
            for ts in 0..pushes {
                ring.push(event(ts as i64, 4));
                prop_assert!(ring.len() <= capacity);
            }

            let expected: Vec<i64> = (pushes.saturating_sub(capacity)..pushes).map(|t| t as i64).collect();
            prop_assert_eq!(timestamps(&ring.drain(usize::MAX)), expected);
        }

        #[test]
        fn prop_drain_is_bounded_oldest_first(
            sizes in proptest::collection::vec(1usize..64, 0..50),
            max_bytes in 64usize..512,
        ) {
            let ring = EventRingBuffer::new(100);
            for (ts, size) in sizes.iter().enumerate() {
                ring.push(event(ts as i64, *size));
            }

            let drained = ring.drain(max_bytes);
            let total: usize = drained.iter().map(|e| e.size()).sum();
            prop_assert!(total <= max_bytes);

            let expected: Vec<i64> = (0..drained.len()).map(|t| t as i64).collect();
            prop_assert_eq!(timestamps(&drained), expected);

            // maximal: the next entry would not have fit
            if let Some(next) = sizes.get(drained.len()) {
                prop_assert!(total + next > max_bytes);
            }
        }
    }
}
