// packages/uplink/src/pipeline/watermark.rs
//! Which logged events are still owed to the backend
//!
//! Every event batch built from the ring is tracked with the lowest event
//! log position it carries until the dispatcher settles it. Together with
//! the ring's own oldest position this bounds how far the event log's
//! upload watermark may advance: nothing below the floor is still waiting.

use crate::buffering::envelope::SerializedEvent;
use crate::upload::dispatcher::DeliveryObserver;
use crate::upload::protocol::PendingUpload;
use parking_lot::Mutex;
use std::collections::HashMap;
use ulid::Ulid;

struct OpenBatch {
    session_id: String,
    first_position: u64,
}

/// Event batches handed on but not yet settled
#[derive(Default)]
pub struct DeliveryLedger {
    open: Mutex<HashMap<Ulid, OpenBatch>>,
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `upload`, built from `batch`. Batches with no
    /// persisted event are not tracked; returns whether this one was.
    pub fn track(&self, upload: &PendingUpload, batch: &[SerializedEvent]) -> bool {
        let Some(first_position) = batch.iter().filter_map(|e| e.log_position).min() else {
            return false;
        };
        self.open.lock().insert(
            upload.id,
            OpenBatch {
                session_id: upload.session_id.clone(),
                first_position,
            },
        );
        true
    }

    /// Stop tracking an upload that was delivered, dropped, or whose events
    /// went back to the ring
    pub fn release(&self, id: &Ulid) {
        self.open.lock().remove(id);
    }

    /// Lowest log position of `session_id` still in an open batch
    pub fn floor(&self, session_id: &str) -> Option<u64> {
        self.open
            .lock()
            .values()
            .filter(|batch| batch.session_id == session_id)
            .map(|batch| batch.first_position)
            .min()
    }

    pub fn len(&self) -> usize {
        self.open.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.lock().is_empty()
    }
}

impl DeliveryObserver for DeliveryLedger {
    fn upload_settled(&self, upload: &PendingUpload, _delivered: bool) {
        self.release(&upload.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::envelope::EventEnvelope;

    fn logged(position: Option<u64>) -> SerializedEvent {
        let event = EventEnvelope::new("tap", 1).serialize().unwrap();
        match position {
            Some(position) => event.at_log_position(position),
            None => event,
        }
    }

    fn upload(session_id: &str) -> PendingUpload {
        PendingUpload::events(session_id, 1, vec![0u8; 4], 0, 0, 1)
    }

    #[test]
    fn test_floor_is_lowest_open_position_per_session() {
        let ledger = DeliveryLedger::new();
        let first = upload("s1");
        let second = upload("s1");
        let other = upload("s2");

        assert!(ledger.track(&first, &[logged(Some(4)), logged(Some(5))]));
        assert!(ledger.track(&second, &[logged(None), logged(Some(9))]));
        assert!(ledger.track(&other, &[logged(Some(0))]));
        assert_eq!(ledger.floor("s1"), Some(4));

        ledger.release(&first.id);
        assert_eq!(ledger.floor("s1"), Some(9));
        assert_eq!(ledger.floor("s2"), Some(0));

        ledger.upload_settled(&second, true);
        assert_eq!(ledger.floor("s1"), None);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_memory_only_batches_are_not_tracked() {
        let ledger = DeliveryLedger::new();
        assert!(!ledger.track(&upload("s1"), &[logged(None), logged(None)]));
        assert!(ledger.is_empty());
    }
}
