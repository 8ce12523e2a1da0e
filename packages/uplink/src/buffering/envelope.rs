// packages/uplink/src/buffering/envelope.rs
//! Event envelopes and their buffered wire form
//!
//! An [`EventEnvelope`] is serialized once, when it enters the pipeline, into
//! a [`SerializedEvent`] holding the JSON object bytes. The ring buffer and the
//! batch encoder only ever see the serialized form.

use crate::utils::errors::{PipelineError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys owned by the envelope itself
const RESERVED_KEYS: [&str; 2] = ["type", "timestamp"];

/// One structured event from a capture collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event kind ("tap", "navigation", "network_request", ...)
    #[serde(rename = "type")]
    pub kind: String,

    /// Capture time (milliseconds since epoch)
    #[serde(rename = "timestamp")]
    pub timestamp_ms: i64,

    /// Kind-specific payload, flattened into the JSON object
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EventEnvelope {
    pub fn new(kind: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            kind: kind.into(),
            timestamp_ms,
            fields: Map::new(),
        }
    }

    /// Attach a field. `type` and `timestamp` are reserved and ignored.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if !RESERVED_KEYS.contains(&key.as_str()) {
            self.fields.insert(key, value.into());
        }
        self
    }

    /// Serialize into the buffered form
    pub fn serialize(&self) -> Result<SerializedEvent> {
        let json = serde_json::to_vec(self).map_err(|e| {
            PipelineError::SerializationFailed(format!("Event '{}' not serializable: {}", self.kind, e))
        })?;

        Ok(SerializedEvent {
            timestamp_ms: self.timestamp_ms,
            json: Bytes::from(json),
            log_position: None,
        })
    }
}

/// A serialized envelope awaiting batching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedEvent {
    pub timestamp_ms: i64,

    /// One JSON object, no trailing newline
    pub json: Bytes,

    /// Line index in the session's event log, if it was persisted
    pub log_position: Option<u64>,
}

impl SerializedEvent {
    pub fn at_log_position(mut self, position: u64) -> Self {
        self.log_position = Some(position);
        self
    }

    /// Byte size counted against batch limits
    pub fn size(&self) -> usize {
        self.json.len()
    }

    /// Parse back into an envelope
    pub fn to_envelope(&self) -> Result<EventEnvelope> {
        Ok(serde_json::from_slice(&self.json)?)
    }
}

/// Encode an event batch as `{"events":[...],"sessionId":..,"batchNumber":..}`
///
/// Events are spliced in as already-serialized bytes, in the given order.
pub fn encode_event_batch(
    session_id: &str,
    batch_number: u32,
    events: &[SerializedEvent],
) -> Result<Vec<u8>> {
    if events.is_empty() {
        return Err(PipelineError::EmptyBatch);
    }

    let payload_size: usize = events.iter().map(|e| e.size() + 1).sum();
    let mut out = Vec::with_capacity(payload_size + session_id.len() + 64);

    out.extend_from_slice(b"{\"events\":[");
    for (i, event) in events.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        out.extend_from_slice(&event.json);
    }
    out.extend_from_slice(b"],\"sessionId\":");
    serde_json::to_writer(&mut out, session_id)?;
    out.extend_from_slice(format!(",\"batchNumber\":{}}}", batch_number).as_bytes());

    Ok(out)
}
