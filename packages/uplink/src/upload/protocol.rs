// packages/uplink/src/upload/protocol.rs
//! Ingestion wire contract
//!
//! Every upload is three requests: presign (POST, JSON) → PUT of the raw
//! gzip payload to the presigned URL → confirm (POST, JSON). Session-level
//! calls (`/session/end`, `/replay/evaluate`) are single POSTs. All requests
//! carry the project key, upload token and session id headers.

use crate::buffering::frame_queue::FrameBundle;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub const EVENTS_PRESIGN_PATH: &str = "/api/ingest/presign";
pub const SEGMENT_PRESIGN_PATH: &str = "/api/ingest/segment/presign";
pub const BATCH_COMPLETE_PATH: &str = "/api/ingest/batch/complete";
pub const SEGMENT_COMPLETE_PATH: &str = "/api/ingest/segment/complete";
pub const SESSION_END_PATH: &str = "/api/ingest/session/end";
pub const REPLAY_EVALUATE_PATH: &str = "/api/ingest/replay/evaluate";

pub const HEADER_PROJECT_KEY: &str = "x-rejourney-key";
pub const HEADER_UPLOAD_TOKEN: &str = "x-upload-token";
pub const HEADER_SESSION_ID: &str = "x-session-id";

/// Content type of every PUT body
pub const PAYLOAD_CONTENT_TYPE: &str = "application/gzip";

/// What an upload carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// gzip JSON event batch
    Events,

    /// gzip tar of JPEG frames
    Segment,

    /// gzip view-hierarchy snapshot
    Hierarchy,
}

impl ContentKind {
    /// Value sent as `contentType` / `kind` in presign requests
    pub fn wire_kind(&self) -> &'static str {
        match self {
            ContentKind::Events => "events",
            ContentKind::Segment => "screenshots",
            ContentKind::Hierarchy => "hierarchy",
        }
    }

    pub fn presign_path(&self) -> &'static str {
        match self {
            ContentKind::Events => EVENTS_PRESIGN_PATH,
            ContentKind::Segment | ContentKind::Hierarchy => SEGMENT_PRESIGN_PATH,
        }
    }

    pub fn complete_path(&self) -> &'static str {
        match self {
            ContentKind::Events => BATCH_COMPLETE_PATH,
            ContentKind::Segment | ContentKind::Hierarchy => SEGMENT_COMPLETE_PATH,
        }
    }
}

/// One unit of work for the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpload {
    pub id: Ulid,
    pub session_id: String,
    pub content: ContentKind,
    pub payload: Bytes,
    pub range_start_ms: u64,
    pub range_end_ms: u64,

    /// Events in the batch, or frames in the segment
    pub item_count: u32,

    /// Failed attempts so far
    pub attempt: u32,

    /// Per-session batch number (event batches only)
    pub batch_number: u32,
}

impl PendingUpload {
    /// A gzip event batch
    pub fn events(
        session_id: impl Into<String>,
        batch_number: u32,
        payload: impl Into<Bytes>,
        range_start_ms: u64,
        range_end_ms: u64,
        event_count: u32,
    ) -> Self {
        Self {
            id: Ulid::new(),
            session_id: session_id.into(),
            content: ContentKind::Events,
            payload: payload.into(),
            range_start_ms,
            range_end_ms,
            item_count: event_count,
            attempt: 0,
            batch_number,
        }
    }

    /// A packaged frame bundle
    pub fn segment(session_id: impl Into<String>, bundle: &FrameBundle) -> Self {
        Self {
            id: Ulid::new(),
            session_id: session_id.into(),
            content: ContentKind::Segment,
            payload: bundle.payload.clone(),
            range_start_ms: bundle.range_start_ms,
            range_end_ms: bundle.range_end_ms,
            item_count: bundle.frame_count,
            attempt: 0,
            batch_number: 0,
        }
    }

    /// A gzip hierarchy snapshot taken at `timestamp_ms`
    pub fn hierarchy(session_id: impl Into<String>, payload: impl Into<Bytes>, timestamp_ms: u64) -> Self {
        Self {
            id: Ulid::new(),
            session_id: session_id.into(),
            content: ContentKind::Hierarchy,
            payload: payload.into(),
            range_start_ms: timestamp_ms,
            range_end_ms: timestamp_ms,
            item_count: 1,
            attempt: 0,
            batch_number: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Rebuild the frame bundle a segment upload was made from
    pub fn to_bundle(&self, session_epoch_ms: u64) -> Option<FrameBundle> {
        match self.content {
            ContentKind::Segment => Some(FrameBundle {
                session_epoch_ms,
                range_start_ms: self.range_start_ms,
                range_end_ms: self.range_end_ms,
                frame_count: self.item_count,
                payload: self.payload.clone(),
            }),
            ContentKind::Events | ContentKind::Hierarchy => None,
        }
    }

    /// Presign request body for this upload
    pub fn presign_body(&self) -> serde_json::Result<Vec<u8>> {
        match self.content {
            ContentKind::Events => serde_json::to_vec(&EventPresignRequest {
                session_id: &self.session_id,
                size_bytes: self.size() as u64,
                content_type: self.content.wire_kind(),
                batch_number: self.batch_number,
            }),
            ContentKind::Segment | ContentKind::Hierarchy => serde_json::to_vec(&SegmentPresignRequest {
                session_id: &self.session_id,
                size_bytes: self.size() as u64,
                kind: self.content.wire_kind(),
                start_time: self.range_start_ms,
                end_time: self.range_end_ms,
                frame_count: self.item_count,
                compression: "gzip",
            }),
        }
    }

    /// Confirm request body, given the id the presign step handed out
    pub fn complete_body(&self, upload_id: &str) -> serde_json::Result<Vec<u8>> {
        match self.content {
            ContentKind::Events => serde_json::to_vec(&BatchCompleteRequest {
                batch_id: upload_id,
                event_count: self.item_count,
                actual_size_bytes: self.size() as u64,
            }),
            ContentKind::Segment | ContentKind::Hierarchy => serde_json::to_vec(&SegmentCompleteRequest {
                segment_id: upload_id,
                frame_count: self.item_count,
                actual_size_bytes: self.size() as u64,
            }),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPresignRequest<'a> {
    pub session_id: &'a str,
    pub size_bytes: u64,
    pub content_type: &'a str,
    pub batch_number: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentPresignRequest<'a> {
    pub session_id: &'a str,
    pub size_bytes: u64,
    pub kind: &'a str,
    pub start_time: u64,
    pub end_time: u64,
    pub frame_count: u32,
    pub compression: &'a str,
}

/// Presign answer. `skip_upload` means the backend does not want this payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignResponse {
    #[serde(default)]
    pub presigned_url: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub segment_id: Option<String>,
    #[serde(default)]
    pub skip_upload: bool,
}

impl PresignResponse {
    /// The id to confirm with, whichever endpoint issued it
    pub fn upload_id(&self) -> Option<&str> {
        self.batch_id.as_deref().or(self.segment_id.as_deref())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCompleteRequest<'a> {
    pub batch_id: &'a str,
    pub event_count: u32,
    pub actual_size_bytes: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentCompleteRequest<'a> {
    pub segment_id: &'a str,
    pub frame_count: u32,
    pub actual_size_bytes: u64,
}

/// End-of-session summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionMetrics {
    pub crash_count: u32,
    pub anr_count: u32,
    pub error_count: u32,
    pub duration_seconds: u64,
    pub touch_count: u32,
    pub scroll_count: u32,
    pub gesture_count: u32,
    pub background_time_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEndRequest<'a> {
    pub session_id: &'a str,
    pub ended_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<&'a SessionMetrics>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRequest<'a> {
    pub session_id: &'a str,
    pub metrics: &'a SessionMetrics,
}

/// Backend verdict on keeping the replay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionDecision {
    #[serde(default)]
    pub promoted: bool,
    #[serde(default)]
    pub reason: Option<String>,
}
