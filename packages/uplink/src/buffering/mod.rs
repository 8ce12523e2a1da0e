// packages/uplink/src/buffering/mod.rs
//! In-memory and on-disk buffering
//!
//! Events are serialized once into [`SerializedEvent`]s, appended to the
//! session's [`EventBuffer`] on disk and pushed onto the [`EventRingBuffer`].
//! Frames are packaged by the [`FrameArchiver`] into [`FrameBundle`]s and
//! held in the [`FrameBundleQueue`] until the dispatcher takes them.

pub mod archiver;
pub mod compressor;
pub mod envelope;
pub mod event_buffer;
pub mod frame_queue;
pub mod ring_buffer;

pub use archiver::{CapturedFrame, FrameArchiver};
pub use compressor::{CompressionLevel, Compressor};
pub use envelope::{encode_event_batch, EventEnvelope, SerializedEvent};
pub use event_buffer::{BufferMeta, EventBuffer};
pub use frame_queue::{FrameBundle, FrameBundleQueue};
pub use ring_buffer::{EventRingBuffer, RingStats};
