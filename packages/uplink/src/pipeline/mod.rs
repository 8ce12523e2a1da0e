// packages/uplink/src/pipeline/mod.rs
//! Session pipeline: queues, heartbeat and lifecycle

pub mod coordinator;
pub mod watermark;

pub use coordinator::{
    BufferConfig, Durability, FlushReport, HeartbeatConfig, SuspendReport, SuspensionExtension,
    TelemetryPipeline,
};
pub use watermark::DeliveryLedger;
