// packages/uplink/src/lib.rs
//! Replay Uplink Library
//!
//! Durable buffering and upload of session-replay telemetry: a continuous
//! stream of small structured events plus larger batches of captured frames,
//! shipped to an ingestion service over an unreliable network without
//! blocking the capturing thread, without unbounded memory growth and
//! without losing anything that already reached disk.
//!
//! # Architecture
//!
//! The library is structured into several key modules:
//!
//! - **buffering**: event ring, frame bundle queue, tar+gzip archiver and
//!   the append-only on-disk event log
//! - **upload**: presign/PUT/confirm protocol, worker pool, circuit breaker,
//!   retry queue and HTTP transport
//! - **session**: session credentials, recovery checkpoint and orphan recovery
//! - **pipeline**: the coordinator that ties buffering and upload together
//! - **observability**: tracing, metrics and pipeline counters
//! - **utils**: errors, configuration, clock and durable file helpers

// Public module exports
pub mod buffering;
pub mod observability;
pub mod pipeline;
pub mod session;
pub mod upload;
pub mod utils;

// Re-export commonly used types
pub use buffering::{CapturedFrame, EventEnvelope, FrameBundle};
pub use pipeline::{Durability, FlushReport, TelemetryPipeline};
pub use session::SessionContext;
pub use upload::{HyperTransport, IngestTransport, SegmentDispatcher, SessionMetrics};
pub use utils::config::PipelineConfig;
pub use utils::errors::{PipelineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_build_info() {
        let info = BuildInfo::current();
        assert!(!info.version.is_empty());
        assert!(!info.git_hash.is_empty());
    }
}
