// packages/uplink/src/utils/errors.rs
//! Error types for the upload pipeline
//!
//! Every fallible operation returns [`Result`]; nothing in the pipeline
//! panics or propagates a failure that is fatal to the host process.

use thiserror::Error;

/// Pipeline error
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Disk read/write/sync failure
    #[error("Storage failed: {0}")]
    StorageFailed(String),

    /// A payload could not be encoded or decoded
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// gzip encode/decode failure
    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    /// tar packaging failure
    #[error("Archive failed: {0}")]
    ArchiveFailed(String),

    /// Connection or protocol error talking to the ingestion service
    #[error("Network failed: {0}")]
    NetworkFailed(String),

    /// Non-success HTTP status
    #[error("HTTP {status} from {endpoint}")]
    HttpStatus { status: u16, endpoint: String },

    /// Operation exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The backend reported a usage limit for this session
    #[error("Uploads blocked by billing for this session")]
    BillingBlocked,

    /// Circuit breaker is open
    #[error("Circuit breaker open")]
    CircuitOpen,

    /// The dispatcher or pipeline was halted
    #[error("Pipeline halted")]
    Halted,

    /// The event buffer has been shut down
    #[error("Event buffer closed")]
    BufferClosed,

    /// No session has been configured yet
    #[error("Not configured: {0}")]
    NotConfigured(String),

    /// Nothing to package
    #[error("Empty batch")]
    EmptyBatch,
}

impl PipelineError {
    /// Whether the failure is a local rejection rather than an attempted operation.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            PipelineError::BillingBlocked | PipelineError::CircuitOpen | PipelineError::Halted
        )
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::SerializationFailed(e.to_string())
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, PipelineError>;
