// packages/uplink/src/upload/mod.rs
//! Network side of the pipeline
//!
//! [`SegmentDispatcher`] drives the presign/PUT/confirm protocol defined in
//! [`protocol`] over an [`IngestTransport`].

pub mod circuit_breaker;
pub mod dispatcher;
pub mod protocol;
pub mod retry_store;
pub mod transport;

pub use circuit_breaker::CircuitBreaker;
pub use dispatcher::{DeliveryObserver, DispatcherConfig, SegmentDispatcher, ShipReport, UploadOutcome};
pub use protocol::{ContentKind, PendingUpload, RetentionDecision, SessionMetrics};
pub use transport::{HttpRequest, HttpResponse, HyperTransport, IngestTransport};
