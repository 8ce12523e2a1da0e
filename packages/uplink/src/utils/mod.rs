// packages/uplink/src/utils/mod.rs
//! Shared utilities: error types, configuration and time sources.

pub mod clock;
pub mod config;
pub mod errors;
pub mod fs;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PipelineConfig;
pub use errors::{PipelineError, Result};
