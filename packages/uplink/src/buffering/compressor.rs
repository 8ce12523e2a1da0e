// packages/uplink/src/buffering/compressor.rs
//! gzip compression for upload payloads
//!
//! Event batches, frame archives and hierarchy snapshots all travel as gzip.
//! The gzip header carries no timestamp, so identical input always yields
//! identical output.

use crate::utils::errors::{PipelineError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use tracing::debug;

/// Compression levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionLevel {
    /// Fast compression (level 1)
    Fast,

    /// Balanced (level 6)
    Balanced,

    /// Best compression (level 9)
    Best,
}

impl CompressionLevel {
    pub fn as_u32(&self) -> u32 {
        match self {
            CompressionLevel::Fast => 1,
            CompressionLevel::Balanced => 6,
            CompressionLevel::Best => 9,
        }
    }
}

/// gzip compressor
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    level: CompressionLevel,
}

impl Compressor {
    /// Create a new compressor
    pub fn new(level: CompressionLevel) -> Self {
        Self { level }
    }

    pub fn level(&self) -> CompressionLevel {
        self.level
    }

    /// Compress data
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(
            Vec::with_capacity(data.len() / 4 + 64),
            Compression::new(self.level.as_u32()),
        );

        encoder
            .write_all(data)
            .map_err(|e| PipelineError::CompressionFailed(format!("Compression error: {}", e)))?;
        let compressed = encoder
            .finish()
            .map_err(|e| PipelineError::CompressionFailed(format!("Compression error: {}", e)))?;

        debug!(
            "Compressed {} bytes -> {} bytes at level {}",
            data.len(),
            compressed.len(),
            self.level.as_u32()
        );

        Ok(compressed)
    }

    /// Decompress data
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decompressed = Vec::with_capacity(data.len() * 4);
        GzDecoder::new(data)
            .read_to_end(&mut decompressed)
            .map_err(|e| PipelineError::CompressionFailed(format!("Decompression error: {}", e)))?;

        Ok(decompressed)
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(CompressionLevel::Balanced)
    }
}
