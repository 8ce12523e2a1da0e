// packages/uplink/src/buffering/archiver.rs
//! Frame archiver
//!
//! Packages an ordered batch of captured frames into one tar container and
//! gzips it. The layout is part of the wire contract: the backend opens the
//! payload with a stock tar+gzip reader.
//!
//! ```text
//! [512-byte header: "{epoch}_{seq}_{ts}.jpeg", octal size, checksum]
//! [frame bytes, zero-padded to 512]
//! ...
//! [2 x 512 zero blocks]
//! ```

use crate::buffering::compressor::Compressor;
use crate::buffering::frame_queue::FrameBundle;
use crate::utils::errors::{PipelineError, Result};
use bytes::Bytes;
use tar::{Builder, EntryType, Header};
use tracing::debug;

/// One captured frame
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Encoded JPEG bytes
    pub jpeg: Bytes,

    /// Capture time (milliseconds since epoch)
    pub timestamp_ms: u64,
}

impl CapturedFrame {
    pub fn new(jpeg: impl Into<Bytes>, timestamp_ms: u64) -> Self {
        Self {
            jpeg: jpeg.into(),
            timestamp_ms,
        }
    }
}

/// Deterministic tar+gzip packager
#[derive(Debug, Clone, Copy)]
pub struct FrameArchiver {
    compressor: Compressor,
    sequence: u32,
}

impl FrameArchiver {
    pub fn new(compressor: Compressor) -> Self {
        Self {
            compressor,
            sequence: 1,
        }
    }

    /// Capture sequence stamped into every entry name
    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    /// Entry name for a frame
    pub fn entry_name(&self, session_epoch_ms: u64, timestamp_ms: u64) -> String {
        format!("{}_{}_{}.jpeg", session_epoch_ms, self.sequence, timestamp_ms)
    }

    /// Package `frames` (in order) into a gzip-compressed tar bundle
    pub fn package(&self, frames: &[CapturedFrame], session_epoch_ms: u64) -> Result<FrameBundle> {
        if frames.is_empty() {
            return Err(PipelineError::EmptyBatch);
        }

        let raw_size: usize = frames.iter().map(|f| 512 + f.jpeg.len().div_ceil(512) * 512).sum();
        let mut builder = Builder::new(Vec::with_capacity(raw_size + 1_024));

        for frame in frames {
            let name = self.entry_name(session_epoch_ms, frame.timestamp_ms);

            let mut header = Header::new_gnu();
            header
                .set_path(&name)
                .map_err(|e| PipelineError::ArchiveFailed(format!("Bad entry name {}: {}", name, e)))?;
            header.set_size(frame.jpeg.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(frame.timestamp_ms / 1_000);
            header.set_entry_type(EntryType::Regular);
            header.set_cksum();

            builder
                .append(&header, frame.jpeg.as_ref())
                .map_err(|e| PipelineError::ArchiveFailed(format!("Failed to append {}: {}", name, e)))?;
        }

        let tar_bytes = builder
            .into_inner()
            .map_err(|e| PipelineError::ArchiveFailed(format!("Failed to finish archive: {}", e)))?;

        let payload = self.compressor.compress(&tar_bytes)?;

        let range_start_ms = frames.iter().map(|f| f.timestamp_ms).min().unwrap_or_default();
        let range_end_ms = frames.iter().map(|f| f.timestamp_ms).max().unwrap_or_default();

        debug!(
            "Archived {} frames ({} tar bytes -> {} gzip bytes)",
            frames.len(),
            tar_bytes.len(),
            payload.len()
        );

        Ok(FrameBundle {
            session_epoch_ms,
            range_start_ms,
            range_end_ms,
            frame_count: frames.len() as u32,
            payload: Bytes::from(payload),
        })
    }
}

impl Default for FrameArchiver {
    fn default() -> Self {
        Self::new(Compressor::default())
    }
}
