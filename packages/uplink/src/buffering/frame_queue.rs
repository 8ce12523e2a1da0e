// packages/uplink/src/buffering/frame_queue.rs
//! Bounded queue of packaged frame bundles
//!
//! Same lossy policy as the event ring: enqueueing into a full queue drops
//! the oldest bundle. Failed uploads go back to the front with
//! [`FrameBundleQueue::requeue`] so they are retried before newer bundles.

use crate::observability::telemetry::{Telemetry, TelemetryEvent};
use crate::utils::errors::{PipelineError, Result};
use crate::utils::fs::{fsync_dir, write_atomic};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default queue capacity (bundles)
pub const DEFAULT_FRAME_QUEUE_CAPACITY: usize = 200;

const SPILL_SUFFIX: &str = ".tar.gz";

/// A gzip tar of frames, ready for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBundle {
    pub session_epoch_ms: u64,
    pub range_start_ms: u64,
    pub range_end_ms: u64,
    pub frame_count: u32,
    pub payload: Bytes,
}

impl FrameBundle {
    /// File name used when the bundle is spilled to disk
    fn spill_name(&self) -> String {
        format!(
            "{}_{}_{}_{}{}",
            self.range_start_ms, self.range_end_ms, self.frame_count, self.session_epoch_ms, SPILL_SUFFIX
        )
    }

    fn parse_spill_name(name: &str) -> Option<(u64, u64, u32, u64)> {
        let stem = name.strip_suffix(SPILL_SUFFIX)?;
        let mut parts = stem.split('_');
        let start = parts.next()?.parse().ok()?;
        let end = parts.next()?.parse().ok()?;
        let count = parts.next()?.parse().ok()?;
        let epoch = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some((start, end, count, epoch))
    }
}

/// Bounded FIFO of frame bundles
pub struct FrameBundleQueue {
    bundles: Mutex<VecDeque<FrameBundle>>,
    capacity: usize,
    telemetry: Option<Arc<Telemetry>>,
}

impl FrameBundleQueue {
    /// Create a queue holding at most `capacity` bundles (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            bundles: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            telemetry: None,
        }
    }

    /// Report evictions to `telemetry`
    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Append a bundle, dropping the oldest if full. Returns the dropped bundle.
    pub fn enqueue(&self, bundle: FrameBundle) -> Option<FrameBundle> {
        let evicted = {
            let mut bundles = self.bundles.lock();
            let evicted = if bundles.len() >= self.capacity {
                bundles.pop_front()
            } else {
                None
            };
            bundles.push_back(bundle);
            evicted
        };

        if let Some(dropped) = &evicted {
            debug!(
                "Frame queue full, dropped bundle {}..{} ({} frames)",
                dropped.range_start_ms, dropped.range_end_ms, dropped.frame_count
            );
            self.record_eviction();
        }

        evicted
    }

    /// Pop the oldest bundle
    pub fn dequeue(&self) -> Option<FrameBundle> {
        self.bundles.lock().pop_front()
    }

    /// Put a bundle back at the front.
    ///
    /// If the queue is full the newest bundle is dropped to make room.
    pub fn requeue(&self, bundle: FrameBundle) -> Option<FrameBundle> {
        let evicted = {
            let mut bundles = self.bundles.lock();
            let evicted = if bundles.len() >= self.capacity {
                bundles.pop_back()
            } else {
                None
            };
            bundles.push_front(bundle);
            evicted
        };

        if evicted.is_some() {
            self.record_eviction();
        }

        evicted
    }

    /// Remove every bundle, oldest first
    pub fn drain_all(&self) -> Vec<FrameBundle> {
        self.bundles.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.bundles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Move every queued bundle to `dir`, one file per bundle.
    ///
    /// Bundles that fail to write stay in memory.
    pub fn spill_to(&self, dir: &Path) -> Result<usize> {
        let bundles = self.drain_all();
        if bundles.is_empty() {
            return Ok(0);
        }

        fs::create_dir_all(dir).map_err(|e| {
            PipelineError::StorageFailed(format!("Failed to create spill directory: {}", e))
        })?;

        let mut spilled = 0;
        let mut first_error = None;
        let mut kept = Vec::new();

        for bundle in bundles {
            let path = dir.join(bundle.spill_name());
            match write_atomic(&path, &bundle.payload) {
                Ok(()) => spilled += 1,
                Err(e) => {
                    warn!("Failed to spill frame bundle to {:?}: {}", path, e);
                    first_error.get_or_insert(e);
                    kept.push(bundle);
                }
            }
        }

        if !kept.is_empty() {
            let mut queue = self.bundles.lock();
            for bundle in kept.into_iter().rev() {
                queue.push_front(bundle);
            }
        }

        info!("Spilled {} frame bundle(s) to {:?}", spilled, dir);

        match first_error {
            Some(e) if spilled == 0 => Err(PipelineError::StorageFailed(format!(
                "Failed to spill frame bundles: {}",
                e
            ))),
            _ => Ok(spilled),
        }
    }

    /// Re-enqueue bundles previously spilled to `dir`, oldest range first,
    /// and delete their files.
    pub fn reload_from(&self, dir: &Path) -> Result<usize> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(PipelineError::StorageFailed(format!(
                    "Failed to read spill directory: {}",
                    e
                )))
            }
        };

        let mut found: Vec<(FrameBundle, PathBuf)> = Vec::new();

        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            let Some((start, end, count, epoch)) = FrameBundle::parse_spill_name(&name) else {
                continue;
            };

            match fs::read(&path) {
                Ok(payload) => found.push((
                    FrameBundle {
                        session_epoch_ms: epoch,
                        range_start_ms: start,
                        range_end_ms: end,
                        frame_count: count,
                        payload: Bytes::from(payload),
                    },
                    path,
                )),
                Err(e) => warn!("Failed to read spilled bundle {:?}: {}", path, e),
            }
        }

        found.sort_by_key(|(bundle, _)| (bundle.range_start_ms, bundle.range_end_ms));

        let count = found.len();
        for (bundle, path) in found {
            self.enqueue(bundle);
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove spilled bundle {:?}: {}", path, e);
            }
        }

        if count > 0 {
            let _ = fsync_dir(dir);
            info!("Reloaded {} spilled frame bundle(s) from {:?}", count, dir);
        }

        Ok(count)
    }

    fn record_eviction(&self) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.record(TelemetryEvent::FrameEviction);
        }
    }
}

impl Default for FrameBundleQueue {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_QUEUE_CAPACITY)
    }
}
