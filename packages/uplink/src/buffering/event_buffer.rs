// packages/uplink/src/buffering/event_buffer.rs
//! Crash-safe, append-only event log
//!
//! Every event entering the pipeline is also appended to
//! `{sessions_root}/{session_id}/events.jsonl` (one JSON object per line) so
//! that a hard crash loses at most what the OS had not yet written. The
//! log is never rewritten in place; it only grows until an explicit clear.
//!
//! `flush()` syncs the log and writes a small `buffer_meta.json` sidecar
//! (`eventCount`, `uploadedCount`, `lastEventTimestamp`, `savedAt`) that
//! answers "how much is pending" without re-reading the log.
//!
//! # Upload watermark
//!
//! `uploadedCount` is how many events at the head of the log are known to
//! be delivered. [`EventBuffer::mark_uploaded`] advances it; readers of
//! pending events skip that prefix. Once every event on disk is delivered
//! the log is emptied, so a long session does not grow it without bound.
//!
//! # Recovery
//!
//! `configure()` on an existing log counts the well-formed lines it holds.
//! A torn final line left by a crash mid-write is cut off first so new
//! appends start on a clean line boundary.

use crate::buffering::envelope::{EventEnvelope, SerializedEvent};
use crate::session::validate_session_id;
use crate::utils::clock::Clock;
use crate::utils::errors::{PipelineError, Result};
use crate::utils::fs::write_atomic;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Event log file name
pub const EVENTS_FILE: &str = "events.jsonl";

/// Sidecar file name
pub const META_FILE: &str = "buffer_meta.json";

/// Sidecar contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferMeta {
    pub event_count: u64,

    /// Leading events already delivered
    #[serde(default)]
    pub uploaded_count: u64,

    pub last_event_timestamp: i64,
    pub saved_at: i64,
}

struct ActiveLog {
    session_id: String,
    dir: PathBuf,
    file: File,
    event_count: u64,
    uploaded_count: u64,
    last_event_timestamp: i64,
}

/// Per-session append-only event log
pub struct EventBuffer {
    sessions_root: PathBuf,
    active: Mutex<Option<ActiveLog>>,
    closed: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl EventBuffer {
    /// Create a buffer rooted at `sessions_root`. Call [`configure`](Self::configure)
    /// before appending.
    pub fn new(sessions_root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions_root: sessions_root.into(),
            active: Mutex::new(None),
            closed: AtomicBool::new(false),
            clock,
        }
    }

    /// Switch to `session_id`, closing any previous log.
    ///
    /// Returns the number of events already on disk for that session.
    pub fn configure(&self, session_id: &str) -> Result<u64> {
        validate_session_id(session_id)?;
        let mut active = self.active.lock();

        if let Some(previous) = active.take() {
            if let Err(e) = self.sync_and_write_meta(&previous) {
                warn!("Failed to flush previous session {}: {}", previous.session_id, e);
            }
            debug!("Closed event log for session {}", previous.session_id);
        }

        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir).map_err(|e| {
            PipelineError::StorageFailed(format!("Failed to create session directory: {}", e))
        })?;

        let path = dir.join(EVENTS_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| PipelineError::StorageFailed(format!("Failed to open event log: {}", e)))?;

        truncate_torn_tail(&mut file)
            .map_err(|e| PipelineError::StorageFailed(format!("Failed to repair event log: {}", e)))?;

        let existing = read_log(&path)?;
        let event_count = existing.len() as u64;
        let last_event_timestamp = existing.last().map(|e| e.timestamp_ms).unwrap_or(0);
        let uploaded_count = match read_meta(&dir) {
            Ok(Some(meta)) => meta.uploaded_count.min(event_count),
            Ok(None) => 0,
            Err(e) => {
                warn!("Ignoring unreadable buffer metadata for {}: {}", session_id, e);
                0
            }
        };

        info!(
            "Event buffer configured for session {} ({} events on disk, {} delivered)",
            session_id, event_count, uploaded_count
        );

        *active = Some(ActiveLog {
            session_id: session_id.to_string(),
            dir,
            file,
            event_count,
            uploaded_count,
            last_event_timestamp,
        });
        self.closed.store(false, Ordering::SeqCst);

        Ok(event_count)
    }

    /// Serialize and append one envelope. Returns its position in the log.
    pub fn append_event(&self, event: &EventEnvelope) -> Result<u64> {
        let serialized = event.serialize()?;
        self.append_serialized(std::slice::from_ref(&serialized))
    }

    /// Append a batch. Nothing is written unless every event serializes.
    pub fn append_events(&self, events: &[EventEnvelope]) -> Result<u64> {
        let serialized = events
            .iter()
            .map(EventEnvelope::serialize)
            .collect::<Result<Vec<_>>>()?;
        self.append_serialized(&serialized)
    }

    /// Append already-serialized events as consecutive lines in one write.
    ///
    /// Returns the log position of the first appended event; the rest
    /// follow consecutively.
    pub fn append_serialized(&self, events: &[SerializedEvent]) -> Result<u64> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::BufferClosed);
        }

        let mut guard = self.active.lock();
        let log = guard
            .as_mut()
            .ok_or_else(|| PipelineError::NotConfigured("event buffer has no session".to_string()))?;

        let first_position = log.event_count;
        if events.is_empty() {
            return Ok(first_position);
        }

        let mut lines = Vec::with_capacity(events.iter().map(|e| e.size() + 1).sum());
        for event in events {
            lines.extend_from_slice(&event.json);
            lines.push(b'\n');
        }

        log.file
            .write_all(&lines)
            .map_err(|e| PipelineError::StorageFailed(format!("Failed to append events: {}", e)))?;

        log.event_count += events.len() as u64;
        if let Some(last) = events.last() {
            log.last_event_timestamp = log.last_event_timestamp.max(last.timestamp_ms);
        }

        Ok(first_position)
    }

    /// Record that the first `up_to` events of the active log are delivered.
    ///
    /// The watermark never moves backwards. When it reaches the end of the
    /// log the log is emptied and positions restart at 0. Returns the
    /// watermark afterwards.
    pub fn mark_uploaded(&self, up_to: u64) -> Result<u64> {
        let mut guard = self.active.lock();
        let log = guard
            .as_mut()
            .ok_or_else(|| PipelineError::NotConfigured("event buffer has no session".to_string()))?;

        let up_to = up_to.min(log.event_count);
        if up_to <= log.uploaded_count {
            return Ok(log.uploaded_count);
        }

        if up_to < log.event_count {
            log.uploaded_count = up_to;
            self.sync_and_write_meta(log)?;
            debug!(
                "Session {}: {} of {} logged events delivered",
                log.session_id, log.uploaded_count, log.event_count
            );
            return Ok(log.uploaded_count);
        }

        // Sidecar first: a crash before the truncate re-ships, never loses
        self.write_meta(log, 0, 0)?;
        log.file
            .set_len(0)
            .map_err(|e| PipelineError::StorageFailed(format!("Failed to compact event log: {}", e)))?;
        info!(
            "Compacted event log for session {} ({} delivered events dropped)",
            log.session_id, log.event_count
        );
        log.event_count = 0;
        log.uploaded_count = 0;
        Ok(0)
    }

    /// Watermark of the active log
    pub fn uploaded_count(&self) -> u64 {
        self.active.lock().as_ref().map(|log| log.uploaded_count).unwrap_or(0)
    }

    /// Force the log to stable storage and refresh the sidecar
    pub fn flush(&self) -> Result<()> {
        let guard = self.active.lock();
        match guard.as_ref() {
            Some(log) => self.sync_and_write_meta(log),
            None => Ok(()),
        }
    }

    /// Reject further appends and flush
    pub fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.flush()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Events of the active session past the upload watermark
    pub fn read_pending_events(&self) -> Result<Vec<EventEnvelope>> {
        let session_id = self
            .session_id()
            .ok_or_else(|| PipelineError::NotConfigured("event buffer has no session".to_string()))?;
        self.read_undelivered_for(&session_id)
    }

    /// Events of any session on disk past its upload watermark
    pub fn read_undelivered_for(&self, session_id: &str) -> Result<Vec<EventEnvelope>> {
        let mut events = self.read_events_for(session_id)?;
        let delivered = {
            let guard = self.active.lock();
            match guard.as_ref() {
                Some(log) if log.session_id == session_id => log.uploaded_count,
                _ => read_meta(&self.session_dir(session_id))?
                    .map(|meta| meta.uploaded_count)
                    .unwrap_or(0),
            }
        };

        let delivered = usize::try_from(delivered).unwrap_or(usize::MAX).min(events.len());
        Ok(events.split_off(delivered))
    }

    /// Every well-formed event of any session on disk, delivered or not
    pub fn read_events_for(&self, session_id: &str) -> Result<Vec<EventEnvelope>> {
        validate_session_id(session_id)?;
        let path = self.session_dir(session_id).join(EVENTS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_log(&path)
    }

    /// Truncate the active session's log after its events were delivered
    pub fn clear_events(&self) -> Result<()> {
        let mut guard = self.active.lock();
        let log = guard
            .as_mut()
            .ok_or_else(|| PipelineError::NotConfigured("event buffer has no session".to_string()))?;

        log.file
            .set_len(0)
            .map_err(|e| PipelineError::StorageFailed(format!("Failed to clear event log: {}", e)))?;
        log.event_count = 0;
        log.uploaded_count = 0;

        info!("Cleared event log for session {}", log.session_id);
        self.sync_and_write_meta(log)
    }

    /// Remove a session's on-disk state. Clears in place if it is the active session.
    pub fn clear_session(&self, session_id: &str) -> Result<()> {
        validate_session_id(session_id)?;
        if self.session_id().as_deref() == Some(session_id) {
            return self.clear_events();
        }

        let dir = self.session_dir(session_id);
        for name in [EVENTS_FILE, META_FILE] {
            crate::utils::fs::remove_if_exists(&dir.join(name)).map_err(|e| {
                PipelineError::StorageFailed(format!("Failed to remove {}: {}", name, e))
            })?;
        }
        // Only succeeds once nothing else (spilled frames) remains
        let _ = fs::remove_dir(&dir);

        info!("Cleared on-disk events for session {}", session_id);
        Ok(())
    }

    /// Sessions that have an event log on disk
    pub fn list_sessions(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.sessions_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(PipelineError::StorageFailed(format!(
                    "Failed to list sessions: {}",
                    e
                )))
            }
        };

        let mut sessions: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().join(EVENTS_FILE).is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| validate_session_id(name).is_ok())
            .collect();
        sessions.sort();

        Ok(sessions)
    }

    /// Read a session's sidecar, if one was written
    pub fn pending_summary(&self, session_id: &str) -> Result<Option<BufferMeta>> {
        validate_session_id(session_id)?;
        read_meta(&self.session_dir(session_id))
    }

    pub fn session_id(&self) -> Option<String> {
        self.active.lock().as_ref().map(|log| log.session_id.clone())
    }

    pub fn event_count(&self) -> u64 {
        self.active.lock().as_ref().map(|log| log.event_count).unwrap_or(0)
    }

    pub fn last_event_timestamp(&self) -> i64 {
        self.active
            .lock()
            .as_ref()
            .map(|log| log.last_event_timestamp)
            .unwrap_or(0)
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_root.join(session_id)
    }

    fn sync_and_write_meta(&self, log: &ActiveLog) -> Result<()> {
        log.file
            .sync_data()
            .map_err(|e| PipelineError::StorageFailed(format!("Failed to sync event log: {}", e)))?;
        self.write_meta(log, log.event_count, log.uploaded_count)?;

        debug!(
            "Flushed event log for session {} ({} events)",
            log.session_id, log.event_count
        );
        Ok(())
    }

    fn write_meta(&self, log: &ActiveLog, event_count: u64, uploaded_count: u64) -> Result<()> {
        let meta = BufferMeta {
            event_count,
            uploaded_count,
            last_event_timestamp: log.last_event_timestamp,
            saved_at: self.clock.now_ms(),
        };
        let bytes = serde_json::to_vec(&meta)?;

        write_atomic(&log.dir.join(META_FILE), &bytes).map_err(|e| {
            PipelineError::StorageFailed(format!("Failed to write buffer metadata: {}", e))
        })
    }
}

fn read_meta(dir: &Path) -> Result<Option<BufferMeta>> {
    match fs::read(dir.join(META_FILE)) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PipelineError::StorageFailed(format!(
            "Failed to read buffer metadata: {}",
            e
        ))),
    }
}

/// Cut a trailing partial line (no final newline) left by a crash.
fn truncate_torn_tail(file: &mut File) -> std::io::Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }

    let mut contents = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut contents)?;

    if contents.last() == Some(&b'\n') {
        return Ok(());
    }

    let keep = contents
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);

    warn!("Event log has a torn final line, truncating {} bytes", contents.len() - keep);
    file.set_len(keep as u64)?;
    file.sync_data()
}

/// Parse every well-formed line of a log, skipping anything malformed.
fn read_log(path: &Path) -> Result<Vec<EventEnvelope>> {
    let file = File::open(path)
        .map_err(|e| PipelineError::StorageFailed(format!("Failed to open event log: {}", e)))?;

    let mut events = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line
            .map_err(|e| PipelineError::StorageFailed(format!("Failed to read event log: {}", e)))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventEnvelope>(&line) {
            Ok(event) => events.push(event),
            Err(e) => warn!("Skipping malformed event at {:?}:{}: {}", path, index + 1, e),
        }
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::ManualClock;
    use tempfile::tempdir;

    fn buffer(root: &Path) -> EventBuffer {
        EventBuffer::new(root.to_path_buf(), Arc::new(ManualClock::new(1_000)))
    }

    fn envelope(i: i64) -> EventEnvelope {
        EventEnvelope::new("tap", 1_700_000_000_000 + i).with_field("index", i)
    }

    #[test]
    fn test_append_flush_restart_round_trip() {
        let dir = tempdir().unwrap();

        {
            let events = buffer(dir.path());
            assert_eq!(events.configure("session_a").unwrap(), 0);
            for i in 0..25 {
                events.append_event(&envelope(i)).unwrap();
            }
            events.flush().unwrap();
            assert_eq!(events.event_count(), 25);
        }

        // simulated restart
        let events = buffer(dir.path());
        assert_eq!(events.configure("session_a").unwrap(), 25);
        assert_eq!(events.event_count(), 25);

        let pending = events.read_pending_events().unwrap();
        assert_eq!(pending.len(), 25);
        assert_eq!(pending[0], envelope(0));
        assert_eq!(pending[24], envelope(24));
        assert_eq!(events.last_event_timestamp(), 1_700_000_000_024);
    }

    #[test]
    fn test_flush_writes_sidecar() {
        let dir = tempdir().unwrap();
        let events = buffer(dir.path());
        events.configure("s").unwrap();
        events.append_event(&envelope(1)).unwrap();
        events.append_event(&envelope(2)).unwrap();
        events.flush().unwrap();

        let meta = events.pending_summary("s").unwrap().unwrap();
        assert_eq!(
            meta,
            BufferMeta {
                event_count: 2,
                uploaded_count: 0,
                last_event_timestamp: 1_700_000_000_002,
                saved_at: 1_000,
            }
        );

        let raw = fs::read_to_string(dir.path().join("s").join(META_FILE)).unwrap();
        assert!(raw.contains("\"eventCount\":2"));
        assert!(raw.contains("\"uploadedCount\":0"));
        assert!(raw.contains("\"lastEventTimestamp\""));
        assert!(raw.contains("\"savedAt\""));
    }

    #[test]
    fn test_log_is_jsonl() {
        let dir = tempdir().unwrap();
        let events = buffer(dir.path());
        events.configure("s").unwrap();
        events.append_event(&envelope(1)).unwrap();
        events.append_event(&envelope(2)).unwrap();

        let raw = fs::read_to_string(dir.path().join("s").join(EVENTS_FILE)).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(raw.ends_with('\n'));
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["type"], "tap");
    }

    #[test]
    fn test_append_before_configure_fails() {
        let dir = tempdir().unwrap();
        let events = buffer(dir.path());
        assert!(matches!(
            events.append_event(&envelope(1)),
            Err(PipelineError::NotConfigured(_))
        ));
    }

    #[test]
    fn test_append_batch() {
        let dir = tempdir().unwrap();
        let events = buffer(dir.path());
        events.configure("s").unwrap();

        let batch: Vec<EventEnvelope> = (1..=4).map(envelope).collect();
        events.append_events(&batch).unwrap();
        events.append_events(&[]).unwrap();

        assert_eq!(events.event_count(), 4);
        assert_eq!(events.last_event_timestamp(), 1_700_000_000_004);
        assert_eq!(events.read_pending_events().unwrap(), batch);
    }

    #[test]
    fn test_shutdown_rejects_appends() {
        let dir = tempdir().unwrap();
        let events = buffer(dir.path());
        events.configure("s").unwrap();
        events.shutdown().unwrap();

        assert!(events.is_closed());
        assert!(matches!(
            events.append_event(&envelope(1)),
            Err(PipelineError::BufferClosed)
        ));
    }

    #[test]
    fn test_torn_tail_is_repaired() {
        let dir = tempdir().unwrap();
        {
            let events = buffer(dir.path());
            events.configure("s").unwrap();
            events.append_event(&envelope(1)).unwrap();
            events.append_event(&envelope(2)).unwrap();
        }

        let path = dir.path().join("s").join(EVENTS_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"type\":\"tap\",\"times").unwrap();
        drop(file);

        let events = buffer(dir.path());
        assert_eq!(events.configure("s").unwrap(), 2);
        events.append_event(&envelope(3)).unwrap();

        let pending = events.read_pending_events().unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[2], envelope(3));
    }

    #[test]
    fn test_clear_events() {
        let dir = tempdir().unwrap();
        let events = buffer(dir.path());
        events.configure("s").unwrap();
        events.append_event(&envelope(1)).unwrap();
        events.clear_events().unwrap();

        assert_eq!(events.event_count(), 0);
        assert!(events.read_pending_events().unwrap().is_empty());

        events.append_event(&envelope(2)).unwrap();
        assert_eq!(events.read_pending_events().unwrap(), vec![envelope(2)]);
    }

    #[test]
    fn test_multiple_sessions_and_enumeration() {
        let dir = tempdir().unwrap();
        let events = buffer(dir.path());

        events.configure("old").unwrap();
        events.append_event(&envelope(1)).unwrap();
        events.configure("new").unwrap();
        events.append_event(&envelope(2)).unwrap();

        assert_eq!(events.list_sessions().unwrap(), vec!["new".to_string(), "old".to_string()]);
        assert_eq!(events.read_events_for("old").unwrap(), vec![envelope(1)]);

        // switching sessions flushed the previous log's sidecar
        assert_eq!(events.pending_summary("old").unwrap().unwrap().event_count, 1);

        events.clear_session("old").unwrap();
        assert_eq!(events.list_sessions().unwrap(), vec!["new".to_string()]);
        assert_eq!(events.session_id().as_deref(), Some("new"));
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let session_dir = dir.path().join("s");
        fs::create_dir_all(&session_dir).unwrap();
        fs::write(
            session_dir.join(EVENTS_FILE),
            "{\"type\":\"tap\",\"timestamp\":1}\nnot json\n{\"type\":\"tap\",\"timestamp\":2}\n",
        )
        .unwrap();

        let events = buffer(dir.path());
        assert_eq!(events.configure("s").unwrap(), 2);
    }

    #[test]
    fn test_watermark_hides_delivered_prefix_across_restart() {
        let dir = tempdir().unwrap();
        {
            let events = buffer(dir.path());
            events.configure("s").unwrap();
            assert_eq!(events.append_events(&(0..3).map(envelope).collect::<Vec<_>>()).unwrap(), 0);
            assert_eq!(events.append_event(&envelope(3)).unwrap(), 3);

            assert_eq!(events.mark_uploaded(2).unwrap(), 2);
            // never moves backwards
            assert_eq!(events.mark_uploaded(1).unwrap(), 2);
            assert_eq!(events.read_pending_events().unwrap(), vec![envelope(2), envelope(3)]);
        }

        let events = buffer(dir.path());
        assert_eq!(events.configure("s").unwrap(), 4);
        assert_eq!(events.uploaded_count(), 2);
        assert_eq!(events.read_pending_events().unwrap(), vec![envelope(2), envelope(3)]);
        assert_eq!(events.read_events_for("s").unwrap().len(), 4);
        assert_eq!(events.pending_summary("s").unwrap().unwrap().uploaded_count, 2);
    }

    #[test]
    fn test_fully_delivered_log_is_compacted() {
        let dir = tempdir().unwrap();
        let events = buffer(dir.path());
        events.configure("s").unwrap();
        events.append_events(&(0..5).map(envelope).collect::<Vec<_>>()).unwrap();

        assert_eq!(events.mark_uploaded(5).unwrap(), 0);
        assert_eq!(events.event_count(), 0);
        assert_eq!(fs::metadata(dir.path().join("s").join(EVENTS_FILE)).unwrap().len(), 0);
        assert!(events.read_pending_events().unwrap().is_empty());

        // positions restart after compaction
        assert_eq!(events.append_event(&envelope(9)).unwrap(), 0);
        assert_eq!(events.read_pending_events().unwrap(), vec![envelope(9)]);
        assert_eq!(events.last_event_timestamp(), 1_700_000_000_009);
    }

    #[test]
    fn test_inactive_session_watermark_read_from_sidecar() {
        let dir = tempdir().unwrap();
        let events = buffer(dir.path());
        events.configure("old").unwrap();
        events.append_events(&(0..3).map(envelope).collect::<Vec<_>>()).unwrap();
        events.mark_uploaded(1).unwrap();
        events.configure("new").unwrap();

        assert_eq!(events.read_undelivered_for("old").unwrap(), vec![envelope(1), envelope(2)]);
    }

    #[test]
    fn test_unsafe_session_ids_never_touch_disk() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("sessions");
        let events = buffer(&root);

        for id in ["../escape", "a/b", ".."] {
            assert!(matches!(events.configure(id), Err(PipelineError::ConfigError(_))));
            assert!(events.read_events_for(id).is_err());
            assert!(events.clear_session(id).is_err());
        }
        assert!(!dir.path().join("escape").exists());
        assert!(!root.exists());
        assert!(events.session_id().is_none());
    }

    #[test]
    fn test_list_sessions_without_root() {
        let dir = tempdir().unwrap();
        let events = buffer(&dir.path().join("missing"));
        assert!(events.list_sessions().unwrap().is_empty());
    }
}
