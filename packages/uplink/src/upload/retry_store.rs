// packages/uplink/src/upload/retry_store.rs
//! On-disk retry queue
//!
//! Each pending upload is stored as two files in one directory:
//! `{ulid}.payload` (raw gzip bytes) and `{ulid}.json` (everything else).
//! The payload is written first, so a `.json` file always has its payload.
//!
//! Files are keyed by upload id: persisting the same upload twice replaces
//! it, and restoring leaves the files in place. A stored upload is deleted
//! with [`remove`] only once it has been delivered or dropped, so a crash
//! between restore and delivery cannot lose it.

use crate::upload::protocol::{ContentKind, PendingUpload};
use crate::utils::errors::{PipelineError, Result};
use crate::utils::fs::{fsync_dir, remove_if_exists, write_atomic};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};
use ulid::Ulid;

const RECORD_EXT: &str = "json";
const PAYLOAD_EXT: &str = "payload";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingUploadRecord {
    id: String,
    session_id: String,
    content: ContentKind,
    range_start_ms: u64,
    range_end_ms: u64,
    item_count: u32,
    attempt: u32,
    batch_number: u32,
    payload_size: u64,
}

impl From<&PendingUpload> for PendingUploadRecord {
    fn from(upload: &PendingUpload) -> Self {
        Self {
            id: upload.id.to_string(),
            session_id: upload.session_id.clone(),
            content: upload.content,
            range_start_ms: upload.range_start_ms,
            range_end_ms: upload.range_end_ms,
            item_count: upload.item_count,
            attempt: upload.attempt,
            batch_number: upload.batch_number,
            payload_size: upload.payload.len() as u64,
        }
    }
}

/// Write `uploads` into `dir`. Returns how many were stored.
pub fn persist(dir: &Path, uploads: &[PendingUpload]) -> Result<usize> {
    if uploads.is_empty() {
        return Ok(0);
    }

    fs::create_dir_all(dir).map_err(|e| {
        PipelineError::StorageFailed(format!("Failed to create pending upload directory: {}", e))
    })?;

    for upload in uploads {
        let payload_path = dir.join(format!("{}.{}", upload.id, PAYLOAD_EXT));
        write_atomic(&payload_path, &upload.payload).map_err(|e| {
            PipelineError::StorageFailed(format!("Failed to persist payload {}: {}", upload.id, e))
        })?;

        let record = serde_json::to_vec(&PendingUploadRecord::from(upload))?;
        let record_path = dir.join(format!("{}.{}", upload.id, RECORD_EXT));
        write_atomic(&record_path, &record).map_err(|e| {
            PipelineError::StorageFailed(format!("Failed to persist upload {}: {}", upload.id, e))
        })?;
    }

    info!("Persisted {} pending uploads to {:?}", uploads.len(), dir);
    Ok(uploads.len())
}

/// Load every stored upload in `dir`, oldest first.
///
/// Unreadable or inconsistent pairs, and payloads without a record, are
/// deleted with a warning.
pub fn restore(dir: &Path) -> Result<Vec<PendingUpload>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(PipelineError::StorageFailed(format!(
                "Failed to read pending upload directory: {}",
                e
            )))
        }
    };

    let mut ids: Vec<Ulid> = Vec::new();
    let mut stray_payloads = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Ok(id) = Ulid::from_str(stem) else {
            continue;
        };
        match path.extension().and_then(|e| e.to_str()) {
            Some(RECORD_EXT) => ids.push(id),
            Some(PAYLOAD_EXT) => stray_payloads.push(id),
            _ => {}
        }
    }
    ids.sort();

    let mut uploads = Vec::with_capacity(ids.len());
    for id in &ids {
        match load_one(dir, id) {
            Ok(upload) => uploads.push(upload),
            Err(e) => {
                warn!("Discarding unreadable pending upload {}: {}", id, e);
                let _ = remove(dir, id);
            }
        }
    }

    for id in stray_payloads.iter().filter(|id| !ids.contains(id)) {
        debug!("Removing payload without record: {}", id);
        let _ = remove_if_exists(&dir.join(format!("{}.{}", id, PAYLOAD_EXT)));
    }

    if let Err(e) = fsync_dir(dir) {
        warn!("Failed to sync pending upload directory: {}", e);
    }

    if !uploads.is_empty() {
        info!("Restored {} pending uploads from {:?}", uploads.len(), dir);
    }
    Ok(uploads)
}

/// Delete one stored upload. Missing files are not an error.
pub fn remove(dir: &Path, id: &Ulid) -> Result<()> {
    // record first: a leftover payload is cleaned up by the next restore
    for ext in [RECORD_EXT, PAYLOAD_EXT] {
        remove_if_exists(&dir.join(format!("{}.{}", id, ext))).map_err(|e| {
            PipelineError::StorageFailed(format!("Failed to remove pending upload {}: {}", id, e))
        })?;
    }
    Ok(())
}

fn load_one(dir: &Path, id: &Ulid) -> Result<PendingUpload> {
    let record_bytes = fs::read(dir.join(format!("{}.{}", id, RECORD_EXT)))
        .map_err(|e| PipelineError::StorageFailed(format!("Failed to read record: {}", e)))?;
    let record: PendingUploadRecord = serde_json::from_slice(&record_bytes)?;

    let payload = fs::read(dir.join(format!("{}.{}", id, PAYLOAD_EXT)))
        .map_err(|e| PipelineError::StorageFailed(format!("Failed to read payload: {}", e)))?;
    if payload.len() as u64 != record.payload_size {
        return Err(PipelineError::StorageFailed(format!(
            "Payload size mismatch: expected {}, found {}",
            record.payload_size,
            payload.len()
        )));
    }

    Ok(PendingUpload {
        id: *id,
        session_id: record.session_id,
        content: record.content,
        payload: Bytes::from(payload),
        range_start_ms: record.range_start_ms,
        range_end_ms: record.range_end_ms,
        item_count: record.item_count,
        attempt: record.attempt,
        batch_number: record.batch_number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_persist_and_restore() {
        let dir = tempdir().unwrap();
        let mut first = PendingUpload::events("s1", 1, vec![1u8, 2, 3], 10, 20, 2);
        first.attempt = 2;
        let second = PendingUpload::hierarchy("s1", vec![9u8; 16], 30);

        assert_eq!(persist(dir.path(), &[first.clone(), second.clone()]).unwrap(), 2);

        let restored = restore(dir.path()).unwrap();
        assert_eq!(restored.len(), 2);
        assert!(restored.contains(&first));
        assert!(restored.contains(&second));

        // still on disk until removed
        assert_eq!(restore(dir.path()).unwrap().len(), 2);
        remove(dir.path(), &first.id).unwrap();
        remove(dir.path(), &second.id).unwrap();
        assert!(restore(dir.path()).unwrap().is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_persisting_twice_keeps_one_copy() {
        let dir = tempdir().unwrap();
        let mut upload = PendingUpload::events("s1", 4, vec![7u8; 8], 0, 5, 1);
        persist(dir.path(), std::slice::from_ref(&upload)).unwrap();

        upload.attempt = 2;
        persist(dir.path(), std::slice::from_ref(&upload)).unwrap();

        let restored = restore(dir.path()).unwrap();
        assert_eq!(restored, vec![upload]);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_remove_missing_upload_is_ok() {
        let dir = tempdir().unwrap();
        remove(dir.path(), &Ulid::new()).unwrap();
        remove(&dir.path().join("absent"), &Ulid::new()).unwrap();
    }

    #[test]
    fn test_truncated_payload_is_discarded() {
        let dir = tempdir().unwrap();
        let upload = PendingUpload::events("s1", 1, vec![0u8; 32], 0, 0, 1);
        persist(dir.path(), std::slice::from_ref(&upload)).unwrap();

        fs::write(dir.path().join(format!("{}.payload", upload.id)), b"short").unwrap();

        assert!(restore(dir.path()).unwrap().is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_stray_payload_is_removed() {
        let dir = tempdir().unwrap();
        let id = Ulid::new();
        fs::write(dir.path().join(format!("{}.payload", id)), b"orphan").unwrap();

        assert!(restore(dir.path()).unwrap().is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempdir().unwrap();
        assert!(restore(&dir.path().join("absent")).unwrap().is_empty());
    }
}
