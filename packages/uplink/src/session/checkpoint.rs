// packages/uplink/src/session/checkpoint.rs
//! Session recovery checkpoint
//!
//! Written when a session starts and deleted once the backend has confirmed
//! its end. A checkpoint found at startup therefore belongs to a session
//! whose process died before finalizing.

use crate::session::SessionContext;
use crate::utils::errors::{PipelineError, Result};
use crate::utils::fs::{remove_if_exists, write_atomic};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// `session_checkpoint.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCheckpoint {
    pub session_id: String,

    /// Project key the session was started with
    #[serde(default)]
    pub api_token: Option<String>,

    pub start_ms: i64,
    pub endpoint: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_token: Option<String>,

    /// Refreshed after successful uploads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_ms: Option<i64>,
}

impl SessionCheckpoint {
    pub fn from_context(ctx: &SessionContext) -> Self {
        Self {
            session_id: ctx.session_id.clone(),
            api_token: ctx.project_key.clone(),
            start_ms: ctx.started_at_ms,
            endpoint: ctx.endpoint.clone(),
            upload_token: ctx.upload_token.clone(),
            last_active_ms: None,
        }
    }

    /// Credentials for finalizing this session
    pub fn to_context(&self) -> SessionContext {
        SessionContext {
            session_id: self.session_id.clone(),
            endpoint: self.endpoint.trim_end_matches('/').to_string(),
            project_key: self.api_token.clone(),
            upload_token: self.upload_token.clone(),
            started_at_ms: self.start_ms,
        }
    }
}

/// Reads and writes the checkpoint file
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, checkpoint: &SessionCheckpoint) -> Result<()> {
        let bytes = serde_json::to_vec(checkpoint)?;
        write_atomic(&self.path, &bytes)
            .map_err(|e| PipelineError::StorageFailed(format!("Failed to write checkpoint: {}", e)))?;
        debug!("Checkpoint written for session {}", checkpoint.session_id);
        Ok(())
    }

    /// Load the checkpoint. A corrupt file is deleted and reported as absent.
    pub fn load(&self) -> Result<Option<SessionCheckpoint>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PipelineError::StorageFailed(format!(
                    "Failed to read checkpoint: {}",
                    e
                )))
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                warn!("Deleting corrupt checkpoint {:?}: {}", self.path, e);
                self.clear()?;
                Ok(None)
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        remove_if_exists(&self.path)
            .map_err(|e| PipelineError::StorageFailed(format!("Failed to delete checkpoint: {}", e)))?;
        Ok(())
    }

    /// Record activity for `session_id`. Returns false if the checkpoint
    /// belongs to another session or does not exist.
    pub fn touch(&self, session_id: &str, last_active_ms: i64) -> Result<bool> {
        let Some(mut checkpoint) = self.load()? else {
            return Ok(false);
        };
        if checkpoint.session_id != session_id {
            return Ok(false);
        }
        if checkpoint.last_active_ms.map_or(false, |t| t >= last_active_ms) {
            return Ok(true);
        }

        checkpoint.last_active_ms = Some(last_active_ms);
        self.write(&checkpoint)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn context() -> SessionContext {
        SessionContext::new("session_1", "http://ingest.local", 1_000)
            .with_project_key("pk")
            .with_upload_token("tok")
    }

    #[test]
    fn test_write_load_clear() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("session_checkpoint.json"));
        assert!(store.load().unwrap().is_none());

        let checkpoint = SessionCheckpoint::from_context(&context());
        store.write(&checkpoint).unwrap();
        assert_eq!(store.load().unwrap(), Some(checkpoint.clone()));
        assert_eq!(checkpoint.to_context(), context());

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        store.clear().unwrap();
    }

    #[test]
    fn test_wire_format() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("session_checkpoint.json"));
        store.write(&SessionCheckpoint::from_context(&context())).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw["sessionId"], "session_1");
        assert_eq!(raw["apiToken"], "pk");
        assert_eq!(raw["startMs"], 1_000);
        assert_eq!(raw["endpoint"], "http://ingest.local");
        assert!(raw.get("lastActiveMs").is_none());
    }

    #[test]
    fn test_minimal_checkpoint_parses() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session_checkpoint.json");
        fs::write(
            &path,
            r#"{"sessionId":"s","apiToken":"k","startMs":5,"endpoint":"http://e"}"#,
        )
        .unwrap();

        let checkpoint = CheckpointStore::new(path).load().unwrap().unwrap();
        assert_eq!(checkpoint.upload_token, None);
        assert_eq!(checkpoint.last_active_ms, None);
    }

    #[test]
    fn test_corrupt_checkpoint_is_deleted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session_checkpoint.json");
        fs::write(&path, b"{not json").unwrap();

        let store = CheckpointStore::new(&path);
        assert!(store.load().unwrap().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_touch() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("session_checkpoint.json"));
        assert!(!store.touch("session_1", 10).unwrap());

        store.write(&SessionCheckpoint::from_context(&context())).unwrap();
        assert!(store.touch("session_1", 5_000).unwrap());
        assert!(!store.touch("other", 6_000).unwrap());
        assert!(store.touch("session_1", 4_000).unwrap());

        assert_eq!(store.load().unwrap().unwrap().last_active_ms, Some(5_000));
    }
}
