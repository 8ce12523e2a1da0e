// packages/uplink/src/session/mod.rs
//! Session identity and crash recovery

pub mod checkpoint;
pub mod recovery;

pub use checkpoint::{CheckpointStore, SessionCheckpoint};
pub use recovery::{recover_orphaned_session, RecoveryOutcome};

use crate::utils::errors::{PipelineError, Result};
use serde::{Deserialize, Serialize};

/// Longest accepted session id
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Check that `session_id` can name a directory under the sessions root.
///
/// Accepts 1 to 128 ASCII letters, digits, `-`, `_` and `.`, not starting
/// with `.`. Anything else could escape the root or collide with a
/// hidden file.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LEN {
        return Err(PipelineError::ConfigError(format!(
            "session id must be 1 to {} characters, got {}",
            MAX_SESSION_ID_LEN,
            session_id.len()
        )));
    }
    if session_id.starts_with('.') {
        return Err(PipelineError::ConfigError(format!(
            "session id {:?} must not start with '.'",
            session_id
        )));
    }
    if let Some(bad) = session_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(PipelineError::ConfigError(format!(
            "session id {:?} contains {:?}",
            session_id, bad
        )));
    }
    Ok(())
}

/// Credentials and addressing every request of a session is signed with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,

    /// Ingestion base URL, without trailing slash
    pub endpoint: String,

    /// Sent as `x-rejourney-key`
    pub project_key: Option<String>,

    /// Sent as `x-upload-token`
    pub upload_token: Option<String>,

    /// Session start (milliseconds since epoch)
    pub started_at_ms: i64,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>, endpoint: impl Into<String>, started_at_ms: i64) -> Self {
        Self {
            session_id: session_id.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            project_key: None,
            upload_token: None,
            started_at_ms,
        }
    }

    pub fn with_project_key(mut self, key: impl Into<String>) -> Self {
        self.project_key = Some(key.into());
        self
    }

    pub fn with_upload_token(mut self, token: impl Into<String>) -> Self {
        self.upload_token = Some(token.into());
        self
    }

    /// Reject ids that are unsafe as a directory name
    pub fn validate(&self) -> Result<()> {
        validate_session_id(&self.session_id)
    }

    /// Absolute URL for an ingestion path
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }
}
