//! Per-folder session transcripts and close handoffs.
//!
//! The agent writes one transcript per session under
//! `<history_dir>/<folder-key>/<session-id>.jsonl`; the newest one is the
//! folder's recoverable session. A close handoff is written here when the
//! user deliberately ends a session.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::models::record::{CloseHandoff, RecoverableSession};
use crate::{AppError, Result};

const TRANSCRIPT_EXTENSION: &str = "jsonl";

/// Encode a folder path as a single directory name.
///
/// Every character that is not ASCII alphanumeric becomes `-`, so
/// `/home/me/app` maps to `-home-me-app`.
#[must_use]
pub fn folder_key(folder: &Path) -> String {
    folder
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Read side of the agent's transcripts plus the handoff markers.
#[derive(Debug, Clone)]
pub struct SessionHistory {
    history_dir: PathBuf,
    handoff_dir: PathBuf,
}

impl SessionHistory {
    /// History rooted at `history_dir`, handoffs stored in `handoff_dir`.
    #[must_use]
    pub fn new(history_dir: impl Into<PathBuf>, handoff_dir: impl Into<PathBuf>) -> Self {
        Self {
            history_dir: history_dir.into(),
            handoff_dir: handoff_dir.into(),
        }
    }

    /// Directory the agent writes transcripts for `folder` into.
    #[must_use]
    pub fn transcript_dir(&self, folder: &Path) -> PathBuf {
        self.history_dir.join(folder_key(folder))
    }

    /// Newest transcript for `folder`, if any.
    #[must_use]
    pub fn latest_recoverable(&self, folder: &Path) -> Option<RecoverableSession> {
        let dir = self.transcript_dir(folder);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(dir = %dir.display(), %err, "cannot list session transcripts");
                return None;
            }
        };

        entries
            .filter_map(std::result::Result::ok)
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some(TRANSCRIPT_EXTENSION) {
                    return None;
                }
                let id = path.file_stem()?.to_str()?.to_owned();
                let modified = entry.metadata().ok()?.modified().ok()?;
                Some(RecoverableSession {
                    id,
                    modified: DateTime::<Utc>::from(modified),
                })
            })
            .max_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.id.cmp(&b.id)))
    }

    /// Close handoff recorded for `folder`, if any.
    #[must_use]
    pub fn close_handoff(&self, folder: &Path) -> Option<CloseHandoff> {
        let path = self.handoff_path(folder);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), %err, "cannot read close handoff");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(handoff) => Some(handoff),
            Err(err) => {
                warn!(path = %path.display(), %err, "close handoff is corrupt, ignoring");
                None
            }
        }
    }

    /// Whether the folder's recoverable state was deliberately closed.
    ///
    /// True when a handoff exists and either nothing is recoverable or the
    /// newest transcript is the session the handoff names. A transcript for
    /// a different session means a later session was abandoned, not closed.
    #[must_use]
    pub fn has_close_handoff(
        &self,
        folder: &Path,
        recoverable: Option<&RecoverableSession>,
    ) -> bool {
        let Some(handoff) = self.close_handoff(folder) else {
            return false;
        };
        match recoverable {
            Some(latest) => latest.id == handoff.session_id,
            None => true,
        }
    }

    /// Mark `session_id` as deliberately closed for `folder`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if the marker cannot be written.
    pub fn record_close_handoff(&self, folder: &Path, session_id: &str) -> Result<()> {
        fs::create_dir_all(&self.handoff_dir).map_err(|err| {
            AppError::Persistence(format!(
                "cannot create {}: {err}",
                self.handoff_dir.display()
            ))
        })?;
        let handoff = CloseHandoff {
            session_id: session_id.to_owned(),
            closed_at: Utc::now(),
        };
        let body = serde_json::to_vec(&handoff)
            .map_err(|err| AppError::Persistence(format!("cannot encode handoff: {err}")))?;
        let path = self.handoff_path(folder);
        fs::write(&path, body).map_err(|err| {
            AppError::Persistence(format!("cannot write {}: {err}", path.display()))
        })?;
        debug!(session_id, folder = %folder.display(), "close handoff recorded");
        Ok(())
    }

    fn handoff_path(&self, folder: &Path) -> PathBuf {
        self.handoff_dir.join(format!("{}.json", folder_key(folder)))
    }
}
