//! Persisted crash-recovery records.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subset of a live session written to disk so the next server instance can
/// find processes this one leaves behind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Logical session id.
    pub session_id: String,
    /// Folder the process served.
    pub folder: PathBuf,
    /// Agent process id at the time of writing.
    pub pid: u32,
    /// Wall-clock spawn time.
    pub spawned_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Age of the record at `now`.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.spawned_at)
    }
}

/// Newest session transcript left on disk for a folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverableSession {
    /// Session id (transcript file stem).
    pub id: String,
    /// Transcript modification time.
    pub modified: DateTime<Utc>,
}

/// Marker that the user deliberately closed a folder's session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloseHandoff {
    /// Session that was closed.
    pub session_id: String,
    /// When it was closed.
    pub closed_at: DateTime<Utc>,
}
