//! Flat JSON file holding crash-recovery records.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::models::record::SessionRecord;
use crate::{AppError, Result};

/// Reader/writer for the recovery record list.
#[derive(Debug, Clone)]
pub struct RecordStore {
    path: PathBuf,
}

impl RecordStore {
    /// Store backed by the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record.
    ///
    /// A missing file means no records. A corrupt or unreadable file is
    /// logged and also treated as empty; recovery is best effort.
    #[must_use]
    pub fn load(&self) -> Vec<SessionRecord> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no recovery records on disk");
                return Vec::new();
            }
            Err(err) => {
                warn!(path = %self.path.display(), %err, "failed to read recovery records");
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<SessionRecord>>(&raw) {
            Ok(records) => records,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "recovery records are corrupt, ignoring");
                Vec::new()
            }
        }
    }

    /// Replace the file contents with `records`.
    ///
    /// Writes to a temporary sibling and renames it into place so a crash
    /// mid-write never leaves a truncated file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if the directory cannot be created or
    /// the file cannot be written.
    pub fn save(&self, records: &[SessionRecord]) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|err| {
            AppError::Persistence(format!("cannot create {}: {err}", dir.display()))
        })?;

        let body = serde_json::to_vec_pretty(records)
            .map_err(|err| AppError::Persistence(format!("cannot encode records: {err}")))?;

        let mut tmp = NamedTempFile::new_in(dir)
            .map_err(|err| AppError::Persistence(format!("cannot create temp file: {err}")))?;
        tmp.write_all(&body)
            .map_err(|err| AppError::Persistence(format!("cannot write records: {err}")))?;
        tmp.persist(&self.path)
            .map_err(|err| AppError::Persistence(format!("cannot replace records: {err}")))?;

        debug!(count = records.len(), path = %self.path.display(), "recovery records written");
        Ok(())
    }

    /// Delete the file. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` for any other removal failure.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AppError::Persistence(format!(
                "cannot delete {}: {err}",
                self.path.display()
            ))),
        }
    }
}
