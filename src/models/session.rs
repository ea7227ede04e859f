//! Session model and activity helpers.

use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::record::SessionRecord;
use crate::orchestrator::idle::monotonic_now;

/// Handle to the agent process backing a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Operating-system process id.
    pub pid: u32,
}

impl ProcessHandle {
    /// Handle for a freshly spawned, still running process.
    #[must_use]
    pub fn running(pid: u32) -> Self {
        Self { pid }
    }
}

/// Activity snapshot consumed by idle guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionActivity {
    /// A prompt was sent and its result has not arrived yet.
    pub turn_in_progress: bool,
    /// Last time the agent produced any output.
    pub last_output_at: Option<Instant>,
    /// When the agent process was spawned.
    pub spawned_at: Instant,
}

/// A logical agent session bound to at most one folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Logical session identifier, stable across client reconnects.
    pub id: String,
    /// Folder served by the session; `None` while in the lobby.
    pub folder: Option<PathBuf>,
    /// Agent process, once spawned.
    pub process: Option<ProcessHandle>,
    /// Whether a prompt is outstanding.
    pub turn_in_progress: bool,
    /// Last agent output (monotonic clock).
    pub last_output_at: Option<Instant>,
    /// Spawn time (wall clock), persisted in recovery records.
    pub spawned_at: DateTime<Utc>,
    /// Spawn time (monotonic clock), used by idle decisions.
    pub spawned_instant: Instant,
    /// Whether attaching should ask the agent to resume prior context.
    pub resumable: bool,
}

impl Session {
    /// Construct a session for `folder` with the given identity.
    #[must_use]
    pub fn new(id: String, folder: Option<PathBuf>, resumable: bool) -> Self {
        Self {
            id,
            folder,
            process: None,
            turn_in_progress: false,
            last_output_at: None,
            spawned_at: Utc::now(),
            spawned_instant: monotonic_now(),
            resumable,
        }
    }

    /// Generate a fresh random session identifier.
    #[must_use]
    pub fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Record the spawned agent process.
    pub fn attach_process(&mut self, pid: u32) {
        self.process = Some(ProcessHandle::running(pid));
        self.spawned_at = Utc::now();
        self.spawned_instant = monotonic_now();
    }

    /// Live pid, if the process has been spawned.
    ///
    /// Sessions leave the registry when their process exits, so a handle
    /// is never kept for a dead process.
    #[must_use]
    pub fn live_pid(&self) -> Option<u32> {
        self.process.map(|handle| handle.pid)
    }

    /// Mark a prompt as outstanding.
    pub fn begin_turn(&mut self) {
        self.turn_in_progress = true;
    }

    /// Note agent output; a `result` line also closes the turn.
    pub fn record_output(&mut self, at: Instant, ends_turn: bool) {
        self.last_output_at = Some(at);
        if ends_turn {
            self.turn_in_progress = false;
        }
    }

    /// Snapshot for idle guards.
    #[must_use]
    pub fn activity(&self) -> SessionActivity {
        SessionActivity {
            turn_in_progress: self.turn_in_progress,
            last_output_at: self.last_output_at,
            spawned_at: self.spawned_instant,
        }
    }

    /// Crash-recovery record; only sessions with a live process have one.
    #[must_use]
    pub fn to_record(&self) -> Option<SessionRecord> {
        let pid = self.live_pid()?;
        let folder = self.folder.clone()?;
        Some(SessionRecord {
            session_id: self.id.clone(),
            folder,
            pid,
            spawned_at: self.spawned_at,
        })
    }
}
