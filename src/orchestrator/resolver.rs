//! Attach decision for a client selecting a folder.
//!
//! [`resolve`] is total and side-effect free. Decision order, first match
//! wins:
//!
//! 1. A live session already serves the folder: reconnect to it and keep its
//!    `resumable` flag, whatever is on disk.
//! 2. Something recoverable exists and no close handoff is recorded: resume it.
//! 3. Otherwise start fresh. A close handoff is the only authoritative sign
//!    that the user ended the session, and it is never overridden by leftover
//!    transcripts.

use crate::models::record::RecoverableSession;
use crate::models::session::Session;

/// Outcome of [`resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Session the client attaches to.
    pub session_id: String,
    /// Whether the agent should be asked to resume prior context.
    pub resumable: bool,
    /// Whether the client joins an already running session.
    pub is_reconnect: bool,
}

/// Decide which logical session a client attaches to.
pub fn resolve<F>(
    existing_live: Option<&Session>,
    latest_recoverable: Option<&RecoverableSession>,
    has_close_handoff: bool,
    new_id: F,
) -> Resolution
where
    F: FnOnce() -> String,
{
    if let Some(live) = existing_live {
        return Resolution {
            session_id: live.id.clone(),
            resumable: live.resumable,
            is_reconnect: true,
        };
    }

    match latest_recoverable {
        Some(recoverable) if !has_close_handoff => Resolution {
            session_id: recoverable.id.clone(),
            resumable: true,
            is_reconnect: false,
        },
        _ => Resolution {
            session_id: new_id(),
            resumable: false,
            is_reconnect: false,
        },
    }
}
