//! Wire frames exchanged over the client WebSocket.
//!
//! Every message is one JSON object tagged by `type`, with camelCase
//! names. The server sends [`InboundFrame`]s; the client sends
//! [`ClientCommand`]s.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum InboundFrame {
    /// The client is bound to a session.
    Connected {
        /// Logical session id.
        session_id: String,
        /// Whether the agent resumed prior context.
        resumed: bool,
    },
    /// The connection is open and no folder is selected.
    LobbyConnected,
    /// Folders the client may connect to.
    FolderList {
        /// Absolute folder paths.
        folders: Vec<String>,
    },
    /// The last prompt reached the agent.
    PromptReceived,
    /// A command failed.
    Error {
        /// Human-readable message.
        message: String,
    },
    /// The session's agent process is gone.
    ProcessExit {
        /// Exit code for a normal exit.
        code: Option<i32>,
        /// Terminating signal.
        signal: Option<i32>,
    },
    /// Replay of earlier agent output begins.
    HistoryStart,
    /// Replay of earlier agent output ends.
    HistoryEnd,
    /// One agent output line, passed through unchanged.
    AgentEvent {
        /// Raw agent event.
        event: Value,
    },
}

impl InboundFrame {
    /// Parse a text frame; malformed input yields `None`.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str(text) {
            Ok(frame) => Some(frame),
            Err(err) => {
                debug!(%err, "dropping malformed frame");
                None
            }
        }
    }
}

/// Commands sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    /// Submit a prompt to the session's agent.
    Prompt {
        /// Prompt text.
        text: String,
    },
    /// Interrupt the current turn.
    Abort,
    /// Ask for the folder list.
    ListFolders,
    /// Attach to a folder's session.
    ConnectFolder {
        /// Folder path as listed by the server.
        path: String,
    },
    /// End the session deliberately; the next attach starts fresh.
    CloseSession,
}

impl ClientCommand {
    /// Parse a text frame; malformed input yields `None`.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// Serialize a frame or command to its text form.
///
/// # Errors
///
/// Returns `AppError::Protocol` if serialization fails.
pub fn encode<T: Serialize>(message: &T) -> crate::Result<String> {
    Ok(serde_json::to_string(message)?)
}
