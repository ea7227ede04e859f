//! Agent process stdio plumbing.
//!
//! Each live session owns one agent process speaking newline-delimited JSON
//! on stdio. The supervisor never interprets agent output beyond two facts:
//! that output arrived (for idle decisions) and whether a line closes the
//! current turn.
//!
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based framing with
//!   a line-length cap.
//! - `reader`: parses stdout lines into [`AgentEvent`]s.
//! - `writer`: serializes outbound messages onto stdin.
//! - `spawner`: launches the agent CLI and watches for its exit.

pub mod codec;
pub mod reader;
pub mod spawner;
pub mod writer;

use serde_json::Value;

/// Events produced by an agent process.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// One line of agent output, forwarded verbatim to clients.
    Output {
        /// Session the output belongs to.
        session_id: String,
        /// Parsed JSON line.
        event: Value,
        /// Whether this line is the result that closes the current turn.
        ends_turn: bool,
    },
    /// The agent process exited.
    Exited {
        /// Session whose process exited.
        session_id: String,
        /// Pid of the exited process.
        pid: u32,
        /// Exit code for a normal exit.
        code: Option<i32>,
        /// Terminating signal, if killed by one.
        signal: Option<i32>,
    },
}

/// Build the stdin message that submits `text` as a user prompt.
#[must_use]
pub fn user_prompt_message(text: &str) -> Value {
    serde_json::json!({
        "type": "user",
        "message": { "role": "user", "content": text },
    })
}
