//! Agent stdout reader task.
//!
//! Reads newline-delimited JSON from an agent's stdout through
//! [`FramedRead`] + [`AgentCodec`] and forwards every well-formed line as an
//! [`AgentEvent::Output`]. Malformed lines are logged and skipped; they never
//! stop the reader. Process exit is reported by the exit monitor, not here.

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::codec::AgentCodec;
use crate::agent::AgentEvent;
use crate::{AppError, Result};

/// Output `type` that closes a turn.
const RESULT_TYPE: &str = "result";

/// Parse one stdout line.
///
/// Returns `Ok(None)` for blank lines.
///
/// # Errors
///
/// Returns `AppError::Protocol` if the line is not a JSON object.
pub fn parse_output_line(line: &str) -> Result<Option<(Value, bool)>> {
    if line.trim().is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(line)
        .map_err(|e| AppError::Protocol(format!("malformed agent output: {e}")))?;
    if !value.is_object() {
        return Err(AppError::Protocol(
            "agent output line is not a json object".into(),
        ));
    }

    let ends_turn = value.get("type").and_then(Value::as_str) == Some(RESULT_TYPE);
    Ok(Some((value, ends_turn)))
}

/// Reader task: forwards agent stdout lines until EOF or cancellation.
///
/// # Errors
///
/// Always returns `Ok(())`; stream errors end the task after being logged.
pub async fn run_reader<R>(
    session_id: String,
    stdout: R,
    event_tx: mpsc::Sender<AgentEvent>,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, AgentCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "agent reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(session_id, "agent reader: EOF");
                        break;
                    }
                    Some(Err(AppError::Protocol(ref msg))) => {
                        warn!(
                            session_id,
                            error = msg.as_str(),
                            "agent reader: framing error, skipping"
                        );
                    }
                    Some(Err(e)) => {
                        warn!(session_id, error = %e, "agent reader: IO error, stopping");
                        break;
                    }
                    Some(Ok(line)) => match parse_output_line(&line) {
                        Ok(Some((event, ends_turn))) => {
                            let event = AgentEvent::Output {
                                session_id: session_id.clone(),
                                event,
                                ends_turn,
                            };
                            if event_tx.send(event).await.is_err() {
                                debug!(session_id, "agent reader: event channel closed, stopping");
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(session_id, error = %e, "agent reader: skipping line");
                        }
                    },
                }
            }
        }
    }

    Ok(())
}
