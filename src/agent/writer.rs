//! Agent stdin writer task.
//!
//! Receives outbound JSON messages from an [`mpsc`] channel, serializes each
//! to a single line, and writes it to the agent's stdin.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Writer task: runs until cancellation or until every sender is dropped.
///
/// # Errors
///
/// - `AppError::Process("failed to serialise outbound message: …")`
/// - `AppError::Process("write failed: …")` when the agent's stdin is closed.
pub async fn run_writer<W>(
    session_id: String,
    stdin: W,
    mut msg_rx: mpsc::Receiver<serde_json::Value>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut stdin = stdin;

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "agent writer: cancellation received, stopping");
                break;
            }

            msg = msg_rx.recv() => {
                let Some(value) = msg else {
                    debug!(session_id, "agent writer: message channel closed, stopping");
                    break;
                };

                let mut bytes = serde_json::to_vec(&value).map_err(|e| {
                    AppError::Process(format!("failed to serialise outbound message: {e}"))
                })?;
                bytes.push(b'\n');

                stdin.write_all(&bytes).await.map_err(|e| {
                    warn!(session_id, error = %e, "agent writer: write to stdin failed");
                    AppError::Process(format!("write failed: {e}"))
                })?;
                stdin.flush().await.map_err(|e| {
                    AppError::Process(format!("write failed: {e}"))
                })?;
            }
        }
    }

    Ok(())
}
