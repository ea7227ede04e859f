//! One client WebSocket.
//!
//! A connection starts in the lobby. `connectFolder` binds it to the
//! folder's session through the supervisor; from then on agent output is
//! forwarded as `agentEvent` frames until the process exits, the client
//! switches folders, or the socket closes. Re-attaching to a running
//! process first replays the retained backlog between `historyStart` and
//! `historyEnd`.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{list_folders, resolve_folder, AppState};
use crate::events::with_correlation;
use crate::orchestrator::supervisor::SessionOutput;
use crate::transport::protocol::{encode, ClientCommand, InboundFrame};

/// Reply to `connectFolder` when the folder cannot be used.
pub const FOLDER_INVALID_MESSAGE: &str = "folder no longer valid";
const NO_SESSION_MESSAGE: &str = "no folder selected";
const BAD_COMMAND_MESSAGE: &str = "unrecognized command";

type Sink = SplitSink<WebSocket, Message>;

struct Binding {
    folder: PathBuf,
    session_id: String,
    output: broadcast::Receiver<SessionOutput>,
}

/// Serve one upgraded socket until it closes.
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4().to_string();
    let span = info_span!("client", connection_id = %connection_id);
    with_correlation(connection_id, run(socket, state))
        .instrument(span)
        .await;
}

async fn run(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let mut binding: Option<Binding> = None;
    info!("client connected");

    if send_frame(&mut sink, &InboundFrame::LobbyConnected).await {
        loop {
            tokio::select! {
                () = state.shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let keep = match ClientCommand::parse(text.as_str()) {
                            Some(command) => {
                                handle_command(command, &state, &mut binding, &mut sink).await
                            }
                            None => {
                                send_frame(&mut sink, &error_frame(BAD_COMMAND_MESSAGE)).await
                            }
                        };
                        if !keep {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(%err, "socket error");
                        break;
                    }
                },
                output = next_output(&mut binding) => {
                    if !forward_output(output, &mut binding, &mut sink).await {
                        break;
                    }
                }
            }
        }
    }

    if let Some(bound) = binding.take() {
        state
            .supervisor
            .detach(&bound.folder, &bound.session_id)
            .await;
    }
    info!("client disconnected");
}

async fn next_output(
    binding: &mut Option<Binding>,
) -> Result<SessionOutput, broadcast::error::RecvError> {
    match binding {
        Some(bound) => bound.output.recv().await,
        None => std::future::pending().await,
    }
}

async fn forward_output(
    output: Result<SessionOutput, broadcast::error::RecvError>,
    binding: &mut Option<Binding>,
    sink: &mut Sink,
) -> bool {
    match output {
        Ok(SessionOutput::Event(event)) => {
            send_frame(sink, &InboundFrame::AgentEvent { event }).await
        }
        Ok(SessionOutput::Exited { code, signal }) => {
            *binding = None;
            send_frame(sink, &InboundFrame::ProcessExit { code, signal }).await
                && send_frame(sink, &InboundFrame::LobbyConnected).await
        }
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "client fell behind, agent events dropped");
            true
        }
        Err(broadcast::error::RecvError::Closed) => {
            *binding = None;
            send_frame(sink, &InboundFrame::LobbyConnected).await
        }
    }
}

async fn handle_command(
    command: ClientCommand,
    state: &AppState,
    binding: &mut Option<Binding>,
    sink: &mut Sink,
) -> bool {
    let supervisor = &state.supervisor;
    match command {
        ClientCommand::ListFolders => {
            let folders = list_folders(&state.config.projects_root);
            send_frame(sink, &InboundFrame::FolderList { folders }).await
        }
        ClientCommand::ConnectFolder { path } => {
            // Any connect request leaves the previous folder, even a
            // rejected one; the client falls back to the lobby on error.
            let left_binding = match binding.take() {
                Some(previous) => {
                    supervisor
                        .detach(&previous.folder, &previous.session_id)
                        .await;
                    true
                }
                None => false,
            };

            let attached = match resolve_folder(&state.config.projects_root, &path) {
                Some(folder) => match supervisor.attach(&folder).await {
                    Ok(attachment) => Ok((folder, attachment)),
                    Err(err) => {
                        warn!(%err, folder = %folder.display(), "attach failed");
                        Err(err.to_string())
                    }
                },
                None => {
                    debug!(path, "rejected folder");
                    Err(FOLDER_INVALID_MESSAGE.to_owned())
                }
            };
            let (folder, attachment) = match attached {
                Ok(attached) => attached,
                Err(message) => {
                    if !send_frame(sink, &error_frame(&message)).await {
                        return false;
                    }
                    if left_binding {
                        return send_frame(sink, &InboundFrame::LobbyConnected).await;
                    }
                    return true;
                }
            };

            *binding = Some(Binding {
                folder,
                session_id: attachment.session_id.clone(),
                output: attachment.output,
            });
            let connected = InboundFrame::Connected {
                session_id: attachment.session_id,
                resumed: attachment.resumed,
            };
            if !send_frame(sink, &connected).await {
                return false;
            }
            if attachment.is_reconnect && !attachment.backlog.is_empty() {
                return replay(sink, attachment.backlog).await;
            }
            true
        }
        ClientCommand::Prompt { text } => {
            let Some(bound) = binding.as_ref() else {
                return send_frame(sink, &error_frame(NO_SESSION_MESSAGE)).await;
            };
            match supervisor
                .send_prompt(&bound.folder, &bound.session_id, &text)
                .await
            {
                Ok(()) => send_frame(sink, &InboundFrame::PromptReceived).await,
                Err(err) => send_frame(sink, &error_frame(&err.to_string())).await,
            }
        }
        ClientCommand::Abort => {
            let Some(bound) = binding.as_ref() else {
                return send_frame(sink, &error_frame(NO_SESSION_MESSAGE)).await;
            };
            match supervisor.abort(&bound.folder, &bound.session_id).await {
                Ok(()) => true,
                Err(err) => send_frame(sink, &error_frame(&err.to_string())).await,
            }
        }
        ClientCommand::CloseSession => {
            let Some(bound) = binding.take() else {
                return send_frame(sink, &error_frame(NO_SESSION_MESSAGE)).await;
            };
            if let Err(err) = supervisor.close(&bound.folder, &bound.session_id).await {
                debug!(%err, "session already gone at close");
            }
            send_frame(sink, &InboundFrame::LobbyConnected).await
        }
    }
}

async fn replay(sink: &mut Sink, backlog: Vec<serde_json::Value>) -> bool {
    if !send_frame(sink, &InboundFrame::HistoryStart).await {
        return false;
    }
    for event in backlog {
        if !send_frame(sink, &InboundFrame::AgentEvent { event }).await {
            return false;
        }
    }
    send_frame(sink, &InboundFrame::HistoryEnd).await
}

fn error_frame(message: &str) -> InboundFrame {
    InboundFrame::Error {
        message: message.to_owned(),
    }
}

/// Send one frame; `false` means the socket is gone.
async fn send_frame(sink: &mut Sink, frame: &InboundFrame) -> bool {
    let text = match encode(frame) {
        Ok(text) => text,
        Err(err) => {
            warn!(%err, "failed to encode frame");
            return true;
        }
    };
    sink.send(Message::Text(text.into())).await.is_ok()
}
