//! Client connection state machine.
//!
//! [`ClientTransport`] keeps one logical session alive across any number of
//! physical reconnects. It performs no I/O: every input goes through
//! [`ClientTransport::handle`], which returns the [`Effect`]s the caller must
//! carry out (open a socket, send a command, start a timer, surface an
//! event). The tokio runner lives in [`super::driver`].
//!
//! Timers are identified by `(kind, generation)`. Starting or cancelling a
//! timer bumps its generation, so a firing that was already in flight when
//! the timer was superseded is recognised as stale and ignored.

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use super::protocol::{ClientCommand, InboundFrame};

/// Surfaced when a prompt is not acknowledged in time.
pub const PROMPT_ACK_TIMEOUT_MESSAGE: &str =
    "no response from server, prompt may not have been received";
/// Surfaced when a command is issued while the socket is not open.
pub const NOT_CONNECTED_MESSAGE: &str = "not connected to server";
/// Reason attached to the turn end synthesized from a process exit.
pub const PROCESS_EXITED_MESSAGE: &str = "process exited";

/// Timing and endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// WebSocket URL; every reconnect uses the same one.
    pub endpoint: String,
    /// First reconnect delay.
    pub backoff_base: Duration,
    /// Reconnect delay ceiling.
    pub backoff_max: Duration,
    /// How long to wait for `promptReceived`.
    pub prompt_ack_timeout: Duration,
}

impl TransportConfig {
    /// Defaults for `endpoint`: 1 s base, 30 s cap, 10 s prompt ack.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            prompt_ack_timeout: Duration::from_secs(10),
        }
    }

    /// Reconnect delay for the `attempt`-th consecutive failure (0-based).
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.backoff_max)
    }
}

/// Connection state as seen by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket; a reconnect may be scheduled.
    Disconnected,
    /// Socket opening or open, waiting for the server's greeting.
    Connecting,
    /// Open with no folder selected.
    Lobby,
    /// Bound to a session.
    Connected {
        /// Logical session id.
        session_id: String,
        /// Whether the agent resumed prior context.
        resumed: bool,
    },
}

/// Timer families run by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Backoff before the next connection attempt.
    Reconnect,
    /// Deadline for `promptReceived`.
    PromptAck,
}

/// Identifies one scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken {
    /// Timer family.
    pub kind: TimerKind,
    /// Generation at scheduling time.
    pub generation: u64,
}

/// Everything that can happen to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Begin connecting.
    Start,
    /// The socket opened.
    Opened,
    /// The socket closed or failed.
    Closed {
        /// Error text, if the close was abnormal.
        reason: Option<String>,
    },
    /// A text frame arrived.
    Frame(String),
    /// The application came back to the foreground.
    Foreground,
    /// A timer fired.
    Timer(TimerToken),
    /// The user issued a command.
    Command(ClientCommand),
    /// The user closed the transport for good.
    Close,
}

/// What the user of the transport sees.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// Folder list reply.
    FolderList(Vec<String>),
    /// The server acknowledged the last prompt.
    PromptReceived,
    /// Agent output.
    AgentEvent {
        /// Raw agent event.
        event: Value,
        /// Whether it is part of a history replay.
        replayed: bool,
    },
    /// A history replay begins.
    HistoryStart,
    /// A history replay ends.
    HistoryEnd,
    /// The session's agent process exited.
    ProcessExited {
        /// Exit code.
        code: Option<i32>,
        /// Terminating signal.
        signal: Option<i32>,
    },
    /// The outstanding turn is over.
    TurnFinished {
        /// Why, when the turn did not end with a result.
        reason: Option<String>,
    },
    /// Something went wrong; shown to the user.
    Error(String),
}

/// Side effects requested by [`ClientTransport::handle`].
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Open a socket to `endpoint`, replacing any previous one.
    Connect {
        /// WebSocket URL.
        endpoint: String,
    },
    /// Close the current socket.
    Disconnect,
    /// Send a command over the open socket.
    Send(ClientCommand),
    /// Fire `Input::Timer(token)` after `delay`, replacing any timer of the
    /// same kind.
    StartTimer {
        /// Token to deliver.
        token: TimerToken,
        /// Delay.
        delay: Duration,
    },
    /// Stop the pending timer of `kind`, if any.
    CancelTimer {
        /// Timer family.
        kind: TimerKind,
    },
    /// Surface an event to the user.
    Notify(ClientEvent),
}

/// Sans-IO reconnecting client.
#[derive(Debug)]
pub struct ClientTransport {
    config: TransportConfig,
    state: ConnectionState,
    closed: bool,
    open: bool,
    attempt: u32,
    has_opened: bool,
    reattach_on_lobby: bool,
    awaiting_attach: bool,
    selected_folder: Option<String>,
    replaying: bool,
    reconnect_generation: u64,
    reconnect_pending: bool,
    prompt_generation: u64,
    prompt_pending: bool,
}

impl ClientTransport {
    /// A transport that has not started connecting yet.
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            closed: false,
            open: false,
            attempt: 0,
            has_opened: false,
            reattach_on_lobby: false,
            awaiting_attach: false,
            selected_folder: None,
            replaying: false,
            reconnect_generation: 0,
            reconnect_pending: false,
            prompt_generation: 0,
            prompt_pending: false,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Whether [`Input::Close`] has been handled.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Folder re-requested after a reconnect, if any.
    #[must_use]
    pub fn selected_folder(&self) -> Option<&str> {
        self.selected_folder.as_deref()
    }

    /// Consecutive failed attempts since the last successful open.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Apply one input and return the effects to perform, in order.
    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        if self.closed {
            return Vec::new();
        }
        let mut effects = Vec::new();
        match input {
            Input::Start => {
                if self.state == ConnectionState::Disconnected && !self.reconnect_pending {
                    self.connect(&mut effects);
                }
            }
            Input::Opened => self.on_opened(),
            Input::Closed { reason } => self.on_closed(reason, &mut effects),
            Input::Frame(text) => self.on_frame(&text, &mut effects),
            Input::Foreground => self.on_foreground(&mut effects),
            Input::Timer(token) => self.on_timer(token, &mut effects),
            Input::Command(command) => self.on_command(command, &mut effects),
            Input::Close => self.on_close(&mut effects),
        }
        effects
    }

    fn set_state(&mut self, state: ConnectionState, effects: &mut Vec<Effect>) {
        if self.state != state {
            self.state = state.clone();
            effects.push(Effect::Notify(ClientEvent::StateChanged(state)));
        }
    }

    fn connect(&mut self, effects: &mut Vec<Effect>) {
        self.set_state(ConnectionState::Connecting, effects);
        effects.push(Effect::Connect {
            endpoint: self.config.endpoint.clone(),
        });
    }

    fn on_opened(&mut self) {
        if self.state != ConnectionState::Connecting || self.open {
            return;
        }
        self.open = true;
        self.attempt = 0;
        if self.has_opened {
            self.reattach_on_lobby = true;
        }
        self.has_opened = true;
    }

    fn on_closed(&mut self, reason: Option<String>, effects: &mut Vec<Effect>) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        debug!(?reason, attempt = self.attempt, "connection lost");
        self.open = false;
        self.replaying = false;
        self.awaiting_attach = false;
        self.reattach_on_lobby = false;
        self.set_state(ConnectionState::Disconnected, effects);

        let delay = self.config.backoff_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.reconnect_generation += 1;
        self.reconnect_pending = true;
        effects.push(Effect::StartTimer {
            token: TimerToken {
                kind: TimerKind::Reconnect,
                generation: self.reconnect_generation,
            },
            delay,
        });
    }

    fn on_foreground(&mut self, effects: &mut Vec<Effect>) {
        if self.state != ConnectionState::Disconnected {
            return;
        }
        if self.reconnect_pending {
            self.reconnect_pending = false;
            self.reconnect_generation += 1;
            effects.push(Effect::CancelTimer {
                kind: TimerKind::Reconnect,
            });
        }
        self.attempt = 0;
        self.connect(effects);
    }

    fn on_timer(&mut self, token: TimerToken, effects: &mut Vec<Effect>) {
        match token.kind {
            TimerKind::Reconnect => {
                if !self.reconnect_pending || token.generation != self.reconnect_generation {
                    return;
                }
                self.reconnect_pending = false;
                if self.state == ConnectionState::Disconnected {
                    self.connect(effects);
                }
            }
            TimerKind::PromptAck => {
                if !self.prompt_pending || token.generation != self.prompt_generation {
                    return;
                }
                self.prompt_pending = false;
                effects.push(Effect::Notify(ClientEvent::Error(
                    PROMPT_ACK_TIMEOUT_MESSAGE.to_owned(),
                )));
            }
        }
    }

    fn on_command(&mut self, command: ClientCommand, effects: &mut Vec<Effect>) {
        if !self.open {
            effects.push(Effect::Notify(ClientEvent::Error(
                NOT_CONNECTED_MESSAGE.to_owned(),
            )));
            return;
        }

        match &command {
            ClientCommand::Prompt { .. } => {
                self.prompt_generation += 1;
                self.prompt_pending = true;
                effects.push(Effect::StartTimer {
                    token: TimerToken {
                        kind: TimerKind::PromptAck,
                        generation: self.prompt_generation,
                    },
                    delay: self.config.prompt_ack_timeout,
                });
            }
            ClientCommand::ConnectFolder { path } => {
                self.selected_folder = Some(path.clone());
                self.awaiting_attach = true;
            }
            ClientCommand::CloseSession => {
                self.selected_folder = None;
                self.awaiting_attach = false;
            }
            ClientCommand::Abort | ClientCommand::ListFolders => {}
        }
        effects.push(Effect::Send(command));
    }

    fn on_close(&mut self, effects: &mut Vec<Effect>) {
        self.closed = true;
        self.open = false;
        self.reconnect_pending = false;
        self.prompt_pending = false;
        self.reconnect_generation += 1;
        self.prompt_generation += 1;
        effects.push(Effect::CancelTimer {
            kind: TimerKind::Reconnect,
        });
        effects.push(Effect::CancelTimer {
            kind: TimerKind::PromptAck,
        });
        effects.push(Effect::Disconnect);
        self.set_state(ConnectionState::Disconnected, effects);
    }

    fn clear_prompt_timer(&mut self, effects: &mut Vec<Effect>) -> bool {
        if !self.prompt_pending {
            return false;
        }
        self.prompt_pending = false;
        self.prompt_generation += 1;
        effects.push(Effect::CancelTimer {
            kind: TimerKind::PromptAck,
        });
        true
    }

    fn on_frame(&mut self, text: &str, effects: &mut Vec<Effect>) {
        if !self.open {
            return;
        }
        let Some(frame) = InboundFrame::parse(text) else {
            return;
        };

        match frame {
            InboundFrame::LobbyConnected => {
                self.set_state(ConnectionState::Lobby, effects);
                if std::mem::take(&mut self.reattach_on_lobby) {
                    if let Some(path) = self.selected_folder.clone() {
                        debug!(path, "re-attaching after reconnect");
                        self.awaiting_attach = true;
                        effects.push(Effect::Send(ClientCommand::ConnectFolder { path }));
                    }
                }
            }
            InboundFrame::Connected {
                session_id,
                resumed,
            } => {
                self.awaiting_attach = false;
                self.set_state(
                    ConnectionState::Connected {
                        session_id,
                        resumed,
                    },
                    effects,
                );
            }
            InboundFrame::FolderList { folders } => {
                effects.push(Effect::Notify(ClientEvent::FolderList(folders)));
            }
            InboundFrame::PromptReceived => {
                self.clear_prompt_timer(effects);
                effects.push(Effect::Notify(ClientEvent::PromptReceived));
            }
            InboundFrame::Error { message } => {
                effects.push(Effect::Notify(ClientEvent::Error(message)));
                // A rejected attach leaves the server with no binding.
                if std::mem::take(&mut self.awaiting_attach) {
                    self.selected_folder = None;
                    self.set_state(ConnectionState::Lobby, effects);
                }
            }
            InboundFrame::ProcessExit { code, signal } => {
                self.clear_prompt_timer(effects);
                self.replaying = false;
                effects.push(Effect::Notify(ClientEvent::ProcessExited { code, signal }));
                effects.push(Effect::Notify(ClientEvent::TurnFinished {
                    reason: Some(PROCESS_EXITED_MESSAGE.to_owned()),
                }));
            }
            InboundFrame::HistoryStart => {
                self.replaying = true;
                effects.push(Effect::Notify(ClientEvent::HistoryStart));
            }
            InboundFrame::HistoryEnd => {
                self.replaying = false;
                effects.push(Effect::Notify(ClientEvent::HistoryEnd));
            }
            InboundFrame::AgentEvent { event } => {
                effects.push(Effect::Notify(ClientEvent::AgentEvent {
                    event,
                    replayed: self.replaying,
                }));
            }
        }
    }
}
