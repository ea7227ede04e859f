//! Tokio runner for [`ClientTransport`].
//!
//! One task owns the state machine. Sockets, timers, and user commands all
//! feed it through a single input channel, and it executes the returned
//! [`Effect`]s: sockets are opened with `tokio-tungstenite`, timers are
//! sleep tasks aborted on cancel, and notifications go to the event
//! receiver returned by [`spawn_transport`].
//!
//! Every socket gets a connection id. Events from a socket that has since
//! been replaced are dropped before they reach the state machine.

use std::collections::HashMap;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, info_span, warn, Instrument};

use super::client::{ClientEvent, ClientTransport, Effect, Input, TimerKind, TransportConfig};
use super::protocol::{encode, ClientCommand};
use crate::{AppError, Result};

const INPUT_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;
const OUTGOING_CAPACITY: usize = 32;

enum DriverInput {
    Machine(Input),
    Socket { connection: u64, input: Input },
}

struct Connection {
    id: u64,
    outgoing: mpsc::Sender<String>,
    task: JoinHandle<()>,
}

/// Cloneable control surface for a running transport.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    input_tx: mpsc::Sender<DriverInput>,
}

impl TransportHandle {
    async fn send(&self, input: Input) -> Result<()> {
        self.input_tx
            .send(DriverInput::Machine(input))
            .await
            .map_err(|_| AppError::Transport("transport is closed".into()))
    }

    /// Submit a prompt.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` once the transport is closed.
    pub async fn prompt(&self, text: impl Into<String>) -> Result<()> {
        self.send(Input::Command(ClientCommand::Prompt { text: text.into() }))
            .await
    }

    /// Interrupt the current turn.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` once the transport is closed.
    pub async fn abort(&self) -> Result<()> {
        self.send(Input::Command(ClientCommand::Abort)).await
    }

    /// Ask for the folder list.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` once the transport is closed.
    pub async fn list_folders(&self) -> Result<()> {
        self.send(Input::Command(ClientCommand::ListFolders)).await
    }

    /// Attach to a folder.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` once the transport is closed.
    pub async fn connect_folder(&self, path: impl Into<String>) -> Result<()> {
        self.send(Input::Command(ClientCommand::ConnectFolder { path: path.into() }))
            .await
    }

    /// End the current session deliberately.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` once the transport is closed.
    pub async fn close_session(&self) -> Result<()> {
        self.send(Input::Command(ClientCommand::CloseSession)).await
    }

    /// Signal that the application returned to the foreground.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` once the transport is closed.
    pub async fn foreground(&self) -> Result<()> {
        self.send(Input::Foreground).await
    }

    /// Close the transport for good. The event receiver ends afterwards.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the transport is already closed.
    pub async fn close(&self) -> Result<()> {
        self.send(Input::Close).await
    }
}

/// Start a transport for `config` and begin connecting.
///
/// Must be called from within a tokio runtime.
#[must_use]
pub fn spawn_transport(
    config: TransportConfig,
) -> (TransportHandle, mpsc::Receiver<ClientEvent>, JoinHandle<()>) {
    let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
    let span = info_span!("client_transport", endpoint = %config.endpoint);

    let driver = Driver {
        machine: ClientTransport::new(config),
        input_tx: input_tx.clone(),
        event_tx: Some(event_tx),
        connection: None,
        next_connection: 0,
        timers: HashMap::new(),
    };
    let task = tokio::spawn(driver.run(input_rx).instrument(span));
    (TransportHandle { input_tx }, event_rx, task)
}

struct Driver {
    machine: ClientTransport,
    input_tx: mpsc::Sender<DriverInput>,
    event_tx: Option<mpsc::Sender<ClientEvent>>,
    connection: Option<Connection>,
    next_connection: u64,
    timers: HashMap<TimerKind, JoinHandle<()>>,
}

impl Driver {
    async fn run(mut self, mut input_rx: mpsc::Receiver<DriverInput>) {
        self.apply(Input::Start).await;

        while let Some(input) = input_rx.recv().await {
            let input = match input {
                DriverInput::Machine(input) => input,
                DriverInput::Socket { connection, input } => {
                    if self.connection.as_ref().map(|c| c.id) != Some(connection) {
                        debug!(connection, "dropping event from superseded socket");
                        continue;
                    }
                    input
                }
            };
            self.apply(input).await;
            if self.machine.is_closed() {
                break;
            }
        }

        self.teardown();
        info!("client transport stopped");
    }

    async fn apply(&mut self, input: Input) {
        for effect in self.machine.handle(input) {
            self.execute(effect).await;
        }
    }

    async fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::Connect { endpoint } => self.open_socket(endpoint),
            Effect::Disconnect => self.drop_socket(),
            Effect::Send(command) => {
                let Some(connection) = &self.connection else {
                    warn!("send requested without a socket");
                    return;
                };
                match encode(&command) {
                    Ok(text) => {
                        if connection.outgoing.send(text).await.is_err() {
                            debug!("socket writer gone, command dropped");
                        }
                    }
                    Err(err) => warn!(%err, "failed to encode command"),
                }
            }
            Effect::StartTimer { token, delay } => {
                let input_tx = self.input_tx.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = input_tx.send(DriverInput::Machine(Input::Timer(token))).await;
                });
                if let Some(previous) = self.timers.insert(token.kind, task) {
                    previous.abort();
                }
            }
            Effect::CancelTimer { kind } => {
                if let Some(timer) = self.timers.remove(&kind) {
                    timer.abort();
                }
            }
            Effect::Notify(event) => {
                if let Some(event_tx) = &self.event_tx {
                    let _ = event_tx.send(event).await;
                }
            }
        }
    }

    fn open_socket(&mut self, endpoint: String) {
        self.drop_socket();
        self.next_connection += 1;
        let id = self.next_connection;
        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let input_tx = self.input_tx.clone();
        let task = tokio::spawn(
            run_socket(id, endpoint, input_tx, outgoing_rx)
                .instrument(info_span!("socket", connection = id)),
        );
        self.connection = Some(Connection { id, outgoing, task });
    }

    fn drop_socket(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.task.abort();
        }
    }

    fn teardown(&mut self) {
        self.drop_socket();
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        // Dropping the sender ends the caller's event stream.
        self.event_tx = None;
    }
}

async fn run_socket(
    id: u64,
    endpoint: String,
    input_tx: mpsc::Sender<DriverInput>,
    mut outgoing_rx: mpsc::Receiver<String>,
) {
    let report = |input: Input| {
        let input_tx = input_tx.clone();
        async move {
            let _ = input_tx
                .send(DriverInput::Socket {
                    connection: id,
                    input,
                })
                .await;
        }
    };

    let stream = match tokio_tungstenite::connect_async(endpoint.as_str()).await {
        Ok((stream, _)) => stream,
        Err(err) => {
            debug!(%err, "connect failed");
            report(Input::Closed {
                reason: Some(err.to_string()),
            })
            .await;
            return;
        }
    };
    report(Input::Opened).await;

    let (mut sink, mut reader) = stream.split();
    let reason = loop {
        tokio::select! {
            outgoing = outgoing_rx.recv() => {
                let Some(text) = outgoing else {
                    let _ = sink.close().await;
                    return;
                };
                if let Err(err) = sink.send(Message::Text(text)).await {
                    break Some(err.to_string());
                }
            }
            incoming = reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => report(Input::Frame(text)).await,
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(_)) => {}
                Some(Err(err)) => break Some(err.to_string()),
            },
        }
    };
    report(Input::Closed { reason }).await;
}
