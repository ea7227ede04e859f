//! Live-session registry.
//!
//! The supervisor owns every running agent process, keyed by folder, so a
//! folder is served by at most one process no matter how many clients
//! attach to it. It wires the pieces together: the resolver picks the
//! session identity, the spawner launches the agent, agent output updates
//! the activity the idle guards read, and the idle monitor started on the
//! last detach decides when the process is torn down.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::agent::reader::run_reader;
use crate::agent::spawner::{monitor_exit, spawn_agent, AgentProcess, SpawnConfig};
use crate::agent::writer::run_writer;
use crate::agent::{user_prompt_message, AgentEvent};
use crate::config::GlobalConfig;
use crate::events::{EventBus, LifecycleEvent};
use crate::models::session::{Session, SessionActivity};
use crate::persistence::debounce::DebouncedRecordWriter;
use crate::persistence::history::SessionHistory;
use crate::{AppError, Result};

use super::idle::{default_guards, monotonic_now, IdlePolicy};
use super::idle_monitor::{GuardList, IdleEvent, IdleMonitor, IdleMonitorHandle};
use super::process_tree::{
    kill_tree, schedule_force_kill, terminate_tree, ProcessSignal, ProcessTable,
};
use super::resolver::{resolve, Resolution};

const AGENT_EVENT_CAPACITY: usize = 256;
const IDLE_EVENT_CAPACITY: usize = 32;
const AGENT_INPUT_CAPACITY: usize = 32;
const OUTPUT_CAPACITY: usize = 256;

/// Supervisor settings derived from [`GlobalConfig`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How to launch the agent.
    pub spawn: SpawnConfig,
    /// Idle thresholds.
    pub policy: IdlePolicy,
    /// Silence after which a running turn no longer keeps the process alive.
    pub stale_output: Duration,
    /// Delay between terminate and forced kill.
    pub kill_escalation: Duration,
    /// Agent events kept per session for re-attaching clients.
    pub history_backlog: usize,
}

impl SupervisorConfig {
    /// Extract supervisor settings from the global configuration.
    #[must_use]
    pub fn from_global(config: &GlobalConfig) -> Self {
        Self {
            spawn: SpawnConfig {
                agent_cli: config.agent_cli.clone(),
                agent_cli_args: config.agent_cli_args.clone(),
            },
            policy: config.idle.policy(),
            stale_output: config.idle.stale_output(),
            kill_escalation: config.idle.kill_escalation(),
            history_backlog: config.history_backlog,
        }
    }
}

/// Output fanned out to every client attached to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutput {
    /// One agent output line.
    Event(Value),
    /// The agent process is gone; no further output follows.
    Exited {
        /// Exit code for a normal exit.
        code: Option<i32>,
        /// Terminating signal.
        signal: Option<i32>,
    },
}

/// A client's view of the session it attached to.
#[derive(Debug)]
pub struct Attachment {
    /// Session the client is bound to.
    pub session_id: String,
    /// Whether the agent resumed prior context.
    pub resumed: bool,
    /// Whether the client joined an already running process.
    pub is_reconnect: bool,
    /// Recent agent output to replay, oldest first.
    pub backlog: Vec<Value>,
    /// Live output from here on.
    pub output: broadcast::Receiver<SessionOutput>,
}

struct LiveSession {
    session: Session,
    backlog: VecDeque<Value>,
    output: broadcast::Sender<SessionOutput>,
    input: mpsc::Sender<Value>,
    activity: watch::Sender<SessionActivity>,
    clients: usize,
    idle: Option<IdleMonitorHandle>,
    io_cancel: CancellationToken,
}

impl LiveSession {
    fn publish_activity(&self) {
        self.activity.send_replace(self.session.activity());
    }

    fn attachment(&self, resolution: Resolution) -> Attachment {
        Attachment {
            session_id: resolution.session_id,
            resumed: resolution.resumable,
            is_reconnect: resolution.is_reconnect,
            backlog: self.backlog.iter().cloned().collect(),
            output: self.output.subscribe(),
        }
    }
}

/// A killed agent whose exit has not been observed yet.
struct Draining {
    session_id: String,
    pid: u32,
    exited: watch::Sender<bool>,
}

/// Owner of all live agent processes.
pub struct SessionSupervisor {
    config: SupervisorConfig,
    sessions: Mutex<HashMap<PathBuf, LiveSession>>,
    draining: std::sync::Mutex<HashMap<PathBuf, Draining>>,
    history: SessionHistory,
    records: DebouncedRecordWriter,
    table: Arc<dyn ProcessTable>,
    bus: Arc<EventBus>,
    guards: GuardList,
    agent_tx: mpsc::Sender<AgentEvent>,
    idle_tx: mpsc::Sender<IdleEvent>,
    cancel: CancellationToken,
}

impl SessionSupervisor {
    /// Create the supervisor and spawn its agent-event and idle consumers.
    ///
    /// Both consumers stop when `cancel` fires. Must be called from within a
    /// tokio runtime.
    #[must_use]
    pub fn start(
        config: SupervisorConfig,
        history: SessionHistory,
        records: DebouncedRecordWriter,
        table: Arc<dyn ProcessTable>,
        bus: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (agent_tx, agent_rx) = mpsc::channel(AGENT_EVENT_CAPACITY);
        let (idle_tx, idle_rx) = mpsc::channel(IDLE_EVENT_CAPACITY);
        let guards: GuardList = Arc::new(default_guards(config.stale_output));

        let supervisor = Arc::new(Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            draining: std::sync::Mutex::new(HashMap::new()),
            history,
            records,
            table,
            bus,
            guards,
            agent_tx,
            idle_tx,
            cancel: cancel.clone(),
        });

        drop(spawn_agent_event_consumer(
            agent_rx,
            Arc::downgrade(&supervisor),
            cancel.clone(),
        ));
        drop(spawn_idle_consumer(
            idle_rx,
            Arc::downgrade(&supervisor),
            cancel,
        ));
        supervisor
    }

    /// Attach a client to `folder`, spawning the agent if none is running.
    ///
    /// A previous agent for `folder` that was killed but has not exited yet
    /// is force-killed and awaited first, so the folder never has two.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the agent cannot be spawned.
    pub async fn attach(&self, folder: &Path) -> Result<Attachment> {
        self.await_draining(folder).await;
        let mut sessions = self.sessions.lock().await;

        let resolution = {
            let existing = sessions.get(folder).map(|live| &live.session);
            let (recoverable, handoff) = if existing.is_some() {
                (None, false)
            } else {
                let recoverable = self.history.latest_recoverable(folder);
                let handoff = self.history.has_close_handoff(folder, recoverable.as_ref());
                (recoverable, handoff)
            };
            resolve(existing, recoverable.as_ref(), handoff, Session::generate_id)
        };

        if resolution.is_reconnect {
            if let Some(live) = sessions.get_mut(folder) {
                live.clients += 1;
                if live.idle.take().is_some() {
                    debug!(
                        session_id = live.session.id,
                        "client returned, idle monitor cancelled"
                    );
                }
                info!(
                    session_id = live.session.id,
                    clients = live.clients,
                    "client re-attached to live session"
                );
                return Ok(live.attachment(resolution));
            }
        }

        let live = self.spawn_session(folder, &resolution)?;
        let attachment = live.attachment(resolution);
        sessions.insert(folder.to_path_buf(), live);
        self.persist_locked(&sessions);
        Ok(attachment)
    }

    /// Drop one client from `folder`; the last one out starts the idle timer.
    pub async fn detach(&self, folder: &Path, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        let Some(live) = sessions.get_mut(folder) else {
            return;
        };
        if live.session.id != session_id {
            return;
        }

        live.clients = live.clients.saturating_sub(1);
        debug!(session_id, clients = live.clients, "client detached");
        if live.clients == 0 && live.idle.is_none() {
            let monitor = IdleMonitor::new(
                live.session.id.clone(),
                folder.to_path_buf(),
                self.config.policy,
                Arc::clone(&self.guards),
                live.activity.subscribe(),
                self.idle_tx.clone(),
                self.cancel.child_token(),
            );
            live.idle = Some(monitor.spawn());
        }
    }

    /// Submit a prompt to the session's agent.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` if the session is no longer live.
    /// - `AppError::Process` if the agent's input queue is closed or full.
    pub async fn send_prompt(&self, folder: &Path, session_id: &str, text: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let live = live_session_mut(&mut sessions, folder, session_id)?;

        live.input
            .try_send(user_prompt_message(text))
            .map_err(|err| AppError::Process(format!("agent input unavailable: {err}")))?;
        live.session.begin_turn();
        live.publish_activity();
        Ok(())
    }

    /// Interrupt the agent's current turn.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` if the session is no longer live.
    /// - `AppError::Process` if the interrupt cannot be delivered.
    pub async fn abort(&self, folder: &Path, session_id: &str) -> Result<()> {
        let sessions = self.sessions.lock().await;
        let live = sessions
            .get(folder)
            .filter(|live| live.session.id == session_id)
            .ok_or_else(|| AppError::NotFound(format!("no live session {session_id}")))?;
        let pid = live
            .session
            .live_pid()
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} has no process")))?;

        if self.table.signal(pid, ProcessSignal::Interrupt) {
            info!(session_id, pid, "agent interrupted");
            Ok(())
        } else {
            Err(AppError::Process(format!("failed to interrupt agent {pid}")))
        }
    }

    /// Deliberately end a session: record the handoff, then kill it.
    ///
    /// The next attach to `folder` starts fresh instead of resuming.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is no longer live.
    pub async fn close(&self, folder: &Path, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        live_session_mut(&mut sessions, folder, session_id)?;

        if let Err(err) = self.history.record_close_handoff(folder, session_id) {
            self.bus.emit(LifecycleEvent::PersistError {
                operation: "handoff".into(),
                error: crate::events::describe_error(&err),
            });
        }
        let killed = self.retire_locked(&mut sessions, folder, "closed by client");
        self.persist_locked(&sessions);
        drop(sessions);

        if let Some((session_id, pid)) = killed {
            self.terminate(session_id, pid).await;
        }
        Ok(())
    }

    /// Kill an idle session if it is still unattached and unchanged.
    pub async fn expire(&self, folder: &Path, session_id: &str, reason: &str) {
        let mut sessions = self.sessions.lock().await;
        let current = sessions
            .get(folder)
            .is_some_and(|live| live.session.id == session_id && live.clients == 0);
        if !current {
            debug!(session_id, "idle expiry for a session that moved on, ignoring");
            return;
        }
        let killed = self.retire_locked(&mut sessions, folder, reason);
        self.persist_locked(&sessions);
        drop(sessions);

        if let Some((session_id, pid)) = killed {
            self.terminate(session_id, pid).await;
        }
    }

    /// Apply one event from an agent's reader or exit monitor.
    pub async fn handle_agent_event(&self, event: AgentEvent) {
        let mut sessions = self.sessions.lock().await;
        match event {
            AgentEvent::Output {
                session_id,
                event,
                ends_turn,
            } => {
                let Some(live) = sessions
                    .values_mut()
                    .find(|live| live.session.id == session_id)
                else {
                    debug!(session_id, "output for unknown session dropped");
                    return;
                };
                live.session.record_output(monotonic_now(), ends_turn);
                live.publish_activity();

                if live.backlog.len() >= self.config.history_backlog {
                    live.backlog.pop_front();
                }
                live.backlog.push_back(event.clone());
                // No receivers just means no client is attached right now.
                let _ = live.output.send(SessionOutput::Event(event));
            }
            AgentEvent::Exited {
                session_id,
                pid,
                code,
                signal,
            } => {
                let folder = sessions.iter().find_map(|(folder, live)| {
                    (live.session.id == session_id && live.session.live_pid() == Some(pid))
                        .then(|| folder.clone())
                });
                let Some(folder) = folder else {
                    self.finish_draining(pid);
                    debug!(session_id, pid, "exit of a process no longer tracked");
                    return;
                };
                if let Some(live) = sessions.remove(&folder) {
                    live.io_cancel.cancel();
                    let _ = live.output.send(SessionOutput::Exited { code, signal });
                }
                self.bus.emit(LifecycleEvent::SessionExit {
                    session_id,
                    code,
                    signal,
                });
                self.persist_locked(&sessions);
            }
        }
    }

    /// Snapshot of every live session.
    pub async fn live_sessions(&self) -> Vec<Session> {
        self.sessions
            .lock()
            .await
            .values()
            .map(|live| live.session.clone())
            .collect()
    }

    /// Number of clients attached to `folder`'s session.
    pub async fn client_count(&self, folder: &Path) -> usize {
        self.sessions
            .lock()
            .await
            .get(folder)
            .map_or(0, |live| live.clients)
    }

    /// Terminate every live session, force-kill survivors, clear the record
    /// file, and stop the background consumers.
    ///
    /// Returns how many sessions were torn down.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<LiveSession> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, live)| live).collect()
        };
        let count = drained.len();

        let mut escalations = Vec::with_capacity(count);
        for live in drained {
            live.io_cancel.cancel();
            let pid = live.session.live_pid();
            if let Some(pid) = pid {
                let targets = self.terminate_targets(pid).await;
                let session_id = live.session.id.clone();
                escalations.push(schedule_force_kill(
                    Arc::clone(&self.table),
                    targets,
                    self.config.kill_escalation,
                    move |pids| warn!(session_id, ?pids, "force-killed agent on shutdown"),
                ));
            }
            self.bus.emit(LifecycleEvent::SessionKill {
                session_id: live.session.id.clone(),
                pid,
                reason: "server shutdown".into(),
            });
        }

        for escalation in escalations {
            let _ = escalation.await;
        }

        self.records.schedule(Vec::new());
        self.records.flush_now();
        self.cancel.cancel();
        info!(sessions = count, "supervisor shut down");
        count
    }

    fn spawn_session(&self, folder: &Path, resolution: &Resolution) -> Result<LiveSession> {
        let session_id = resolution.session_id.clone();
        let AgentProcess {
            pid,
            child,
            stdin,
            stdout,
        } = spawn_agent(&self.config.spawn, folder, &session_id, resolution.resumable)?;

        let mut session = Session::new(
            session_id.clone(),
            Some(folder.to_path_buf()),
            resolution.resumable,
        );
        session.attach_process(pid);

        let io_cancel = self.cancel.child_token();
        let (input_tx, input_rx) = mpsc::channel(AGENT_INPUT_CAPACITY);
        let span = info_span!("agent_io", session_id = %session_id, pid);

        let writer = run_writer(session_id.clone(), stdin, input_rx, io_cancel.clone());
        tokio::spawn(
            async move {
                if let Err(err) = writer.await {
                    warn!(%err, "agent writer stopped");
                }
            }
            .instrument(span.clone()),
        );
        let reader = run_reader(
            session_id.clone(),
            stdout,
            self.agent_tx.clone(),
            io_cancel.clone(),
        );
        tokio::spawn(
            async move {
                if let Err(err) = reader.await {
                    warn!(%err, "agent reader stopped");
                }
            }
            .instrument(span),
        );
        // The exit monitor follows the root token: cancelling it drops the
        // child, which kills the process.
        drop(monitor_exit(
            session_id.clone(),
            pid,
            child,
            self.agent_tx.clone(),
            self.cancel.clone(),
        ));

        self.bus.emit(LifecycleEvent::SessionSpawn {
            session_id,
            folder: folder.to_path_buf(),
            pid,
            resumed: resolution.resumable,
        });

        let (output, _) = broadcast::channel(OUTPUT_CAPACITY);
        let (activity, _) = watch::channel(session.activity());
        Ok(LiveSession {
            session,
            backlog: VecDeque::new(),
            output,
            input: input_tx,
            activity,
            clients: 1,
            idle: None,
            io_cancel,
        })
    }

    /// Remove `folder`'s session from the registry and mark it draining.
    ///
    /// Returns the session id and pid still to be signalled once the
    /// registry lock is released.
    fn retire_locked(
        &self,
        sessions: &mut HashMap<PathBuf, LiveSession>,
        folder: &Path,
        reason: &str,
    ) -> Option<(String, u32)> {
        let live = sessions.remove(folder)?;
        live.io_cancel.cancel();
        let _ = live.output.send(SessionOutput::Exited {
            code: None,
            signal: None,
        });

        let session_id = live.session.id.clone();
        let pid = live.session.live_pid();
        info!(session_id, ?pid, reason, "session killed");
        self.bus.emit(LifecycleEvent::SessionKill {
            session_id: session_id.clone(),
            pid,
            reason: reason.to_owned(),
        });

        let pid = pid?;
        let (exited, _) = watch::channel(false);
        self.draining
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                folder.to_path_buf(),
                Draining {
                    session_id: session_id.clone(),
                    pid,
                    exited,
                },
            );
        Some((session_id, pid))
    }

    /// Terminate a retired agent's tree and schedule the forced kill.
    async fn terminate(&self, session_id: String, pid: u32) {
        let targets = self.terminate_targets(pid).await;
        drop(schedule_force_kill(
            Arc::clone(&self.table),
            targets,
            self.config.kill_escalation,
            move |pids| warn!(session_id, ?pids, "agent ignored terminate, force-killed"),
        ));
    }

    /// Run [`terminate_tree`] off the async workers; the table scan blocks.
    async fn terminate_targets(&self, pid: u32) -> Vec<u32> {
        let table = Arc::clone(&self.table);
        match tokio::task::spawn_blocking(move || terminate_tree(table.as_ref(), pid)).await {
            Ok(targets) => targets,
            Err(err) => {
                warn!(%err, pid, "terminate task failed");
                vec![pid]
            }
        }
    }

    /// Force-kill and await a draining agent for `folder`, if any.
    ///
    /// Gives up after the kill escalation delay; the exit may never be
    /// reported once the supervisor is shutting down.
    async fn await_draining(&self, folder: &Path) {
        let pending = self
            .draining
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(folder)
            .map(|draining| {
                (
                    draining.session_id.clone(),
                    draining.pid,
                    draining.exited.subscribe(),
                )
            });
        let Some((session_id, pid, mut exited)) = pending else {
            return;
        };

        info!(session_id, pid, "previous agent still exiting, forcing kill");
        let table = Arc::clone(&self.table);
        if let Err(err) = tokio::task::spawn_blocking(move || kill_tree(table.as_ref(), pid)).await {
            warn!(%err, pid, "kill task failed");
        }

        let observed = tokio::time::timeout(self.config.kill_escalation, async {
            exited.wait_for(|done| *done).await.is_ok()
        })
        .await
        .unwrap_or(false);
        if !observed {
            warn!(session_id, pid, "previous agent exit not observed, continuing");
            let mut draining = self.draining.lock().unwrap_or_else(PoisonError::into_inner);
            if draining.get(folder).is_some_and(|entry| entry.pid == pid) {
                draining.remove(folder);
            }
        }
    }

    fn finish_draining(&self, pid: u32) {
        let mut draining = self.draining.lock().unwrap_or_else(PoisonError::into_inner);
        let folder = draining
            .iter()
            .find_map(|(folder, entry)| (entry.pid == pid).then(|| folder.clone()));
        if let Some(entry) = folder.and_then(|folder| draining.remove(&folder)) {
            entry.exited.send_replace(true);
            debug!(session_id = entry.session_id, pid, "killed agent exited");
        }
    }

    fn persist_locked(&self, sessions: &HashMap<PathBuf, LiveSession>) {
        let records = sessions
            .values()
            .filter_map(|live| live.session.to_record())
            .collect();
        self.records.schedule(records);
    }
}

fn live_session_mut<'a>(
    sessions: &'a mut HashMap<PathBuf, LiveSession>,
    folder: &Path,
    session_id: &str,
) -> Result<&'a mut LiveSession> {
    sessions
        .get_mut(folder)
        .filter(|live| live.session.id == session_id)
        .ok_or_else(|| AppError::NotFound(format!("no live session {session_id}")))
}

fn spawn_agent_event_consumer(
    mut rx: mpsc::Receiver<AgentEvent>,
    supervisor: Weak<SessionSupervisor>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => {
                    debug!("agent event consumer shutting down");
                    break;
                }
                maybe_event = rx.recv() => {
                    if let Some(e) = maybe_event { e } else {
                        debug!("agent event channel closed");
                        break;
                    }
                }
            };
            let Some(supervisor) = supervisor.upgrade() else {
                break;
            };
            supervisor.handle_agent_event(event).await;
        }
    })
}

fn spawn_idle_consumer(
    mut rx: mpsc::Receiver<IdleEvent>,
    supervisor: Weak<SessionSupervisor>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => {
                    debug!("idle event consumer shutting down");
                    break;
                }
                maybe_event = rx.recv() => {
                    if let Some(e) = maybe_event { e } else {
                        debug!("idle event channel closed");
                        break;
                    }
                }
            };
            let Some(supervisor) = supervisor.upgrade() else {
                break;
            };
            match event {
                IdleEvent::Expired {
                    session_id,
                    folder,
                    reason,
                } => supervisor.expire(&folder, &session_id, &reason).await,
            }
        }
    })
}
