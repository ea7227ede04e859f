//! Agent process spawner and exit monitor.
//!
//! Launches the agent CLI in the session's folder with stdio piped:
//! `<agent_cli> <agent_cli_args…> --session-id <id>` for a fresh session, or
//! `--resume <id>` when the resolver asked for prior context. The session id
//! is also exported as `RELAY_SESSION_ID`.

use std::path::Path;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::AgentEvent;
use crate::{AppError, Result};

/// How to launch the agent CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnConfig {
    /// Agent CLI binary.
    pub agent_cli: String,
    /// Arguments placed before the session flags.
    pub agent_cli_args: Vec<String>,
}

/// A freshly spawned agent with its stdio taken.
#[derive(Debug)]
pub struct AgentProcess {
    /// Operating-system pid.
    pub pid: u32,
    /// Child handle; hand it to [`monitor_exit`].
    pub child: Child,
    /// Agent stdin.
    pub stdin: ChildStdin,
    /// Agent stdout.
    pub stdout: ChildStdout,
}

/// Session flags appended after the configured arguments.
#[must_use]
pub fn session_args(session_id: &str, resumable: bool) -> [String; 2] {
    let flag = if resumable { "--resume" } else { "--session-id" };
    [flag.to_owned(), session_id.to_owned()]
}

/// Spawn the agent for `session_id` in `folder`.
///
/// # Errors
///
/// - `AppError::Process("failed to spawn agent: …")` if the OS spawn fails.
/// - `AppError::Process("failed to capture agent …")` if stdio was not piped.
pub fn spawn_agent(
    config: &SpawnConfig,
    folder: &Path,
    session_id: &str,
    resumable: bool,
) -> Result<AgentProcess> {
    let mut cmd = Command::new(&config.agent_cli);
    cmd.args(&config.agent_cli_args)
        .args(session_args(session_id, resumable))
        .env("RELAY_SESSION_ID", session_id)
        .current_dir(folder)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Process(format!("failed to spawn agent: {err}")))?;

    let pid = child
        .id()
        .ok_or_else(|| AppError::Process("agent exited before its pid was read".into()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Process("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Process("failed to capture agent stdout".into()))?;

    info!(
        session_id,
        pid,
        resumable,
        folder = %folder.display(),
        "agent process spawned"
    );

    Ok(AgentProcess {
        pid,
        child,
        stdin,
        stdout,
    })
}

/// Await the child's exit and report it as [`AgentEvent::Exited`].
///
/// On cancellation the task returns without reporting; dropping the child
/// then kills the process.
#[must_use]
pub fn monitor_exit(
    session_id: String,
    pid: u32,
    mut child: Child,
    event_tx: mpsc::Sender<AgentEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            result = child.wait() => {
                let (code, signal) = match result {
                    Ok(status) => (status.code(), exit_signal(&status)),
                    Err(err) => {
                        warn!(session_id, %err, "error waiting for agent process");
                        (None, None)
                    }
                };
                info!(session_id, pid, ?code, ?signal, "agent process exited");

                let event = AgentEvent::Exited {
                    session_id: session_id.clone(),
                    pid,
                    code,
                    signal,
                };
                if event_tx.send(event).await.is_err() {
                    warn!(session_id, "event channel closed before exit could be delivered");
                }
            }
            () = cancel.cancelled() => {
                info!(session_id, "exit monitor cancelled");
            }
        }
    })
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
