//! Per-session idle timer.
//!
//! An [`IdleMonitor`] is spawned when the last client detaches from a
//! session. It sleeps for the idle timeout, then runs [`check_idle`] on a
//! recurring schedule until the verdict is a kill, which is delivered as an
//! [`IdleEvent::Expired`] over an `mpsc` channel. Dropping the
//! [`IdleMonitorHandle`] (a client re-attached) cancels the task.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::models::session::SessionActivity;

use super::idle::{check_idle, monotonic_now, IdleDecision, IdleGuard, IdlePolicy};

/// Events emitted by idle monitors for the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleEvent {
    /// The session should be torn down.
    Expired {
        /// Session whose process is idle.
        session_id: String,
        /// Folder the session serves.
        folder: PathBuf,
        /// Decision reason.
        reason: String,
    },
}

/// Shared, ordered guard list.
pub type GuardList = Arc<Vec<Box<dyn IdleGuard>>>;

/// Builder for a per-session idle monitor.
pub struct IdleMonitor {
    session_id: String,
    folder: PathBuf,
    policy: IdlePolicy,
    guards: GuardList,
    activity: watch::Receiver<SessionActivity>,
    event_tx: mpsc::Sender<IdleEvent>,
    cancel: CancellationToken,
}

impl IdleMonitor {
    /// Construct a monitor (does not start the timer yet).
    #[must_use]
    pub fn new(
        session_id: String,
        folder: PathBuf,
        policy: IdlePolicy,
        guards: GuardList,
        activity: watch::Receiver<SessionActivity>,
        event_tx: mpsc::Sender<IdleEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            folder,
            policy,
            guards,
            activity,
            event_tx,
            cancel,
        }
    }

    /// Spawn the timer task and return a handle that cancels it on drop.
    #[must_use]
    pub fn spawn(self) -> IdleMonitorHandle {
        let cancel = self.cancel.clone();
        let session_id = self.session_id.clone();
        let span = info_span!("idle_monitor", session_id = %self.session_id);
        let join_handle = tokio::spawn(self.run().instrument(span));

        IdleMonitorHandle {
            session_id,
            cancel,
            join_handle: Some(join_handle),
        }
    }

    async fn run(self) {
        let mut idle_start = monotonic_now();
        let mut guard_deferred = false;
        let mut delay = self.policy.idle_timeout;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!("idle monitor cancelled");
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }

            let activity = *self.activity.borrow();
            let now = monotonic_now();
            match check_idle(
                idle_start,
                guard_deferred,
                &self.guards,
                &activity,
                now,
                &self.policy,
            ) {
                IdleDecision::Kill { reason } => {
                    info!(reason, "idle session expired");
                    let _ = self
                        .event_tx
                        .send(IdleEvent::Expired {
                            session_id: self.session_id.clone(),
                            folder: self.folder.clone(),
                            reason,
                        })
                        .await;
                    return;
                }
                IdleDecision::Recheck {
                    delay: next,
                    guard_deferred: deferred,
                    reason,
                } => {
                    if deferred {
                        idle_start = now;
                    }
                    debug!(reason, next_ms = next.as_millis(), deferred, "idle recheck");
                    guard_deferred = deferred;
                    delay = next;
                }
            }
        }
    }
}

/// Handle returned from [`IdleMonitor::spawn`].
pub struct IdleMonitorHandle {
    session_id: String,
    cancel: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
}

impl Drop for IdleMonitorHandle {
    /// Cancel the background task when the handle is dropped.
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl IdleMonitorHandle {
    /// The session this monitor watches.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Cancel the task and wait for it to exit.
    pub async fn await_completion(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.await;
        }
    }
}
