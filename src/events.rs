//! Process-wide lifecycle event bus.
//!
//! Every supervisor transition (spawn, kill, orphan reaping, persistence
//! failures, startup and shutdown) is announced as a [`LifecycleEvent`].
//! [`EventBus::emit`] stamps the event with the correlation id of the
//! current request scope, if one is active, and delivers it synchronously to
//! every subscriber in registration order.
//!
//! A subscriber that panics is isolated: the panic is caught, logged, and
//! delivery continues with the next subscriber. `emit` itself never panics.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

tokio::task_local! {
    static CORRELATION_ID: String;
}

/// Run `fut` with `id` as the correlation id for every event it emits.
pub async fn with_correlation<F>(id: String, fut: F) -> F::Output
where
    F: Future,
{
    CORRELATION_ID.scope(id, fut).await
}

/// Synchronous counterpart of [`with_correlation`].
pub fn with_correlation_sync<R>(id: String, f: impl FnOnce() -> R) -> R {
    CORRELATION_ID.sync_scope(id, f)
}

/// Correlation id of the enclosing request scope, if any.
#[must_use]
pub fn current_correlation_id() -> Option<String> {
    CORRELATION_ID.try_with(Clone::clone).ok()
}

/// Lifecycle transitions announced on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum LifecycleEvent {
    /// Server process started.
    Start {
        /// Server pid.
        pid: u32,
        /// Listen address.
        bind_addr: String,
    },
    /// Server process is shutting down.
    Shutdown {
        /// Human-readable shutdown cause.
        reason: String,
        /// Live sessions torn down during shutdown.
        sessions: usize,
    },
    /// An agent process was spawned for a folder.
    SessionSpawn {
        /// Logical session id.
        session_id: String,
        /// Folder served by the session.
        folder: PathBuf,
        /// Agent process id.
        pid: u32,
        /// Whether the agent was asked to resume prior context.
        resumed: bool,
    },
    /// A live session was torn down by the supervisor.
    SessionKill {
        /// Logical session id.
        session_id: String,
        /// Agent process id.
        pid: Option<u32>,
        /// Why the session was killed.
        reason: String,
    },
    /// An agent process exited on its own.
    SessionExit {
        /// Logical session id.
        session_id: String,
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Terminating signal, if any.
        signal: Option<i32>,
    },
    /// A persisted record was left untouched.
    OrphanSkip {
        /// Session id from the record.
        session_id: String,
        /// Recorded pid.
        pid: u32,
        /// Why the record was skipped.
        reason: String,
    },
    /// A leftover process tree was sent a graceful terminate.
    OrphanReap {
        /// Session id from the record.
        session_id: String,
        /// Recorded pid.
        pid: u32,
        /// Descendants found under the recorded pid.
        descendants: Vec<u32>,
    },
    /// Processes still alive after the escalation delay were force-killed.
    OrphanForceKill {
        /// Session id from the record.
        session_id: String,
        /// Pids that received a forced kill.
        pids: Vec<u32>,
    },
    /// Totals for one reap pass.
    OrphanSummary {
        /// Records read from disk.
        total: usize,
        /// Records whose process tree was terminated.
        reaped: usize,
        /// Records skipped as too old.
        skipped: usize,
        /// Records whose process was already gone.
        dead: usize,
    },
    /// A recovery record read, write, or delete failed.
    PersistError {
        /// Operation that failed (`write`, `delete`, ...).
        operation: String,
        /// Normalized error text.
        error: String,
    },
}

/// A [`LifecycleEvent`] as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmittedEvent {
    /// The transition itself.
    #[serde(flatten)]
    pub event: LifecycleEvent,
    /// Correlation id of the request scope that emitted the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Emission timestamp.
    pub at: DateTime<Utc>,
}

/// Subscriber callback type.
pub type Subscriber = Arc<dyn Fn(&EmittedEvent) + Send + Sync>;

/// Synchronous, process-wide publish/subscribe hub.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    /// Create a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus with the tracing logger already subscribed.
    #[must_use]
    pub fn with_tracing() -> Self {
        let bus = Self::new();
        bus.subscribe(log_event);
        bus
    }

    /// Register a listener for the lifetime of the process.
    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(&EmittedEvent) + Send + Sync + 'static,
    {
        match self.subscribers.write() {
            Ok(mut subs) => subs.push(Arc::new(subscriber)),
            Err(poisoned) => poisoned.into_inner().push(Arc::new(subscriber)),
        }
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.read() {
            Ok(subs) => subs.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Deliver `event` to every subscriber in registration order.
    pub fn emit(&self, event: LifecycleEvent) {
        let emitted = EmittedEvent {
            event,
            correlation_id: current_correlation_id(),
            at: Utc::now(),
        };

        // Snapshot so a subscriber may itself subscribe without deadlocking.
        let subscribers: Vec<Subscriber> = match self.subscribers.read() {
            Ok(subs) => subs.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        for (index, subscriber) in subscribers.iter().enumerate() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| subscriber(&emitted)));
            if let Err(payload) = outcome {
                error!(
                    subscriber = index,
                    error = %describe_panic(payload.as_ref()),
                    "event subscriber panicked"
                );
            }
        }
    }
}

/// Normalize an error into a single string.
///
/// Errors with a source chain render the full chain; errors without one
/// fall back to `kind: message`, where `kind` is the short type name.
#[must_use]
pub fn describe_error<E>(err: &E) -> String
where
    E: std::error::Error + 'static,
{
    let mut chain = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }

    if chain.is_empty() {
        let kind = std::any::type_name::<E>()
            .rsplit("::")
            .next()
            .unwrap_or("Error");
        return format!("{kind}: {err}");
    }

    let mut out = err.to_string();
    for cause in chain {
        out.push_str("\n  caused by: ");
        out.push_str(&cause);
    }
    out
}

/// Normalize a caught panic payload into a string.
#[must_use]
pub fn describe_panic(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else if let Some(err) = payload.downcast_ref::<crate::AppError>() {
        err.to_string()
    } else if payload.is::<()>() {
        "null".to_owned()
    } else {
        "<non-string panic payload>".to_owned()
    }
}

fn log_event(emitted: &EmittedEvent) {
    let correlation_id = emitted.correlation_id.as_deref().unwrap_or("-");
    match &emitted.event {
        LifecycleEvent::PersistError { operation, error } => {
            warn!(correlation_id, operation, error, "persist-error");
        }
        LifecycleEvent::OrphanForceKill { session_id, pids } => {
            warn!(correlation_id, session_id, ?pids, "orphan-force-kill");
        }
        other => {
            let payload = serde_json::to_string(other).unwrap_or_default();
            info!(correlation_id, event = %payload, "lifecycle event");
        }
    }
}
