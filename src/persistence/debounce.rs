//! Trailing-edge debounced writer for recovery records.
//!
//! Callers hand over a full snapshot whenever the live process set changes.
//! The first snapshot in a quiet period schedules one flush after the
//! window; snapshots arriving before it fires only replace the pending data.
//! This is a pending flag plus one scheduled flush, not a queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::events::{EventBus, LifecycleEvent};
use crate::models::record::SessionRecord;

use super::record_store::RecordStore;

/// Debounced front-end for a [`RecordStore`].
#[derive(Debug, Clone)]
pub struct DebouncedRecordWriter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    store: RecordStore,
    window: Duration,
    pending: AtomicBool,
    latest: Mutex<Vec<SessionRecord>>,
    bus: Arc<EventBus>,
}

impl DebouncedRecordWriter {
    /// Writer flushing to `store` at most once per `window`.
    #[must_use]
    pub fn new(store: RecordStore, window: Duration, bus: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                window,
                pending: AtomicBool::new(false),
                latest: Mutex::new(Vec::new()),
                bus,
            }),
        }
    }

    /// Record the current live set and schedule a flush if none is pending.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, records: Vec<SessionRecord>) {
        *self
            .inner
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = records;

        if self.inner.pending.swap(true, Ordering::SeqCst) {
            debug!("record flush already pending, coalescing");
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.window).await;
            let flush_inner = Arc::clone(&inner);
            if tokio::task::spawn_blocking(move || flush_inner.flush())
                .await
                .is_err()
            {
                inner.bus.emit(LifecycleEvent::PersistError {
                    operation: "write".into(),
                    error: "record flush task panicked".into(),
                });
            }
        });
    }

    /// Write the latest snapshot immediately, bypassing the window.
    pub fn flush_now(&self) {
        self.inner.flush();
    }

    /// Whether a flush is scheduled but has not run yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.inner.pending.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn flush(&self) {
        // Clear first so a snapshot arriving mid-write schedules a new flush.
        self.pending.store(false, Ordering::SeqCst);
        let records = self
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if let Err(err) = self.store.save(&records) {
            self.bus.emit(LifecycleEvent::PersistError {
                operation: "write".into(),
                error: crate::events::describe_error(&err),
            });
        }
    }
}
