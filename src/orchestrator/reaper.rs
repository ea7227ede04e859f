//! Startup recovery of agent processes left behind by a previous instance.
//!
//! Runs once, synchronously, before the listener is bound. Each persisted
//! record is handled at most once: the record file is deleted after the pass
//! whatever the outcome, so a later restart never re-processes it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, info_span};

use crate::events::{describe_error, EventBus, LifecycleEvent};
use crate::models::record::SessionRecord;
use crate::persistence::record_store::RecordStore;

use super::process_tree::{schedule_force_kill, terminate_tree, ProcessTable};

/// Totals for one reap pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapSummary {
    /// Records read from disk.
    pub total: usize,
    /// Records whose process tree was terminated.
    pub reaped: usize,
    /// Records skipped as stale bookkeeping.
    pub skipped: usize,
    /// Records whose process had already exited.
    pub dead: usize,
}

/// What happened to a single record.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RecordOutcome {
    Skipped,
    Dead,
    Reaped,
}

/// Recovers orphaned agent processes from persisted records.
pub struct OrphanReaper {
    store: RecordStore,
    table: Arc<dyn ProcessTable>,
    bus: Arc<EventBus>,
    max_record_age: chrono::Duration,
    kill_escalation: Duration,
}

impl OrphanReaper {
    /// Build a reaper over `store` using `table` for probing and signalling.
    #[must_use]
    pub fn new(
        store: RecordStore,
        table: Arc<dyn ProcessTable>,
        bus: Arc<EventBus>,
        max_record_age: chrono::Duration,
        kill_escalation: Duration,
    ) -> Self {
        Self {
            store,
            table,
            bus,
            max_record_age,
            kill_escalation,
        }
    }

    /// Process every persisted record, then delete the record file.
    ///
    /// Must be called from within a tokio runtime: forced-kill escalation is
    /// scheduled as a detached task.
    pub fn reap(&self, now: DateTime<Utc>) -> ReapSummary {
        let _span = info_span!("orphan_reap").entered();

        let records = self.store.load();
        let mut summary = ReapSummary {
            total: records.len(),
            ..ReapSummary::default()
        };

        for record in &records {
            match self.reap_one(record, now) {
                RecordOutcome::Skipped => summary.skipped += 1,
                RecordOutcome::Dead => summary.dead += 1,
                RecordOutcome::Reaped => summary.reaped += 1,
            }
        }

        if let Err(err) = self.store.remove() {
            self.bus.emit(LifecycleEvent::PersistError {
                operation: "delete".into(),
                error: describe_error(&err),
            });
        }

        self.bus.emit(LifecycleEvent::OrphanSummary {
            total: summary.total,
            reaped: summary.reaped,
            skipped: summary.skipped,
            dead: summary.dead,
        });
        info!(
            total = summary.total,
            reaped = summary.reaped,
            skipped = summary.skipped,
            dead = summary.dead,
            "orphan reap pass complete"
        );
        summary
    }

    fn reap_one(&self, record: &SessionRecord, now: DateTime<Utc>) -> RecordOutcome {
        let age = record.age(now);
        if age > self.max_record_age {
            info!(
                session_id = record.session_id,
                pid = record.pid,
                age_hours = age.num_hours(),
                "skipping stale recovery record"
            );
            self.bus.emit(LifecycleEvent::OrphanSkip {
                session_id: record.session_id.clone(),
                pid: record.pid,
                reason: format!("record is {}h old", age.num_hours()),
            });
            return RecordOutcome::Skipped;
        }

        if !self.table.is_alive(record.pid) {
            debug!(
                session_id = record.session_id,
                pid = record.pid,
                "recorded process already gone"
            );
            return RecordOutcome::Dead;
        }

        let targets = terminate_tree(self.table.as_ref(), record.pid);
        info!(
            session_id = record.session_id,
            pid = record.pid,
            folder = %record.folder.display(),
            descendants = targets.len() - 1,
            "terminated orphaned agent process tree"
        );
        self.bus.emit(LifecycleEvent::OrphanReap {
            session_id: record.session_id.clone(),
            pid: record.pid,
            descendants: targets[1..].to_vec(),
        });

        let bus = Arc::clone(&self.bus);
        let session_id = record.session_id.clone();
        drop(schedule_force_kill(
            Arc::clone(&self.table),
            targets,
            self.kill_escalation,
            move |pids| bus.emit(LifecycleEvent::OrphanForceKill { session_id, pids }),
        ));

        RecordOutcome::Reaped
    }
}
