//! Unit tests for the debounced record writer.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use agent_relay::events::{EventBus, LifecycleEvent};
use agent_relay::models::record::SessionRecord;
use agent_relay::persistence::debounce::DebouncedRecordWriter;
use agent_relay::persistence::record_store::RecordStore;

const WINDOW: Duration = Duration::from_millis(50);

fn record(id: &str) -> SessionRecord {
    SessionRecord {
        session_id: id.into(),
        folder: PathBuf::from("/w").join(id),
        pid: 4242,
        spawned_at: Utc::now(),
    }
}

async fn wait_for_flush(writer: &DebouncedRecordWriter) {
    for _ in 0..200 {
        if !writer.is_pending() {
            // The flag clears before the write; give the write a moment.
            tokio::time::sleep(Duration::from_millis(20)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("flush never ran");
}

#[tokio::test]
async fn burst_of_snapshots_writes_only_the_last() {
    let tmp = tempfile::tempdir().unwrap();
    let store = RecordStore::new(tmp.path().join("sessions.json"));
    let writer = DebouncedRecordWriter::new(store.clone(), WINDOW, Arc::new(EventBus::new()));

    writer.schedule(vec![record("a")]);
    assert!(writer.is_pending());
    writer.schedule(vec![record("a"), record("b")]);
    writer.schedule(vec![record("b")]);
    assert!(!store.path().exists(), "nothing is written inside the window");

    wait_for_flush(&writer).await;
    let saved = store.load();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].session_id, "b");
}

#[tokio::test]
async fn snapshot_after_flush_schedules_again() {
    let tmp = tempfile::tempdir().unwrap();
    let store = RecordStore::new(tmp.path().join("sessions.json"));
    let writer = DebouncedRecordWriter::new(store.clone(), WINDOW, Arc::new(EventBus::new()));

    writer.schedule(vec![record("a")]);
    wait_for_flush(&writer).await;
    writer.schedule(Vec::new());
    assert!(writer.is_pending());
    wait_for_flush(&writer).await;
    assert!(store.load().is_empty());
}

#[tokio::test]
async fn flush_now_bypasses_the_window() {
    let tmp = tempfile::tempdir().unwrap();
    let store = RecordStore::new(tmp.path().join("sessions.json"));
    let writer = DebouncedRecordWriter::new(
        store.clone(),
        Duration::from_secs(3600),
        Arc::new(EventBus::new()),
    );

    writer.schedule(vec![record("a")]);
    writer.flush_now();
    assert!(!writer.is_pending());
    let saved = store.load();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].session_id, "a");
}

#[test]
fn write_failure_is_reported_on_the_bus() {
    let tmp = tempfile::tempdir().unwrap();
    let blocker = tmp.path().join("not-a-dir");
    std::fs::write(&blocker, "file").unwrap();

    let bus = Arc::new(EventBus::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe(move |event| sink.lock().unwrap().push(event.event.clone()));

    let writer = DebouncedRecordWriter::new(
        RecordStore::new(blocker.join("sessions.json")),
        WINDOW,
        bus,
    );
    writer.flush_now();

    let seen = seen.lock().unwrap();
    assert!(matches!(
        seen.as_slice(),
        [LifecycleEvent::PersistError { operation, .. }] if operation == "write"
    ));
}
