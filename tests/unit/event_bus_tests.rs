//! Unit tests for the lifecycle event bus.

use std::sync::{Arc, Mutex};

use agent_relay::events::{
    current_correlation_id, describe_error, describe_panic, with_correlation,
    with_correlation_sync, EmittedEvent, EventBus, LifecycleEvent,
};
use agent_relay::AppError;

fn recorder(bus: &EventBus) -> Arc<Mutex<Vec<EmittedEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
    seen
}

fn persist_error(operation: &str) -> LifecycleEvent {
    LifecycleEvent::PersistError {
        operation: operation.into(),
        error: "disk full".into(),
    }
}

#[test]
fn delivers_in_registration_order() {
    let bus = EventBus::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second", "third"] {
        let order = Arc::clone(&order);
        bus.subscribe(move |_| order.lock().unwrap().push(name));
    }

    bus.emit(persist_error("write"));
    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
}

#[test]
fn panicking_subscriber_does_not_block_others() {
    let bus = EventBus::new();
    let before = recorder(&bus);
    bus.subscribe(|_| panic!("subscriber exploded"));
    let after = recorder(&bus);

    bus.emit(persist_error("write"));
    bus.emit(persist_error("delete"));

    assert_eq!(before.lock().unwrap().len(), 2);
    assert_eq!(after.lock().unwrap().len(), 2);
}

#[test]
fn emit_without_subscribers_is_a_no_op() {
    let bus = EventBus::new();
    assert_eq!(bus.subscriber_count(), 0);
    bus.emit(persist_error("write"));
}

#[test]
fn with_tracing_registers_the_logger() {
    let bus = EventBus::with_tracing();
    assert_eq!(bus.subscriber_count(), 1);
    bus.emit(LifecycleEvent::Start {
        pid: 1,
        bind_addr: "127.0.0.1:0".into(),
    });
}

#[test]
fn correlation_id_is_stamped_inside_scope_only() {
    let bus = EventBus::new();
    let seen = recorder(&bus);

    with_correlation_sync("req-7".into(), || {
        assert_eq!(current_correlation_id().as_deref(), Some("req-7"));
        bus.emit(persist_error("write"));
    });
    bus.emit(persist_error("write"));

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].correlation_id.as_deref(), Some("req-7"));
    assert_eq!(seen[1].correlation_id, None);
}

#[tokio::test]
async fn async_scope_carries_correlation_id_across_awaits() {
    let bus = Arc::new(EventBus::new());
    let seen = recorder(&bus);

    let inner = Arc::clone(&bus);
    with_correlation("conn-1".into(), async move {
        tokio::task::yield_now().await;
        inner.emit(persist_error("write"));
    })
    .await;

    assert_eq!(
        seen.lock().unwrap()[0].correlation_id.as_deref(),
        Some("conn-1")
    );
}

#[test]
fn emitted_events_serialize_with_kebab_tags() {
    let bus = EventBus::new();
    let seen = recorder(&bus);
    bus.emit(LifecycleEvent::OrphanSummary {
        total: 3,
        reaped: 1,
        skipped: 1,
        dead: 1,
    });

    let json = serde_json::to_value(&seen.lock().unwrap()[0]).unwrap();
    assert_eq!(json["type"], "orphan-summary");
    assert_eq!(json["total"], 3);
    assert!(json.get("correlationId").is_none());
    assert!(json.get("at").is_some());
}

#[derive(Debug)]
struct Outer(std::io::Error);

impl std::fmt::Display for Outer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "record write failed")
    }
}

impl std::error::Error for Outer {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

#[test]
fn describe_error_renders_the_source_chain() {
    let err = Outer(std::io::Error::new(
        std::io::ErrorKind::PermissionDenied,
        "read-only file system",
    ));
    assert_eq!(
        describe_error(&err),
        "record write failed\n  caused by: read-only file system"
    );
}

#[test]
fn describe_error_without_chain_uses_type_name() {
    let err = AppError::Persistence("rename failed".into());
    assert_eq!(describe_error(&err), "AppError: persistence: rename failed");
}

#[test]
fn describe_panic_handles_common_payloads() {
    assert_eq!(describe_panic(&"static"), "static");
    assert_eq!(describe_panic(&String::from("owned")), "owned");
    assert_eq!(describe_panic(&AppError::Io("boom".into())), "io: boom");
    assert_eq!(describe_panic(&()), "null");
    assert_eq!(describe_panic(&42_u8), "<non-string panic payload>");
}
