//! Integration tests for the live-session registry, with real agent
//! processes played by `sh`.

use serde_json::json;

use agent_relay::events::LifecycleEvent;
use agent_relay::orchestrator::supervisor::SessionOutput;
use agent_relay::AppError;

use agent_relay::orchestrator::process_tree::{ProcessTable, SystemProcessTable};

use super::test_helpers::{
    eventually, next_output, Fixture, ECHO_AGENT, ONE_SHOT_AGENT, STUBBORN_AGENT,
};

#[tokio::test]
async fn one_process_per_folder_across_clients() {
    let fixture = Fixture::new(ECHO_AGENT);
    let (supervisor, events) = fixture.supervisor();
    let folder = fixture.folder("app");

    let first = supervisor.attach(&folder).await.expect("first attach");
    let second = supervisor.attach(&folder).await.expect("second attach");

    assert!(!first.is_reconnect);
    assert!(!first.resumed);
    assert!(second.is_reconnect);
    assert_eq!(first.session_id, second.session_id);
    assert_eq!(supervisor.live_sessions().await.len(), 1);
    assert_eq!(supervisor.client_count(&folder).await, 2);

    let spawns = events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| matches!(event, LifecycleEvent::SessionSpawn { .. }))
        .count();
    assert_eq!(spawns, 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn prompt_output_reaches_every_attached_client() {
    let fixture = Fixture::new(ECHO_AGENT);
    let (supervisor, _) = fixture.supervisor();
    let folder = fixture.folder("app");

    let mut a = supervisor.attach(&folder).await.expect("attach a");
    let mut b = supervisor.attach(&folder).await.expect("attach b");
    supervisor
        .send_prompt(&folder, &a.session_id, "hello")
        .await
        .expect("prompt accepted");

    for output in [&mut a.output, &mut b.output] {
        assert_eq!(
            next_output(output).await,
            SessionOutput::Event(json!({"type": "assistant", "message": "working"}))
        );
        assert_eq!(
            next_output(output).await,
            SessionOutput::Event(json!({"type": "result", "subtype": "success"}))
        );
    }

    let session = supervisor.live_sessions().await.remove(0);
    assert!(!session.turn_in_progress, "result closes the turn");
    assert!(session.last_output_at.is_some());

    supervisor.shutdown().await;
}

#[tokio::test]
async fn reattach_receives_the_backlog() {
    let fixture = Fixture::new(ECHO_AGENT);
    let (supervisor, _) = fixture.supervisor();
    let folder = fixture.folder("app");

    let mut first = supervisor.attach(&folder).await.expect("attach");
    supervisor
        .send_prompt(&folder, &first.session_id, "hello")
        .await
        .expect("prompt");
    next_output(&mut first.output).await;
    next_output(&mut first.output).await;
    supervisor.detach(&folder, &first.session_id).await;

    let again = supervisor.attach(&folder).await.expect("re-attach");
    assert!(again.is_reconnect);
    assert_eq!(again.backlog.len(), 2);
    assert_eq!(again.backlog[1]["type"], "result");

    supervisor.shutdown().await;
}

#[tokio::test]
async fn prompt_for_unknown_session_is_not_found() {
    let fixture = Fixture::new(ECHO_AGENT);
    let (supervisor, _) = fixture.supervisor();
    let err = supervisor
        .send_prompt(&fixture.folder("app"), "nope", "hello")
        .await
        .expect_err("no session");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn spawn_failure_surfaces_as_process_error() {
    let mut fixture = Fixture::new(ECHO_AGENT);
    fixture.config.agent_cli = "/definitely/not/an/agent".into();
    let (supervisor, _) = fixture.supervisor();

    let err = supervisor
        .attach(&fixture.folder("app"))
        .await
        .expect_err("spawn fails");
    assert!(matches!(err, AppError::Process(_)));
    assert!(supervisor.live_sessions().await.is_empty());
}

#[tokio::test]
async fn closed_session_is_not_resumed() {
    let fixture = Fixture::new(ECHO_AGENT);
    let (supervisor, events) = fixture.supervisor();
    let folder = fixture.folder("app");

    let mut first = supervisor.attach(&folder).await.expect("attach");
    fixture.write_transcript(&folder, &first.session_id);
    supervisor
        .close(&folder, &first.session_id)
        .await
        .expect("close");

    assert_eq!(
        next_output(&mut first.output).await,
        SessionOutput::Exited {
            code: None,
            signal: None
        }
    );
    assert!(supervisor.live_sessions().await.is_empty());
    assert!(events.lock().unwrap().iter().any(|event| matches!(
        event,
        LifecycleEvent::SessionKill { reason, .. } if reason == "closed by client"
    )));

    let next = supervisor.attach(&folder).await.expect("fresh attach");
    assert_ne!(next.session_id, first.session_id);
    assert!(!next.resumed);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn reattach_after_close_waits_for_the_old_agent_to_die() {
    let fixture = Fixture::new(STUBBORN_AGENT);
    let (supervisor, _) = fixture.supervisor();
    let folder = fixture.folder("app");
    let table = SystemProcessTable::new();

    let first = supervisor.attach(&folder).await.expect("attach");
    // Let the shell install its trap before it is signalled.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let old_pid = supervisor.live_sessions().await[0]
        .live_pid()
        .expect("agent pid");
    supervisor
        .close(&folder, &first.session_id)
        .await
        .expect("close");
    assert!(table.is_alive(old_pid), "agent ignores terminate");

    let second = supervisor.attach(&folder).await.expect("attach again");
    let new_pid = supervisor.live_sessions().await[0]
        .live_pid()
        .expect("agent pid");

    assert_ne!(second.session_id, first.session_id);
    assert_ne!(new_pid, old_pid);
    assert!(!table.is_alive(old_pid), "old agent outlived the new spawn");
    assert!(table.is_alive(new_pid));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn idle_expiry_kills_and_next_attach_resumes() {
    let fixture = Fixture::new(ECHO_AGENT).with_fast_idle();
    let (supervisor, events) = fixture.supervisor();
    let folder = fixture.folder("app");

    let first = supervisor.attach(&folder).await.expect("attach");
    fixture.write_transcript(&folder, &first.session_id);
    supervisor.detach(&folder, &first.session_id).await;

    let observer = &supervisor;
    eventually(|| async move { observer.live_sessions().await.is_empty() }).await;
    assert!(events.lock().unwrap().iter().any(|event| matches!(
        event,
        LifecycleEvent::SessionKill { reason, .. } if reason == "idle timeout"
    )));

    let resumed = supervisor.attach(&folder).await.expect("attach again");
    assert_eq!(resumed.session_id, first.session_id);
    assert!(resumed.resumed);
    assert!(!resumed.is_reconnect);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn returning_client_cancels_idle_expiry() {
    let fixture = Fixture::new(ECHO_AGENT).with_fast_idle();
    let (supervisor, _) = fixture.supervisor();
    let folder = fixture.folder("app");

    let first = supervisor.attach(&folder).await.expect("attach");
    supervisor.detach(&folder, &first.session_id).await;
    let back = supervisor.attach(&folder).await.expect("re-attach");
    assert_eq!(back.session_id, first.session_id);

    tokio::time::sleep(std::time::Duration::from_millis(600)).await;
    assert_eq!(supervisor.live_sessions().await.len(), 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn agent_exit_is_reported_and_session_removed() {
    let fixture = Fixture::new(ONE_SHOT_AGENT);
    let (supervisor, events) = fixture.supervisor();
    let folder = fixture.folder("app");

    let mut attachment = supervisor.attach(&folder).await.expect("attach");
    supervisor
        .send_prompt(&folder, &attachment.session_id, "go")
        .await
        .expect("prompt");

    let exit = loop {
        match next_output(&mut attachment.output).await {
            SessionOutput::Event(_) => {}
            exited @ SessionOutput::Exited { .. } => break exited,
        }
    };
    assert_eq!(
        exit,
        SessionOutput::Exited {
            code: Some(3),
            signal: None
        }
    );
    assert!(supervisor.live_sessions().await.is_empty());
    assert!(events.lock().unwrap().iter().any(|event| matches!(
        event,
        LifecycleEvent::SessionExit { code: Some(3), .. }
    )));
}

#[tokio::test]
async fn records_follow_the_live_set_and_shutdown_clears_them() {
    let fixture = Fixture::new(ECHO_AGENT);
    let (supervisor, events) = fixture.supervisor();
    let store = fixture.store();

    let app = supervisor
        .attach(&fixture.folder("app"))
        .await
        .expect("attach app");
    supervisor
        .attach(&fixture.folder("other"))
        .await
        .expect("attach other");

    eventually(|| {
        let store = store.clone();
        async move { store.load().len() == 2 }
    })
    .await;
    let records = store.load();
    assert!(records.iter().any(|r| r.session_id == app.session_id));

    assert_eq!(supervisor.shutdown().await, 2);
    assert!(store.load().is_empty());
    let kills = events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| {
            matches!(
                event,
                LifecycleEvent::SessionKill { reason, .. } if reason == "server shutdown"
            )
        })
        .count();
    assert_eq!(kills, 2);
}
