//! Unit tests for the session model.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use agent_relay::models::session::Session;

#[test]
fn new_session_has_no_process_and_no_record() {
    let session = Session::new("s1".into(), Some(PathBuf::from("/w/app")), false);
    assert_eq!(session.live_pid(), None);
    assert_eq!(session.to_record(), None);
}

#[test]
fn spawned_session_produces_a_record() {
    let mut session = Session::new("s1".into(), Some(PathBuf::from("/w/app")), true);
    session.attach_process(4321);

    let record = session.to_record().expect("live process has a record");
    assert_eq!(record.session_id, "s1");
    assert_eq!(record.folder, PathBuf::from("/w/app"));
    assert_eq!(record.pid, 4321);
    assert_eq!(record.spawned_at, session.spawned_at);
}

#[test]
fn lobby_session_has_no_record() {
    let mut session = Session::new("s1".into(), None, false);
    session.attach_process(1);
    assert_eq!(session.to_record(), None);
}

#[test]
fn unspawned_session_has_no_pid_or_record() {
    let session = Session::new("s1".into(), Some(PathBuf::from("/w/app")), false);
    assert_eq!(session.live_pid(), None);
    assert_eq!(session.to_record(), None);

    let mut spawned = session.clone();
    spawned.attach_process(7);
    assert_eq!(spawned.live_pid(), Some(7));
}

#[test]
fn turn_tracking_follows_prompts_and_results() {
    let mut session = Session::new("s1".into(), Some(PathBuf::from("/w/app")), false);
    let start = Instant::now();

    session.begin_turn();
    assert!(session.activity().turn_in_progress);

    session.record_output(start, false);
    assert!(session.activity().turn_in_progress);
    assert_eq!(session.activity().last_output_at, Some(start));

    let later = start + Duration::from_secs(2);
    session.record_output(later, true);
    let activity = session.activity();
    assert!(!activity.turn_in_progress);
    assert_eq!(activity.last_output_at, Some(later));
    assert_eq!(activity.spawned_at, session.spawned_instant);
}

#[test]
fn generated_ids_are_unique() {
    assert_ne!(Session::generate_id(), Session::generate_id());
}
