//! Unit tests for transcript discovery and close handoffs.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use agent_relay::models::record::RecoverableSession;
use agent_relay::persistence::history::{folder_key, SessionHistory};

fn history(root: &Path) -> SessionHistory {
    SessionHistory::new(root.join("history"), root.join("state/handoffs"))
}

fn write_transcript(history: &SessionHistory, folder: &Path, id: &str, age: Duration) {
    let dir = history.transcript_dir(folder);
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{id}.jsonl"));
    fs::write(&path, "{}\n").unwrap();
    let file = fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::now() - age).unwrap();
}

#[test]
fn folder_key_replaces_non_alphanumerics() {
    assert_eq!(folder_key(Path::new("/home/me/my_app.v2")), "-home-me-my-app-v2");
}

#[test]
fn no_transcript_dir_means_nothing_recoverable() {
    let tmp = tempfile::tempdir().unwrap();
    assert_eq!(history(tmp.path()).latest_recoverable(Path::new("/w/app")), None);
}

#[test]
fn newest_transcript_wins() {
    let tmp = tempfile::tempdir().unwrap();
    let history = history(tmp.path());
    let folder = Path::new("/w/app");
    write_transcript(&history, folder, "old", Duration::from_secs(600));
    write_transcript(&history, folder, "new", Duration::from_secs(5));
    write_transcript(&history, folder, "middle", Duration::from_secs(60));
    fs::write(history.transcript_dir(folder).join("notes.txt"), "x").unwrap();

    let latest = history.latest_recoverable(folder).expect("recoverable");
    assert_eq!(latest.id, "new");
}

#[test]
fn transcripts_are_scoped_per_folder() {
    let tmp = tempfile::tempdir().unwrap();
    let history = history(tmp.path());
    write_transcript(&history, Path::new("/w/a"), "a1", Duration::ZERO);
    assert_eq!(history.latest_recoverable(Path::new("/w/b")), None);
}

#[test]
fn handoff_round_trip_and_matching_rule() {
    let tmp = tempfile::tempdir().unwrap();
    let history = history(tmp.path());
    let folder = Path::new("/w/app");
    assert!(!history.has_close_handoff(folder, None));

    history.record_close_handoff(folder, "s1").unwrap();
    let handoff = history.close_handoff(folder).expect("handoff");
    assert_eq!(handoff.session_id, "s1");

    let closed = RecoverableSession {
        id: "s1".into(),
        modified: chrono::Utc::now(),
    };
    let later = RecoverableSession {
        id: "s2".into(),
        modified: chrono::Utc::now(),
    };
    assert!(history.has_close_handoff(folder, Some(&closed)));
    assert!(history.has_close_handoff(folder, None));
    // A newer session than the one closed was abandoned, not closed.
    assert!(!history.has_close_handoff(folder, Some(&later)));
}

#[test]
fn latest_handoff_replaces_earlier_one() {
    let tmp = tempfile::tempdir().unwrap();
    let history = history(tmp.path());
    let folder = Path::new("/w/app");
    history.record_close_handoff(folder, "s1").unwrap();
    history.record_close_handoff(folder, "s2").unwrap();
    assert_eq!(history.close_handoff(folder).unwrap().session_id, "s2");
}

#[test]
fn corrupt_handoff_is_ignored() {
    let tmp = tempfile::tempdir().unwrap();
    let history = history(tmp.path());
    let folder = Path::new("/w/app");
    let dir = tmp.path().join("state/handoffs");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(format!("{}.json", folder_key(folder))), "{oops").unwrap();
    assert_eq!(history.close_handoff(folder), None);
    assert!(!history.has_close_handoff(folder, None));
}
