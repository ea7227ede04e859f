//! Shared fixtures for integration tests.
//!
//! The agent is played by `sh -c <script>`: the supervisor appends
//! `--session-id <id>` (or `--resume <id>`), which the script sees as
//! `$1 $2`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use agent_relay::config::GlobalConfig;
use agent_relay::events::{EventBus, LifecycleEvent};
use agent_relay::orchestrator::process_tree::{ProcessTable, SystemProcessTable};
use agent_relay::orchestrator::supervisor::{SessionOutput, SessionSupervisor, SupervisorConfig};
use agent_relay::persistence::debounce::DebouncedRecordWriter;
use agent_relay::persistence::history::SessionHistory;
use agent_relay::persistence::record_store::RecordStore;

/// Answers every stdin line with an assistant line and a result line.
pub const ECHO_AGENT: &str = r#"while read line; do
  echo '{"type":"assistant","message":"working"}'
  echo '{"type":"result","subtype":"success"}'
done"#;

/// Answers one prompt, then exits with status 3.
pub const ONE_SHOT_AGENT: &str = r#"read line
echo '{"type":"result","subtype":"success"}'
exit 3"#;

/// Ignores SIGTERM and never reads stdin; only a forced kill stops it.
pub const STUBBORN_AGENT: &str = "trap '' TERM; while :; do sleep 0.05; done";

/// Temporary projects root, state and history dirs plus a parsed config.
pub struct Fixture {
    pub tmp: TempDir,
    pub config: GlobalConfig,
}

impl Fixture {
    /// Config whose agent runs `script`, with one project folder `app`.
    pub fn new(script: &str) -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("projects");
        std::fs::create_dir_all(root.join("app")).expect("project dir");
        std::fs::create_dir_all(root.join("other")).expect("project dir");

        let raw = format!(
            r#"
projects_root = "{root}"
state_dir = "{state}"
history_dir = "{history}"
agent_cli = "sh"
bind_addr = "127.0.0.1:0"
history_backlog = 50

[idle]
timeout_ms = 60000
max_idle_ms = 120000
recheck_ms = 1000
kill_escalation_ms = 300

[recovery]
persist_debounce_ms = 20
"#,
            root = root.display(),
            state = tmp.path().join("state").display(),
            history = tmp.path().join("history").display(),
        );
        let mut config = GlobalConfig::from_toml_str(&raw).expect("valid config");
        config.agent_cli_args = vec!["-c".into(), script.into(), "agent".into()];
        Self { tmp, config }
    }

    /// Shrink the idle thresholds so expiry happens within a test.
    pub fn with_fast_idle(mut self) -> Self {
        self.config.idle.timeout_ms = 150;
        self.config.idle.max_idle_ms = 2000;
        self.config.idle.recheck_ms = 50;
        self
    }

    /// Canonical path of project folder `name`.
    pub fn folder(&self, name: &str) -> PathBuf {
        self.config.projects_root.join(name)
    }

    pub fn history(&self) -> SessionHistory {
        SessionHistory::new(self.config.history_dir.clone(), self.config.handoff_dir())
    }

    pub fn store(&self) -> RecordStore {
        RecordStore::new(self.config.records_path())
    }

    /// Simulate the agent leaving a transcript for `session_id`.
    pub fn write_transcript(&self, folder: &Path, session_id: &str) {
        let dir = self.history().transcript_dir(folder);
        std::fs::create_dir_all(&dir).expect("transcript dir");
        std::fs::write(dir.join(format!("{session_id}.jsonl")), "{}\n").expect("transcript");
    }

    /// A supervisor over this fixture plus a recorder of its lifecycle events.
    pub fn supervisor(&self) -> (Arc<SessionSupervisor>, Arc<Mutex<Vec<LifecycleEvent>>>) {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(move |event| sink.lock().unwrap().push(event.event.clone()));

        let table: Arc<dyn ProcessTable> = Arc::new(SystemProcessTable::new());
        let records = DebouncedRecordWriter::new(
            self.store(),
            self.config.recovery.persist_debounce(),
            Arc::clone(&bus),
        );
        let supervisor = SessionSupervisor::start(
            SupervisorConfig::from_global(&self.config),
            self.history(),
            records,
            table,
            bus,
            CancellationToken::new(),
        );
        (supervisor, seen)
    }
}

/// Next output within five seconds.
pub async fn next_output(rx: &mut broadcast::Receiver<SessionOutput>) -> SessionOutput {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("agent output in time")
        .expect("output channel open")
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within five seconds");
}
