#![forbid(unsafe_code)]

//! `agent-relay`: supervises one agent process per project folder and
//! relays it to WebSocket clients.
//!
//! Bootstraps configuration, reaps processes orphaned by a previous
//! instance, then serves `/ws` until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use agent_relay::config::GlobalConfig;
use agent_relay::events::{EventBus, LifecycleEvent};
use agent_relay::orchestrator::process_tree::{ProcessTable, SystemProcessTable};
use agent_relay::orchestrator::reaper::OrphanReaper;
use agent_relay::orchestrator::supervisor::{SessionSupervisor, SupervisorConfig};
use agent_relay::persistence::debounce::DebouncedRecordWriter;
use agent_relay::persistence::history::SessionHistory;
use agent_relay::persistence::record_store::RecordStore;
use agent_relay::server::{self, AppState};
use agent_relay::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-relay", about = "Agent session relay server", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-relay server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    config.apply_env_overrides()?;
    std::fs::create_dir_all(&config.state_dir)
        .map_err(|err| AppError::Config(format!("cannot create state_dir: {err}")))?;
    let config = Arc::new(config);
    info!("configuration loaded");

    let bus = Arc::new(EventBus::with_tracing());
    let table: Arc<dyn ProcessTable> = Arc::new(SystemProcessTable::new());
    let store = RecordStore::new(config.records_path());

    // ── Reap orphans before accepting clients ───────────
    OrphanReaper::new(
        store.clone(),
        Arc::clone(&table),
        Arc::clone(&bus),
        config.recovery.max_record_age(),
        config.idle.kill_escalation(),
    )
    .reap(Utc::now());

    // ── Build the supervisor ────────────────────────────
    let records = DebouncedRecordWriter::new(
        store,
        config.recovery.persist_debounce(),
        Arc::clone(&bus),
    );
    let history = SessionHistory::new(config.history_dir.clone(), config.handoff_dir());
    let supervisor = SessionSupervisor::start(
        SupervisorConfig::from_global(&config),
        history,
        records,
        table,
        Arc::clone(&bus),
        CancellationToken::new(),
    );

    // ── Bind and serve ──────────────────────────────────
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|err| {
            AppError::Config(format!("failed to bind {}: {err}", config.bind_addr))
        })?;
    bus.emit(LifecycleEvent::Start {
        pid: std::process::id(),
        bind_addr: config.bind_addr.to_string(),
    });

    // Stops the listener only; the supervisor is shut down separately below.
    let ct = CancellationToken::new();
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        supervisor: Arc::clone(&supervisor),
        shutdown: ct.clone(),
    });
    let server_handle = tokio::spawn(async move {
        if let Err(err) = server::serve(listener, state).await {
            error!(%err, "relay server failed");
        }
    });

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();
    let _ = server_handle.await;

    let sessions = supervisor.shutdown().await;
    bus.emit(LifecycleEvent::Shutdown {
        reason: "signal".into(),
        sessions,
    });
    info!("agent-relay shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
