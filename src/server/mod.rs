//! HTTP/WebSocket endpoint for relay clients.
//!
//! `GET /ws` upgrades to the client WebSocket handled in [`connection`];
//! `GET /health` answers `ok` so liveness can be probed without opening a
//! session.

pub mod connection;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::GlobalConfig;
use crate::orchestrator::supervisor::SessionSupervisor;
use crate::{AppError, Result};

/// Shared state for every connection.
pub struct AppState {
    /// Global configuration.
    pub config: Arc<GlobalConfig>,
    /// Live-session registry.
    pub supervisor: Arc<SessionSupervisor>,
    /// Fires when the server is shutting down; open sockets close.
    pub shutdown: CancellationToken,
}

/// Handler for `GET /health`.
async fn health() -> &'static str {
    "ok"
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, state))
}

/// Routes served by the relay.
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve on `listener` until `state.shutdown` fires.
///
/// # Errors
///
/// Returns `AppError::Transport` if the server stops with an I/O error.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let addr = listener
        .local_addr()
        .map_err(|err| AppError::Transport(format!("listener has no address: {err}")))?;
    let shutdown = state.shutdown.clone();

    info!(%addr, "relay listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|err| AppError::Transport(format!("server error: {err}")))?;

    info!("relay listener shut down");
    Ok(())
}

/// Immediate, non-hidden subdirectories of `root`, sorted.
#[must_use]
pub fn list_folders(root: &Path) -> Vec<String> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(root = %root.display(), %err, "cannot list projects root");
            return Vec::new();
        }
    };

    let mut folders: Vec<String> = entries
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir()))
        .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        .map(|entry| entry.path().to_string_lossy().into_owned())
        .collect();
    folders.sort();
    folders
}

/// Resolve a client-supplied folder to a canonical directory under `root`.
///
/// Returns `None` when the path no longer exists, is not a directory, or
/// escapes the projects root.
#[must_use]
pub fn resolve_folder(root: &Path, requested: &str) -> Option<PathBuf> {
    let canonical = Path::new(requested).canonicalize().ok()?;
    (canonical.is_dir() && canonical.starts_with(root) && canonical != root).then_some(canonical)
}
